use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use super::qp::{QpShared, SimQp};
use super::{lock, os_err, SimContext, SimCq, SimFabric, SimPd};
use crate::fabric::*;

/// Status reported with `REJECTED` when nobody accepts a connection.
const REJECT_STATUS: i32 = libc::ECONNREFUSED;

struct Pending {
    kind: CmEventKind,
    status: i32,
    conn: ConnKey,
    new_id: Option<Arc<IdShared>>,
}

#[derive(Default)]
pub(super) struct EventQueue {
    events: Mutex<VecDeque<Pending>>,
    cond: Condvar,
    unacked: AtomicUsize,
}

impl EventQueue {
    fn post(&self, kind: CmEventKind, status: i32, conn: ConnKey, new_id: Option<Arc<IdShared>>) {
        lock(&self.events).push_back(Pending {
            kind,
            status,
            conn,
            new_id,
        });
        self.cond.notify_all();
    }

    fn ack_one(&self) {
        self.unacked.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Software connection-manager event channel.
pub struct SimEventChannel {
    fabric: SimFabric,
    queue: Arc<EventQueue>,
}

impl SimEventChannel {
    pub(super) fn new(fabric: SimFabric) -> Self {
        Self {
            fabric,
            queue: Arc::new(EventQueue::default()),
        }
    }

    /// Number of retrieved but unacknowledged events.
    pub fn unacked(&self) -> usize {
        self.queue.unacked.load(Ordering::Acquire)
    }

    /// Number of events delivered but not yet retrieved.
    pub fn pending(&self) -> usize {
        lock(&self.queue.events).len()
    }

    /// Deliver an event of `kind` about `conn`, as if raised by the fabric.
    pub fn inject(&self, kind: CmEventKind, status: i32, conn: ConnKey) {
        self.queue.post(kind, status, conn, None);
    }
}

impl EventChannel<SimFabric> for SimEventChannel {
    fn create_id(&self, ctx: Option<&SimContext>) -> io::Result<SimCmId> {
        let shared = IdShared::new(&self.fabric, &self.queue, IdState {
            ctx: ctx.cloned(),
            ..IdState::default()
        });
        Ok(SimCmId { shared })
    }

    fn get_event(&self) -> io::Result<SimCmEvent> {
        let mut events = lock(&self.queue.events);
        let pending = loop {
            if let Some(p) = events.pop_front() {
                break p;
            }
            events = self
                .queue
                .cond
                .wait(events)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(events);

        self.queue.unacked.fetch_add(1, Ordering::AcqRel);
        Ok(SimCmEvent {
            kind: pending.kind,
            status: pending.status,
            conn: pending.conn,
            new_id: pending.new_id.map(|shared| SimCmId { shared }),
            queue: self.queue.clone(),
            acked: false,
        })
    }
}

/// Software connection-manager event. Acknowledged on drop.
pub struct SimCmEvent {
    kind: CmEventKind,
    status: i32,
    conn: ConnKey,
    new_id: Option<SimCmId>,
    queue: Arc<EventQueue>,
    acked: bool,
}

impl CmEvent<SimFabric> for SimCmEvent {
    fn kind(&self) -> CmEventKind {
        self.kind
    }

    fn status(&self) -> i32 {
        self.status
    }

    fn conn(&self) -> ConnKey {
        self.conn
    }

    fn take_id(&mut self) -> Option<SimCmId> {
        self.new_id.take()
    }

    fn ack(mut self) -> io::Result<()> {
        self.acked = true;
        self.queue.ack_one();
        Ok(())
    }
}

impl Drop for SimCmEvent {
    fn drop(&mut self) {
        if !self.acked {
            self.queue.ack_one();
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    /// Connect request sent (active side) or received (passive side).
    Requested,
    Connected,
    Closed,
}

#[derive(Default)]
struct IdState {
    ctx: Option<SimContext>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    route_resolved: bool,
    listening: bool,
    /// Created from a connect request.
    passive: bool,
    phase: Phase,
    qp: Option<Weak<QpShared>>,
    peer: Option<Weak<IdShared>>,
}

pub(super) struct IdShared {
    key: ConnKey,
    fabric: SimFabric,
    queue: Arc<EventQueue>,
    state: Mutex<IdState>,
}

impl IdShared {
    fn new(fabric: &SimFabric, queue: &Arc<EventQueue>, state: IdState) -> Arc<Self> {
        Arc::new(Self {
            key: ConnKey::from_raw(fabric.next_handle()),
            fabric: fabric.clone(),
            queue: queue.clone(),
            state: Mutex::new(state),
        })
    }

    fn post(&self, kind: CmEventKind, status: i32) {
        self.queue.post(kind, status, self.key, None);
    }

    fn qp(&self) -> Option<Arc<QpShared>> {
        lock(&self.state).qp.as_ref().and_then(Weak::upgrade)
    }

    /// Tear down an established connection from this side: both sides see
    /// `DISCONNECTED`, and further sends fail.
    fn close(&self, notify_self: bool) -> bool {
        let peer = {
            let mut state = lock(&self.state);
            if state.phase != Phase::Connected {
                return false;
            }
            state.phase = Phase::Closed;
            state.peer.take().and_then(|p| p.upgrade())
        };
        if let Some(qp) = self.qp() {
            qp.set_peer(None);
        }
        if let Some(peer) = peer {
            let was_connected = {
                let mut state = lock(&peer.state);
                let connected = state.phase == Phase::Connected;
                if connected {
                    state.phase = Phase::Closed;
                    state.peer = None;
                }
                connected
            };
            if was_connected {
                if let Some(qp) = peer.qp() {
                    qp.set_peer(None);
                }
                peer.post(CmEventKind::Disconnected, 0);
            }
        }
        if notify_self {
            self.post(CmEventKind::Disconnected, 0);
        }
        true
    }

    /// Refuse a pending connect request received by this id.
    fn refuse(&self) -> bool {
        let peer = {
            let mut state = lock(&self.state);
            if !(state.passive && state.phase == Phase::Requested) {
                return false;
            }
            state.phase = Phase::Closed;
            state.peer.take().and_then(|p| p.upgrade())
        };
        if let Some(peer) = peer {
            let mut state = lock(&peer.state);
            state.phase = Phase::Idle;
            state.peer = None;
            drop(state);
            peer.post(CmEventKind::Rejected, REJECT_STATUS);
        }
        true
    }
}

impl Drop for IdShared {
    fn drop(&mut self) {
        let (listening, local) = {
            let state = lock(&self.state);
            (state.listening, state.local)
        };
        if listening {
            if let Some(addr) = local {
                let mut world = self.fabric.world();
                if matches!(world.listeners.get(&addr), Some((key, _)) if *key == self.key) {
                    world.listeners.remove(&addr);
                }
            }
        }

        // Destroying a connected id disconnects it; destroying an id holding
        // an unanswered connect request rejects the request.
        if !self.close(false) {
            self.refuse();
        }
    }
}

/// Software connection-manager id.
pub struct SimCmId {
    shared: Arc<IdShared>,
}

impl SimCmId {
    fn state(&self) -> std::sync::MutexGuard<'_, IdState> {
        lock(&self.shared.state)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local
    }
}

impl CmId<SimFabric> for SimCmId {
    fn key(&self) -> ConnKey {
        self.shared.key
    }

    fn context(&self) -> Option<SimContext> {
        self.state().ctx.clone()
    }

    fn resolve_addr(&self, dst: SocketAddr, _timeout: Duration) -> io::Result<()> {
        let fabric = &self.shared.fabric;
        if !fabric.has_devices() {
            self.shared.post(CmEventKind::AddrError, -libc::ENODEV);
            return Ok(());
        }

        {
            let mut state = self.state();
            state.remote = Some(dst);
            if state.ctx.is_none() {
                state.ctx = Some(SimContext {
                    fabric: fabric.clone(),
                    device: 0,
                });
            }
        }
        self.shared.post(CmEventKind::AddrResolved, 0);
        Ok(())
    }

    fn resolve_route(&self, _timeout: Duration) -> io::Result<()> {
        {
            let mut state = self.state();
            if state.remote.is_none() {
                return Err(os_err(libc::EINVAL));
            }
            state.route_resolved = true;
        }
        self.shared.post(CmEventKind::RouteResolved, 0);
        Ok(())
    }

    fn bind_addr(&self, addr: SocketAddr) -> io::Result<()> {
        let mut state = self.state();
        if state.local.is_some() {
            return Err(os_err(libc::EINVAL));
        }
        let in_use = self
            .shared
            .fabric
            .world()
            .listeners
            .get(&addr)
            .is_some_and(|(_, l)| l.strong_count() > 0);
        if in_use {
            return Err(os_err(libc::EADDRINUSE));
        }
        state.local = Some(addr);
        Ok(())
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        let mut state = self.state();
        let addr = state.local.ok_or_else(|| os_err(libc::EINVAL))?;

        let mut world = self.shared.fabric.world();
        if let Some((key, l)) = world.listeners.get(&addr) {
            if *key != self.shared.key && l.strong_count() > 0 {
                return Err(os_err(libc::EADDRINUSE));
            }
        }
        world
            .listeners
            .insert(addr, (self.shared.key, Arc::downgrade(&self.shared)));
        state.listening = true;
        log::debug!("sim: listening on {} (backlog {})", addr, backlog);
        Ok(())
    }

    fn create_qp(&self, pd: &SimPd, cq: &SimCq, caps: &QpCaps) -> io::Result<SimQp> {
        let mut state = self.state();
        if state.ctx.is_none() {
            return Err(os_err(libc::EINVAL));
        }
        if state.qp.as_ref().is_some_and(|q| q.strong_count() > 0) {
            return Err(os_err(libc::EEXIST));
        }

        let qp = SimQp::new(&self.shared.fabric, pd.id, cq.shared().clone(), *caps);
        state.qp = Some(Arc::downgrade(qp.shared()));
        Ok(qp)
    }

    fn connect(&self, params: &ConnParams) -> io::Result<()> {
        let remote = {
            let state = self.state();
            if !state.route_resolved || state.phase != Phase::Idle {
                return Err(os_err(libc::EINVAL));
            }
            if !state.qp.as_ref().is_some_and(|q| q.strong_count() > 0) {
                return Err(os_err(libc::EINVAL));
            }
            state.remote.ok_or_else(|| os_err(libc::EINVAL))?
        };

        let listener = self.shared.fabric.world().listener(remote);
        let Some(listener) = listener else {
            log::debug!("sim: nobody listens on {}", remote);
            self.shared.post(CmEventKind::Rejected, REJECT_STATUS);
            return Ok(());
        };

        let (ctx, local) = {
            let state = lock(&listener.state);
            (state.ctx.clone(), state.local)
        };
        let local_of_client = self.state().local;
        let new_id = IdShared::new(&self.shared.fabric, &listener.queue, IdState {
            ctx,
            local,
            remote: local_of_client,
            passive: true,
            phase: Phase::Requested,
            peer: Some(Arc::downgrade(&self.shared)),
            ..IdState::default()
        });
        {
            let mut state = self.state();
            state.phase = Phase::Requested;
            state.peer = Some(Arc::downgrade(&new_id));
        }

        log::debug!(
            "sim: connect request to {} (initiator depth {}, responder resources {})",
            remote,
            params.initiator_depth,
            params.responder_resources
        );
        let key = new_id.key;
        listener
            .queue
            .post(CmEventKind::ConnectRequest, 0, key, Some(new_id));
        Ok(())
    }

    fn accept(&self, _params: &ConnParams) -> io::Result<()> {
        let (peer, qp) = {
            let state = self.state();
            if !(state.passive && state.phase == Phase::Requested) {
                return Err(os_err(libc::EINVAL));
            }
            let qp = state
                .qp
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| os_err(libc::EINVAL))?;
            let peer = state
                .peer
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| os_err(libc::ECONNABORTED))?;
            (peer, qp)
        };

        let peer_qp = {
            let mut state = lock(&peer.state);
            let peer_qp = state.qp.as_ref().and_then(Weak::upgrade);
            match peer_qp {
                Some(q) if state.phase == Phase::Requested => {
                    state.phase = Phase::Connected;
                    q
                }
                _ => return Err(os_err(libc::ECONNABORTED)),
            }
        };

        qp.set_peer(Some(Arc::downgrade(&peer_qp)));
        peer_qp.set_peer(Some(Arc::downgrade(&qp)));
        self.state().phase = Phase::Connected;

        peer.post(CmEventKind::Established, 0);
        self.shared.post(CmEventKind::Established, 0);
        Ok(())
    }

    fn reject(&self) -> io::Result<()> {
        if self.shared.refuse() {
            Ok(())
        } else {
            Err(os_err(libc::EINVAL))
        }
    }

    fn disconnect(&self) -> io::Result<()> {
        if self.shared.close(true) {
            Ok(())
        } else {
            Err(os_err(libc::ENOTCONN))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn connect_without_listener_is_rejected() {
        let fabric = SimFabric::with_device("rxe_0");
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id(None).unwrap();
        id.resolve_addr(addr("10.0.0.2:1717"), Duration::ZERO).unwrap();
        id.resolve_route(Duration::ZERO).unwrap();

        let ctx = id.context().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cc = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &cc).unwrap();
        let _qp = id.create_qp(&pd, &cq, &crate::config::CLIENT_QP_CAPS).unwrap();
        id.connect(&crate::config::CONN_PARAMS).unwrap();

        let kinds = (0..3)
            .map(|_| {
                let ev = channel.get_event().unwrap();
                (ev.kind(), ev.status())
            })
            .collect::<Vec<_>>();
        assert_eq!(kinds[0], (CmEventKind::AddrResolved, 0));
        assert_eq!(kinds[1], (CmEventKind::RouteResolved, 0));
        assert_eq!(kinds[2], (CmEventKind::Rejected, REJECT_STATUS));
    }

    #[test]
    fn connect_requires_qp_and_route() {
        let fabric = SimFabric::with_device("rxe_0");
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id(None).unwrap();
        assert!(id.connect(&crate::config::CONN_PARAMS).is_err());
        id.resolve_addr(addr("10.0.0.2:1717"), Duration::ZERO).unwrap();
        id.resolve_route(Duration::ZERO).unwrap();
        assert!(id.connect(&crate::config::CONN_PARAMS).is_err());
    }

    #[test]
    fn listener_lifecycle() {
        let fabric = SimFabric::with_device("rxe_0");
        let channel = fabric.create_event_channel().unwrap();

        let a = channel.create_id(None).unwrap();
        a.bind_addr(addr("0.0.0.0:1717")).unwrap();
        a.listen(1).unwrap();
        assert_eq!(fabric.listeners(), 1);

        let b = channel.create_id(None).unwrap();
        let err = b.bind_addr(addr("0.0.0.0:1717")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));

        drop(a);
        assert_eq!(fabric.listeners(), 0);
        b.bind_addr(addr("0.0.0.0:1717")).unwrap();
        b.listen(1).unwrap();
        assert_eq!(b.local_addr(), Some(addr("0.0.0.0:1717")));
    }

    #[test]
    fn wildcard_listener_matches_any_host() {
        let fabric = SimFabric::with_device("rxe_0");
        let server = fabric.create_event_channel().unwrap();
        let ctx = fabric.devices().unwrap()[0].open().unwrap();
        let listener = server.create_id(Some(&ctx)).unwrap();
        listener.bind_addr(addr("0.0.0.0:1717")).unwrap();
        listener.listen(1).unwrap();

        let client = fabric.create_event_channel().unwrap();
        let id = client.create_id(None).unwrap();
        id.resolve_addr(addr("192.168.0.5:1717"), Duration::ZERO).unwrap();
        id.resolve_route(Duration::ZERO).unwrap();
        let cctx = id.context().unwrap();
        let pd = cctx.alloc_pd().unwrap();
        let cc = cctx.create_comp_channel().unwrap();
        let cq = cctx.create_cq(16, &cc).unwrap();
        let _qp = id.create_qp(&pd, &cq, &crate::config::CLIENT_QP_CAPS).unwrap();
        id.connect(&crate::config::CONN_PARAMS).unwrap();

        let mut ev = server.get_event().unwrap();
        assert_eq!(ev.kind(), CmEventKind::ConnectRequest);
        let new_id = ev.take_id().unwrap();
        assert_eq!(ev.conn(), new_id.key());
        assert!(new_id.context().is_some());
        ev.ack().unwrap();

        // Refusing the request rejects the client.
        new_id.reject().unwrap();
        let _ = client.get_event().unwrap();
        let _ = client.get_event().unwrap();
        let ev = client.get_event().unwrap();
        assert_eq!(ev.kind(), CmEventKind::Rejected);
        assert_ne!(ev.status(), 0);
    }
}
