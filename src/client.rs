//! The active side: connect, receive the descriptor, read the remote buffer.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::completion::wait_for_completions;
use crate::config::{CLIENT_QP_CAPS, CONN_PARAMS, CQ_DEPTH, RESOLVE_TIMEOUT};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::event::expect_event;
use crate::fabric::*;
use crate::region::RegisteredBuf;

const META_WR_ID: u64 = 1;
const READ_WR_ID: u64 = 2;

/// Progress of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Init,
    AddrResolving,
    AddrResolved,
    RouteResolving,
    RouteResolved,
    QpReady,
    Connecting,
    Established,
    Disconnected,
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn advance(state: &mut ClientState, next: ClientState) {
    log::debug!("client: {} -> {}", state, next);
    *state = next;
}

/// An established connection to a server.
///
/// Dropping the session releases its resources in reverse creation order.
pub struct ClientSession<F: Fabric> {
    // Field order is drop order.
    qp: F::Qp,
    /// Read buffers whose READ may still be in flight; freed after the queue pair.
    orphans: Vec<RegisteredBuf<F::Mr>>,
    meta: RegisteredBuf<F::Mr>,
    _cq: F::Cq,
    comp_channel: F::CompChannel,
    pd: F::Pd,
    id: F::CmId,
    channel: F::EventChannel,

    state: ClientState,
    descriptor: Option<Descriptor>,
}

impl<F: Fabric> ClientSession<F> {
    /// Connect to the server listening at `server`.
    ///
    /// The descriptor receive is posted before the connection is requested,
    /// so the server's message always finds it. Any failure aborts the
    /// attempt; start a new session to retry.
    pub fn connect(fabric: &F, server: SocketAddr) -> Result<Self> {
        let mut state = ClientState::Init;
        Self::establish(fabric, server, &mut state).map_err(|e| {
            log::error!("rdread: client failed in state {}: {}", state, e);
            e
        })
    }

    fn establish(fabric: &F, server: SocketAddr, state: &mut ClientState) -> Result<Self> {
        let channel = fabric
            .create_event_channel()
            .map_err(Error::setup("rdma_create_event_channel"))?;
        let id = channel
            .create_id(None)
            .map_err(Error::setup("rdma_create_id"))?;

        id.resolve_addr(server, RESOLVE_TIMEOUT)
            .map_err(Error::setup("rdma_resolve_addr"))?;
        advance(state, ClientState::AddrResolving);
        expect_event::<F>(&channel, CmEventKind::AddrResolved)?;
        advance(state, ClientState::AddrResolved);

        id.resolve_route(RESOLVE_TIMEOUT)
            .map_err(Error::setup("rdma_resolve_route"))?;
        advance(state, ClientState::RouteResolving);
        expect_event::<F>(&channel, CmEventKind::RouteResolved)?;
        advance(state, ClientState::RouteResolved);
        log::info!("trying to connect to server at: {}", server);

        let ctx = id.context().ok_or_else(|| Error::SetupFailed {
            step: "rdma_resolve_route",
            source: io::Error::new(io::ErrorKind::NotFound, "no device bound to the route"),
        })?;
        let pd = ctx.alloc_pd().map_err(Error::setup("ibv_alloc_pd"))?;
        let comp_channel = ctx
            .create_comp_channel()
            .map_err(Error::setup("ibv_create_comp_channel"))?;
        let cq = ctx
            .create_cq(CQ_DEPTH, &comp_channel)
            .map_err(Error::setup("ibv_create_cq"))?;
        cq.req_notify().map_err(Error::setup("ibv_req_notify_cq"))?;
        let qp = id
            .create_qp(&pd, &cq, &CLIENT_QP_CAPS)
            .map_err(Error::setup("rdma_create_qp"))?;
        log::info!("client QP created: qpn={:#x}", qp.qp_num());
        advance(state, ClientState::QpReady);

        let meta = RegisteredBuf::zeroed(&pd, Descriptor::SIZE, Permission::LOCAL_WRITE)?;
        // SAFETY: `meta` is dropped after `qp`.
        unsafe { qp.post_recv(&RecvWr::new(META_WR_ID, meta.sge())) }
            .map_err(Error::post("descriptor RECV"))?;

        id.connect(&CONN_PARAMS)
            .map_err(Error::setup("rdma_connect"))?;
        advance(state, ClientState::Connecting);
        expect_event::<F>(&channel, CmEventKind::Established)?;
        advance(state, ClientState::Established);
        log::info!("the client is connected successfully");

        Ok(Self {
            qp,
            orphans: Vec::new(),
            meta,
            _cq: cq,
            comp_channel,
            pd,
            id,
            channel,
            state: *state,
            descriptor: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The descriptor received from the server, once fetched.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor
    }

    fn check_established(&self) -> Result<()> {
        if self.state == ClientState::Established {
            Ok(())
        } else {
            Err(Error::SetupFailed {
                step: "session",
                source: io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("session is {}", self.state),
                ),
            })
        }
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.state = ClientState::Failed;
        Err(e)
    }

    /// Wait for the descriptor the server sends once the connection is up.
    pub fn fetch_descriptor(&mut self) -> Result<Descriptor> {
        if let Some(desc) = self.descriptor {
            return Ok(desc);
        }
        self.check_established()?;

        let wc = match wait_for_completions(&self.comp_channel, 1) {
            Ok(wcs) => wcs[0],
            Err(e) => return self.fail(e),
        };
        if wc.wr_id() != META_WR_ID || wc.byte_len() != Descriptor::SIZE {
            log::error!(
                "rdread: expected a {}-byte descriptor, got {} bytes (wr {})",
                Descriptor::SIZE,
                wc.byte_len(),
                wc.wr_id()
            );
            return self.fail(Error::Malformed(wc.byte_len()));
        }

        let desc = Descriptor::decode(&self.meta)?;
        log::info!(
            "server buffer: addr={:#x} len={} rkey={:#x}",
            desc.addr,
            desc.len,
            desc.rkey
        );
        self.descriptor = Some(desc);
        Ok(desc)
    }

    /// Read the whole remote buffer `desc` describes.
    ///
    /// The returned buffer has exactly `desc.len` bytes.
    pub fn read_remote(&mut self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.check_established()?;
        if desc.len == 0 {
            return Ok(Vec::new());
        }

        let buf = RegisteredBuf::zeroed(
            &self.pd,
            desc.len as usize,
            Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE,
        )?;
        let wr = SendWr::read(READ_WR_ID, buf.sge(), desc).signaled();
        // SAFETY: `buf` is either returned after the READ completes or kept
        // until the queue pair is gone.
        if let Err(e) = unsafe { self.qp.post_send(&wr) } {
            return self.fail(Error::post("RDMA READ")(e));
        }

        let start = quanta::Instant::now();
        match wait_for_completions(&self.comp_channel, 1) {
            Ok(_) => {
                log::info!(
                    "RDMA READ of {} bytes completed in {:?}",
                    desc.len,
                    start.elapsed()
                );
                Ok(buf.deregister().into_vec())
            }
            Err(e @ Error::WorkRequestFailed { .. }) => self.fail(e),
            Err(e) => {
                // The READ may still be running.
                self.orphans.push(buf);
                self.fail(e)
            }
        }
    }

    /// Fetch the descriptor if needed, then read the buffer it describes.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let desc = self.fetch_descriptor()?;
        self.read_remote(&desc)
    }

    /// Close the connection; the server observes `DISCONNECTED`.
    pub fn disconnect(&mut self) -> Result<()> {
        self.check_established()?;
        self.id
            .disconnect()
            .map_err(Error::transport("rdma_disconnect"))?;
        expect_event::<F>(&self.channel, CmEventKind::Disconnected)?;
        advance(&mut self.state, ClientState::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::Config;
    use crate::server::ServerSession;
    use crate::sim::SimFabric;

    #[test]
    fn address_error_fails_the_attempt() {
        let fabric = SimFabric::new(&[]);
        let err = ClientSession::connect(&fabric, "10.0.0.1:1717".parse().unwrap())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::RemoteRejected {
                kind: CmEventKind::AddrError,
                ..
            }
        ));
    }

    #[test]
    fn no_listener_is_rejected() {
        let fabric = SimFabric::with_device("rxe_0");
        let err = ClientSession::connect(&fabric, "10.0.0.1:1717".parse().unwrap())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::RemoteRejected {
                kind: CmEventKind::Rejected,
                ..
            }
        ));
        // Everything created by the attempt is released.
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn rejected_read_post_fails_the_session() {
        let fabric = SimFabric::with_device("rxe_0");
        let mut server = ServerSession::new(&fabric, &Config::default()).unwrap();
        // CONNECT_REQUEST, ESTABLISHED.
        let server = thread::spawn(move || {
            server.process_next_event().unwrap();
            server.process_next_event().unwrap();
            server
        });

        let mut client = ClientSession::connect(&fabric, "0.0.0.0:1717".parse().unwrap()).unwrap();
        let desc = client.fetch_descriptor().unwrap();

        // The server goes away and takes its queue pair with it.
        drop(server.join().unwrap());

        let err = client.read_remote(&desc).err().unwrap();
        assert!(matches!(err, Error::PostFailed { .. }));
        assert_eq!(client.state(), ClientState::Failed);
    }
}
