use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

use super::{Context, Cq, Pd, Qp, Verbs};
use crate::bindings::*;
use crate::fabric::{self, CmEventKind, ConnKey, ConnParams, QpCaps};
use crate::utils::interop::from_c_ret_errno;

raw_handle! {
    /// Handle of `*mut rdma_event_channel`.
    RdmaEventChannel => rdma_event_channel
}

struct ChannelInner(RdmaEventChannel);

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // SAFETY: FFI; every id reporting to the channel holds a reference
        // to it and is therefore already destroyed.
        unsafe { rdma_destroy_event_channel(self.0.as_ptr()) };
    }
}

/// Connection-manager event channel.
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub(super) fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let chan = unsafe { rdma_create_event_channel() };
        let chan = NonNull::new(chan).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(ChannelInner(RdmaEventChannel(chan))),
        })
    }
}

impl fabric::EventChannel<Verbs> for EventChannel {
    fn create_id(&self, ctx: Option<&Context>) -> io::Result<CmId> {
        let mut id = ptr::null_mut();

        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                self.inner.0.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        from_c_ret_errno(ret)?;

        let id = NonNull::new(id).ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
        Ok(CmId::wrap(id, ctx.cloned(), self.inner.clone()))
    }

    fn get_event(&self) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();

        // SAFETY: FFI.
        let ret = unsafe { rdma_get_cm_event(self.inner.0.as_ptr(), &mut event) };
        from_c_ret_errno(ret)?;
        let event = NonNull::new(event).ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;

        // SAFETY: `rdma_get_cm_event` returned a valid event.
        let raw = unsafe { event.as_ref() };
        let kind = CmEventKind::from_raw(raw.event as u32);

        // A connect request carries a fresh id that reports on the
        // listener's channel and is owned by whoever handles the request.
        let new_id = match (kind, NonNull::new(raw.id)) {
            (CmEventKind::ConnectRequest, Some(id)) => {
                Some(CmId::wrap(id, None, self.inner.clone()))
            }
            _ => None,
        };

        Ok(CmEvent {
            event,
            kind,
            acked: false,
            new_id,
        })
    }
}

/// A connection-manager event, acknowledged when dropped.
///
/// An untaken connection id carried by a connect request is destroyed right
/// after the acknowledgement, which refuses the request.
pub struct CmEvent {
    event: NonNull<rdma_cm_event>,
    kind: CmEventKind,
    acked: bool,
    new_id: Option<CmId>,
}

// SAFETY: the event is only read until acknowledged.
unsafe impl Send for CmEvent {}

impl CmEvent {
    fn raw(&self) -> &rdma_cm_event {
        // SAFETY: the event stays valid until acknowledged, which consumes
        // or drops `self`.
        unsafe { self.event.as_ref() }
    }

    fn ack_raw(&mut self) -> io::Result<()> {
        if self.acked {
            return Ok(());
        }
        self.acked = true;

        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_ack_cm_event(self.event.as_ptr()) })
    }
}

impl fabric::CmEvent<Verbs> for CmEvent {
    fn kind(&self) -> CmEventKind {
        self.kind
    }

    fn status(&self) -> i32 {
        self.raw().status
    }

    fn conn(&self) -> ConnKey {
        ConnKey::from_raw(self.raw().id as usize)
    }

    fn take_id(&mut self) -> Option<CmId> {
        self.new_id.take()
    }

    fn ack(mut self) -> io::Result<()> {
        self.ack_raw()
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        if let Err(e) = self.ack_raw() {
            log::warn!("rdread: failed to acknowledge {} event: {}", self.kind, e);
        }
    }
}

raw_handle! {
    /// Handle of `*mut rdma_cm_id`.
    RdmaCmId => rdma_cm_id
}

pub(super) struct CmIdInner {
    id: RdmaCmId,
    _ctx: Option<Context>,
    _channel: Arc<ChannelInner>,
}

impl CmIdInner {
    pub(super) fn as_raw(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        // SAFETY: FFI. Blocks until every event of this id is acknowledged;
        // the queue pair holds a reference to this id and is already gone.
        let ret = unsafe { rdma_destroy_id(self.id.as_ptr()) };
        if let Err(e) = from_c_ret_errno(ret) {
            log::warn!("rdread: failed to destroy connection id: {}", e);
        }
    }
}

/// Connection-manager id.
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl CmId {
    fn wrap(id: NonNull<rdma_cm_id>, ctx: Option<Context>, channel: Arc<ChannelInner>) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                id: RdmaCmId(id),
                _ctx: ctx,
                _channel: channel,
            }),
        }
    }

    fn raw(&self) -> *mut rdma_cm_id {
        self.inner.as_raw()
    }
}

/// Write `addr` into a `sockaddr_storage` as the matching `sockaddr_in` or
/// `sockaddr_in6`.
fn to_sockaddr(addr: SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for any
            // socket address.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
        }
    }
    storage
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

impl fabric::CmId<Verbs> for CmId {
    fn key(&self) -> ConnKey {
        ConnKey::from_raw(self.raw() as usize)
    }

    fn context(&self) -> Option<Context> {
        // SAFETY: the id is valid while `self` lives.
        let verbs = unsafe { (*self.raw()).verbs };
        NonNull::new(verbs).map(Context::borrowed)
    }

    fn resolve_addr(&self, dst: SocketAddr, timeout: Duration) -> io::Result<()> {
        let mut dst = to_sockaddr(dst);

        // SAFETY: FFI.
        let ret = unsafe {
            rdma_resolve_addr(
                self.raw(),
                ptr::null_mut(),
                (&mut dst as *mut libc::sockaddr_storage).cast(),
                timeout_ms(timeout),
            )
        };
        from_c_ret_errno(ret)
    }

    fn resolve_route(&self, timeout: Duration) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_resolve_route(self.raw(), timeout_ms(timeout)) })
    }

    fn bind_addr(&self, addr: SocketAddr) -> io::Result<()> {
        let mut addr = to_sockaddr(addr);

        // SAFETY: FFI.
        let ret = unsafe {
            rdma_bind_addr(
                self.raw(),
                (&mut addr as *mut libc::sockaddr_storage).cast(),
            )
        };
        from_c_ret_errno(ret)
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_listen(self.raw(), backlog) })
    }

    fn create_qp(&self, pd: &Pd, cq: &Cq, caps: &QpCaps) -> io::Result<Qp> {
        // SAFETY: all-zero is a valid `ibv_qp_init_attr`.
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq.as_raw();
        attr.recv_cq = cq.as_raw();
        attr.cap.max_send_wr = caps.max_send_wr;
        attr.cap.max_recv_wr = caps.max_recv_wr;
        attr.cap.max_send_sge = caps.max_send_sge;
        attr.cap.max_recv_sge = caps.max_recv_sge;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = caps.sq_sig_all as i32;

        // librdmacm opens its own context for each device, so an id taken
        // from a connect request does not carry the context `pd` belongs to.
        // SAFETY: the id and the protection domain are valid.
        unsafe {
            let pd_ctx = (*pd.as_raw()).context;
            if (*self.raw()).verbs != pd_ctx {
                log::debug!("rdread: rebinding connection id to the protection domain's device");
                (*self.raw()).verbs = pd_ctx;
            }
        }

        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_create_qp(self.raw(), pd.as_raw(), &mut attr) })?;

        // SAFETY: `rdma_create_qp` stores the new QP in the id.
        let qp = unsafe { (*self.raw()).qp };
        let qp = NonNull::new(qp).ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
        Ok(Qp::new(qp, self.inner.clone(), pd.clone()))
    }

    fn connect(&self, params: &ConnParams) -> io::Result<()> {
        let mut param = conn_param(params);
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_connect(self.raw(), &mut param) })
    }

    fn accept(&self, params: &ConnParams) -> io::Result<()> {
        let mut param = conn_param(params);
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_accept(self.raw(), &mut param) })
    }

    fn reject(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_reject(self.raw(), ptr::null(), 0) })
    }

    fn disconnect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret_errno(unsafe { rdma_disconnect(self.raw()) })
    }
}

fn conn_param(params: &ConnParams) -> rdma_conn_param {
    // SAFETY: all-zero is a valid `rdma_conn_param`.
    let mut param: rdma_conn_param = unsafe { mem::zeroed() };
    param.initiator_depth = params.initiator_depth;
    param.responder_resources = params.responder_resources;
    param.retry_count = params.retry_count;
    param
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_sockaddr_layout() {
        let storage = to_sockaddr("10.0.0.2:1717".parse().unwrap());
        // SAFETY: written as `sockaddr_in` above.
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 1717);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 2]);
    }

    #[test]
    fn ipv6_sockaddr_layout() {
        let storage = to_sockaddr("[fe80::1]:7471".parse().unwrap());
        // SAFETY: written as `sockaddr_in6` above.
        let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(sin6.sin6_family, libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(u16::from_be(sin6.sin6_port), 7471);
        assert_eq!(sin6.sin6_addr.s6_addr[0], 0xfe);
        assert_eq!(sin6.sin6_addr.s6_addr[15], 1);
    }
}
