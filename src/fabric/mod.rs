//! Provider-neutral view of the RDMA resources the protocol touches.
//!
//! A [`Fabric`] bundles the resource types of one provider: the hardware
//! provider in [`crate::verbs`] (feature `verbs`) or the in-process software
//! fabric in [`crate::sim`]. The session logic in [`crate::client`] and
//! [`crate::server`] is written once against these traits.
//!
//! Every resource handle releases its underlying object on drop. Dependent
//! objects must be dropped before the objects they were created from; the
//! sessions enforce this through their field order.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

mod event;
mod perm;
mod wc;
mod wr;

pub use self::event::CmEventKind;
pub use self::perm::Permission;
pub use self::wc::{Wc, WcOpcode, WcStatus};
pub use self::wr::{RecvWr, SendOp, SendWr, Sge};

/// Queue pair capacities requested at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    /// Generate a completion for every send-queue work request.
    pub sq_sig_all: bool,
}

/// Reliability parameters exchanged on connect and accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnParams {
    /// Outstanding RDMA READs this side may issue.
    pub initiator_depth: u8,
    /// Outstanding RDMA READs this side accepts from the peer.
    pub responder_resources: u8,
    pub retry_count: u8,
}

/// Identifies the connection an event refers to.
///
/// Keys are unique among the live connection ids of one fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey(usize);

impl ConnKey {
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Get the raw value of this key.
    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// An RDMA provider.
pub trait Fabric: Sized {
    type Device: Device<Self>;
    type Context: DeviceContext<Self>;
    type Pd: ProtectionDomain<Mr = Self::Mr>;
    type Mr: MemoryRegion;
    type CompChannel: CompChannel;
    type Cq: CompletionQueue;
    type EventChannel: EventChannel<Self>;
    type Event: CmEvent<Self>;
    type CmId: CmId<Self>;
    type Qp: QueuePair;

    /// List the RDMA devices present.
    fn devices(&self) -> io::Result<Vec<Self::Device>>;

    /// Create a channel on which connection-manager events are delivered.
    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;
}

/// An RDMA device that has not been opened.
pub trait Device<F: Fabric> {
    /// Get the name of this device (e.g., `rxe_0`).
    fn name(&self) -> io::Result<String>;

    /// Open the device.
    fn open(&self) -> io::Result<F::Context>;
}

/// An opened device. Cloning yields another handle to the same context.
pub trait DeviceContext<F: Fabric>: Clone {
    fn alloc_pd(&self) -> io::Result<F::Pd>;

    fn create_comp_channel(&self) -> io::Result<F::CompChannel>;

    /// Create a completion queue of `depth` entries reporting to `channel`.
    fn create_cq(&self, depth: u32, channel: &F::CompChannel) -> io::Result<F::Cq>;
}

/// Protection domain.
pub trait ProtectionDomain {
    type Mr: MemoryRegion;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory area must stay valid (and must not move) until the returned
    /// region is deregistered or dropped.
    unsafe fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<Self::Mr>;
}

/// A registered memory region. Dropping it deregisters the memory.
pub trait MemoryRegion {
    fn addr(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lkey(&self) -> u32;

    fn rkey(&self) -> u32;

    /// Deregister the memory region, reporting failures.
    fn dereg(self) -> io::Result<()>;
}

/// Completion event channel, shared by any number of completion queues.
pub trait CompChannel {
    /// Handle to the queue that raised a completion event.
    type Cq: CompletionQueue;

    /// Block until an armed completion queue reports a completion.
    ///
    /// The event must be acknowledged with [`CompletionQueue::ack_events`]
    /// on the returned queue.
    fn get_cq_event(&self) -> io::Result<Self::Cq>;
}

/// Completion queue.
pub trait CompletionQueue {
    /// Arm the queue: the next completion raises one event on its channel.
    fn req_notify(&self) -> io::Result<()>;

    /// Non-blocking poll, filling `wc` from its front.
    /// Return the number of completions written.
    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize>;

    /// Acknowledge `n` completion events raised by this queue.
    fn ack_events(&self, n: u32);
}

/// Connection-manager event channel.
pub trait EventChannel<F: Fabric> {
    /// Create a connection id reporting on this channel, optionally bound to
    /// a device context.
    fn create_id(&self, ctx: Option<&F::Context>) -> io::Result<F::CmId>;

    /// Block for the next event.
    fn get_event(&self) -> io::Result<F::Event>;
}

/// A connection-manager event, acknowledged when dropped.
pub trait CmEvent<F: Fabric> {
    fn kind(&self) -> CmEventKind;

    /// The event status: zero for success, otherwise a negated errno or a
    /// transport-specific rejection reason.
    fn status(&self) -> i32;

    /// The connection this event refers to.
    fn conn(&self) -> ConnKey;

    /// Take ownership of the new connection id carried by a
    /// [`CmEventKind::ConnectRequest`] event.
    fn take_id(&mut self) -> Option<F::CmId>;

    /// Acknowledge the event.
    fn ack(self) -> io::Result<()>;
}

/// A connection-manager id.
pub trait CmId<F: Fabric> {
    fn key(&self) -> ConnKey;

    /// The device context bound to this id, available after address
    /// resolution (active side) or on ids taken from a connect request.
    fn context(&self) -> Option<F::Context>;

    fn resolve_addr(&self, dst: SocketAddr, timeout: Duration) -> io::Result<()>;

    fn resolve_route(&self, timeout: Duration) -> io::Result<()>;

    fn bind_addr(&self, addr: SocketAddr) -> io::Result<()>;

    fn listen(&self, backlog: i32) -> io::Result<()>;

    /// Create the reliable-connected queue pair of this id.
    fn create_qp(&self, pd: &F::Pd, cq: &F::Cq, caps: &QpCaps) -> io::Result<F::Qp>;

    fn connect(&self, params: &ConnParams) -> io::Result<()>;

    fn accept(&self, params: &ConnParams) -> io::Result<()>;

    fn reject(&self) -> io::Result<()>;

    fn disconnect(&self) -> io::Result<()>;
}

/// A reliable-connected queue pair.
pub trait QueuePair {
    fn qp_num(&self) -> u32;

    /// Post a send-queue work request.
    ///
    /// # Safety
    ///
    /// The local memory the request references must stay registered and
    /// valid until the request completes or the queue pair is destroyed.
    unsafe fn post_send(&self, wr: &SendWr) -> io::Result<()>;

    /// Post a receive-queue work request.
    ///
    /// # Safety
    ///
    /// Same as [`QueuePair::post_send`].
    unsafe fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;
}
