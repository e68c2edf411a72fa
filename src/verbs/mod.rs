//! Safe wrappers of libibverbs and librdmacm objects.
//!
//! Every wrapper owns (or shares through an `Arc`) the object it wraps and
//! keeps alive the objects it was created from, so destruction always runs
//! child-first.

use std::io;

use crate::fabric::Fabric;

mod cm;
mod context;
mod cq;
mod device;
mod pd;
mod qp;

pub use self::cm::{CmEvent, CmId, EventChannel};
pub use self::context::Context;
pub use self::cq::{CompChannel, Cq, CqRef};
pub use self::device::Device;
pub use self::pd::{Mr, Pd};
pub use self::qp::Qp;

/// The rdma-core provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verbs;

impl Fabric for Verbs {
    type Device = Device;
    type Context = Context;
    type Pd = Pd;
    type Mr = Mr;
    type CompChannel = CompChannel;
    type Cq = Cq;
    type EventChannel = EventChannel;
    type Event = CmEvent;
    type CmId = CmId;
    type Qp = Qp;

    fn devices(&self) -> io::Result<Vec<Device>> {
        device::list()
    }

    fn create_event_channel(&self) -> io::Result<EventChannel> {
        EventChannel::new()
    }
}
