//! The rdread prelude.
//!
//! The purpose of this module is to alleviate imports of the session types
//! and the provider traits their generic code needs in scope.

pub use crate::client::{ClientSession, ClientState};
pub use crate::completion::wait_for_completions;
pub use crate::config::Config;
pub use crate::descriptor::Descriptor;
pub use crate::event::{expect_event, wait_for_event};
pub use crate::fabric::{
    CmEvent, CmEventKind, CmId, CompChannel, CompletionQueue, Device, DeviceContext, EventChannel,
    Fabric, MemoryRegion, Permission, ProtectionDomain, QueuePair, Wc, WcOpcode, WcStatus,
};
pub use crate::region::RegisteredBuf;
pub use crate::server::ServerSession;
