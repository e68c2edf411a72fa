use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use super::{CompChannel, Cq, Pd, Verbs};
use crate::bindings::*;
use crate::fabric::DeviceContext;

raw_handle! {
    /// Handle of `*mut ibv_context`.
    IbvContext => ibv_context
}

/// Closes a device this process opened.
struct ContextOwner(IbvContext);

impl Drop for ContextOwner {
    fn drop(&mut self) {
        // SAFETY: FFI; every object created from the context holds a
        // `Context` and is therefore already gone.
        let ret = unsafe { ibv_close_device(self.0.as_ptr()) };
        if ret != 0 {
            log::warn!(
                "rdread: failed to close device context: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Device context.
///
/// Either opened by this process (closed when the last clone is dropped) or
/// borrowed from librdmacm, which binds a context to every resolved id and
/// keeps it open for the lifetime of the library.
#[derive(Clone)]
pub struct Context {
    ctx: IbvContext,
    _owner: Option<Arc<ContextOwner>>,
}

impl Context {
    pub(super) fn opened(ctx: NonNull<ibv_context>) -> Self {
        Self {
            ctx: IbvContext(ctx),
            _owner: Some(Arc::new(ContextOwner(IbvContext(ctx)))),
        }
    }

    pub(super) fn borrowed(ctx: NonNull<ibv_context>) -> Self {
        Self {
            ctx: IbvContext(ctx),
            _owner: None,
        }
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }
}

impl DeviceContext<Verbs> for Context {
    fn alloc_pd(&self) -> io::Result<Pd> {
        Pd::new(self)
    }

    fn create_comp_channel(&self) -> io::Result<CompChannel> {
        CompChannel::new(self)
    }

    fn create_cq(&self, depth: u32, channel: &CompChannel) -> io::Result<Cq> {
        Cq::new(self, depth, channel)
    }
}
