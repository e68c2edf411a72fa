use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use super::Context;
use crate::bindings::*;
use crate::fabric::{MemoryRegion, Permission, ProtectionDomain};
use crate::utils::interop::from_c_ret;

raw_handle! {
    /// Handle of `*mut ibv_pd`.
    IbvPd => ibv_pd
}

struct PdInner {
    pd: IbvPd,
    _ctx: Context,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("rdread: failed to deallocate protection domain: {}", e);
        }
    }
}

/// Protection domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    pub(super) fn new(ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_raw()) };
        let pd = NonNull::new(pd).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(PdInner {
                pd: IbvPd(pd),
                _ctx: ctx.clone(),
            }),
        })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }
}

impl ProtectionDomain for Pd {
    type Mr = Mr;

    unsafe fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<Mr> {
        let mr = ibv_reg_mr(self.as_raw(), addr.cast(), len, perm.into());
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        Ok(Mr {
            mr: Some(IbvMr(mr)),
            _pd: self.clone(),
        })
    }
}

raw_handle! {
    /// Handle of `*mut ibv_mr`.
    IbvMr => ibv_mr
}

/// Registered memory region. Deregistered when dropped.
pub struct Mr {
    mr: Option<IbvMr>,
    _pd: Pd,
}

impl Mr {
    fn raw(&self) -> &ibv_mr {
        let mr = self
            .mr
            .as_ref()
            .unwrap_or_else(|| unreachable!("memory region used after deregistration"));
        // SAFETY: the region is registered, so the pointer is valid.
        unsafe { mr.as_ref() }
    }

    fn release(&mut self) -> io::Result<()> {
        match self.mr.take() {
            // SAFETY: FFI.
            Some(mr) => from_c_ret(unsafe { ibv_dereg_mr(mr.as_ptr()) }),
            None => Ok(()),
        }
    }
}

impl MemoryRegion for Mr {
    fn addr(&self) -> u64 {
        self.raw().addr as u64
    }

    fn len(&self) -> usize {
        self.raw().length
    }

    fn lkey(&self) -> u32 {
        self.raw().lkey
    }

    fn rkey(&self) -> u32 {
        self.raw().rkey
    }

    fn dereg(mut self) -> io::Result<()> {
        self.release()
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("rdread: failed to deregister memory region: {}", e);
        }
    }
}
