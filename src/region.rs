//! Owned buffers registered as memory regions.

use std::io;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::fabric::{MemoryRegion, Permission, ProtectionDomain, Sge};

/// A heap buffer registered with a protection domain.
///
/// The buffer is owned, so it cannot be freed while registered: dropping
/// deregisters first, then frees. [`RegisteredBuf::deregister`] hands the
/// buffer back instead of freeing it.
pub struct RegisteredBuf<M: MemoryRegion> {
    /// The memory region, `None` only after deregistration.
    mr: Option<M>,

    buf: Box<[u8]>,
    /// `buf.len()`, which always fits an SGE length.
    length: u32,
    perm: Permission,
}

/// Check that `len` bytes can be covered by a single SGE.
fn sge_length(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} bytes exceed the 32-bit SGE length", len),
        )
    })
}

impl<M: MemoryRegion> RegisteredBuf<M> {
    /// Register `buf` with `pd`.
    pub fn register<P>(pd: &P, mut buf: Box<[u8]>, perm: Permission) -> Result<Self>
    where
        P: ProtectionDomain<Mr = M>,
    {
        let length = sge_length(buf.len()).map_err(|source| Error::RegistrationFailed {
            len: buf.len(),
            perm,
            source,
        })?;

        // SAFETY: the region never outlives `buf`, which is kept (and never
        // moved on the heap) until the region is gone.
        let mr = unsafe { pd.reg_mr(buf.as_mut_ptr(), buf.len(), perm) }.map_err(|source| {
            log::error!("rdread: failed to register {} bytes: {}", buf.len(), source);
            Error::RegistrationFailed {
                len: buf.len(),
                perm,
                source,
            }
        })?;

        log::info!(
            "registered memory region: addr={:#x} len={} lkey={:#x} rkey={:#x} perm={}",
            mr.addr(),
            mr.len(),
            mr.lkey(),
            mr.rkey(),
            perm
        );
        Ok(Self {
            mr: Some(mr),
            buf,
            length,
            perm,
        })
    }

    /// Allocate `len` zeroed bytes and register them.
    pub fn zeroed<P>(pd: &P, len: usize, perm: Permission) -> Result<Self>
    where
        P: ProtectionDomain<Mr = M>,
    {
        Self::register(pd, vec![0u8; len].into_boxed_slice(), perm)
    }

    fn mr(&self) -> &M {
        self.mr
            .as_ref()
            .unwrap_or_else(|| unreachable!("region used after deregistration"))
    }

    /// Get the start address of the buffer.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr().lkey()
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.mr().rkey()
    }

    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    /// A scatter/gather element covering the whole buffer.
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr(),
            length: self.length,
            lkey: self.lkey(),
        }
    }

    /// Deregister and return the buffer. A failed deregistration is logged.
    pub fn deregister(mut self) -> Box<[u8]> {
        self.release();
        std::mem::take(&mut self.buf)
    }

    fn release(&mut self) {
        if let Some(mr) = self.mr.take() {
            let (addr, lkey) = (mr.addr(), mr.lkey());
            if let Err(e) = mr.dereg() {
                log::warn!(
                    "rdread: failed to deregister memory region {:#x} (lkey {:#x}): {}",
                    addr,
                    lkey,
                    e
                );
            }
        }
    }
}

impl<M: MemoryRegion> Drop for RegisteredBuf<M> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<M: MemoryRegion> Deref for RegisteredBuf<M> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl<M: MemoryRegion> DerefMut for RegisteredBuf<M> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::*;
    use crate::sim::SimFabric;

    fn pd(fabric: &SimFabric) -> <SimFabric as Fabric>::Pd {
        let dev = fabric.devices().unwrap().remove(0);
        dev.open().unwrap().alloc_pd().unwrap()
    }

    #[test]
    fn register_and_describe() {
        let fabric = SimFabric::with_device("rxe_0");
        let pd = pd(&fabric);
        let buf = RegisteredBuf::register(&pd, b"abc".to_vec().into(), Permission::REMOTE_READ)
            .unwrap();

        assert_eq!(&*buf, b"abc");
        assert_eq!(buf.perm(), Permission::REMOTE_READ);
        let sge = buf.sge();
        assert_eq!(sge.addr, buf.addr());
        assert_eq!(sge.length, 3);
        assert_eq!(sge.lkey, buf.lkey());
        assert_eq!(fabric.registered_regions(), 1);

        drop(buf);
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn reregistration_yields_fresh_keys() {
        let fabric = SimFabric::with_device("rxe_0");
        let pd = pd(&fabric);

        let buf = RegisteredBuf::zeroed(&pd, 64, Permission::LOCAL_WRITE).unwrap();
        let (addr, lkey, rkey) = (buf.addr(), buf.lkey(), buf.rkey());

        let raw = buf.deregister();
        assert_eq!(raw.len(), 64);
        assert_eq!(fabric.registered_regions(), 0);

        let buf = RegisteredBuf::register(&pd, raw, Permission::LOCAL_WRITE).unwrap();
        assert_eq!(buf.addr(), addr);
        assert_ne!(buf.lkey(), lkey);
        assert_ne!(buf.rkey(), rkey);
    }

    #[test]
    fn sge_length_is_checked() {
        assert_eq!(sge_length(13).unwrap(), 13);
        assert_eq!(sge_length(u32::MAX as usize).unwrap(), u32::MAX);
        let err = sge_length(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn registration_failure() {
        let fabric = SimFabric::with_device("rxe_0");
        let pd = pd(&fabric);
        let err = RegisteredBuf::zeroed(&pd, 0, Permission::LOCAL_WRITE).err().unwrap();
        assert!(matches!(err, Error::RegistrationFailed { len: 0, .. }));
    }
}
