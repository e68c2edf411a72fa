//! The 16-byte message that advertises a remotely readable buffer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fabric::MemoryRegion;
use crate::region::RegisteredBuf;

/// Address, length and remote key of a registered buffer.
///
/// On the wire: `addr` (8 bytes), `len` (4 bytes), `rkey` (4 bytes), packed,
/// each field little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub rkey: u32,
}

impl Descriptor {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Describe a whole registered buffer, advertising its remote key.
    pub fn for_region<M: MemoryRegion>(buf: &RegisteredBuf<M>) -> Self {
        Self {
            addr: buf.addr(),
            len: buf.sge().length,
            rkey: buf.rkey(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..16].copy_from_slice(&self.rkey.to_le_bytes());
        out
    }

    /// Decode a received message, which must be exactly [`Self::SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Malformed(bytes.len()))?;

        let mut addr = [0u8; 8];
        let mut len = [0u8; 4];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&bytes[0..8]);
        len.copy_from_slice(&bytes[8..12]);
        rkey.copy_from_slice(&bytes[12..16]);

        Ok(Self {
            addr: u64::from_le_bytes(addr),
            len: u32::from_le_bytes(len),
            rkey: u32::from_le_bytes(rkey),
        })
    }
}
