use crate::descriptor::Descriptor;

/// Scatter/gather element: a span of registered local memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// The operation a send-queue work request performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOp {
    /// Two-sided send, consuming one receive posted by the peer.
    Send,
    /// One-sided read of remote memory into the local SGE.
    Read { remote_addr: u64, rkey: u32 },
}

/// Send-queue work request with a single SGE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub op: SendOp,
    pub sge: Sge,
    pub signaled: bool,
}

impl SendWr {
    /// Create an unsignaled SEND of `sge`.
    pub fn send(wr_id: u64, sge: Sge) -> Self {
        Self {
            wr_id,
            op: SendOp::Send,
            sge,
            signaled: false,
        }
    }

    /// Create an unsignaled RDMA READ of the remote buffer `remote` into
    /// `sge`. The read length is the SGE length.
    pub fn read(wr_id: u64, sge: Sge, remote: &Descriptor) -> Self {
        Self {
            wr_id,
            op: SendOp::Read {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
            sge,
            signaled: false,
        }
    }

    /// Request a completion for this work request.
    pub fn signaled(mut self) -> Self {
        self.signaled = true;
        self
    }
}

/// Receive-queue work request with a single SGE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

impl RecvWr {
    pub fn new(wr_id: u64, sge: Sge) -> Self {
        Self { wr_id, sge }
    }
}
