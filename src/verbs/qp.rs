use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use super::cm::CmIdInner;
use super::Pd;
use crate::bindings::*;
use crate::fabric::{QueuePair, RecvWr, SendOp, SendWr, Sge};
use crate::utils::interop::from_c_ret;

raw_handle! {
    /// Handle of `*mut ibv_qp`.
    IbvQp => ibv_qp
}

/// Reliable-connected queue pair owned by a connection id.
pub struct Qp {
    qp: IbvQp,
    id: Arc<CmIdInner>,
    _pd: Pd,
}

impl Qp {
    pub(super) fn new(qp: NonNull<ibv_qp>, id: Arc<CmIdInner>, pd: Pd) -> Self {
        Self {
            qp: IbvQp(qp),
            id,
            _pd: pd,
        }
    }
}

fn raw_sge(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

impl QueuePair for Qp {
    fn qp_num(&self) -> u32 {
        // SAFETY: the QP is valid while `self` lives.
        unsafe { self.qp.as_ref().qp_num }
    }

    unsafe fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let mut sge = raw_sge(&wr.sge);

        // SAFETY: all-zero is a valid `ibv_send_wr`.
        let mut raw: ibv_send_wr = mem::zeroed();
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        if wr.signaled {
            raw.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        match wr.op {
            SendOp::Send => raw.opcode = ibv_wr_opcode::IBV_WR_SEND,
            SendOp::Read { remote_addr, rkey } => {
                raw.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
                raw.wr.rdma = ibv_send_wr_rdma { remote_addr, rkey };
            }
        }

        let mut bad_wr = ptr::null_mut();
        from_c_ret(ibv_post_send(self.qp.as_ptr(), &mut raw, &mut bad_wr))
    }

    unsafe fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut sge = raw_sge(&wr.sge);

        // SAFETY: all-zero is a valid `ibv_recv_wr`.
        let mut raw: ibv_recv_wr = mem::zeroed();
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        from_c_ret(ibv_post_recv(self.qp.as_ptr(), &mut raw, &mut bad_wr))
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        // SAFETY: FFI. The id is kept alive by `self.id`.
        unsafe { rdma_destroy_qp(self.id.as_raw()) };
    }
}
