use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use super::cq::CqShared;
use super::{lock, os_err, SimFabric};
use crate::fabric::*;

struct QpState {
    recv: VecDeque<RecvWr>,
    peer: Option<Weak<QpShared>>,
}

pub(super) struct QpShared {
    num: u32,
    pd: usize,
    caps: QpCaps,
    cq: Arc<CqShared>,
    fabric: SimFabric,
    state: Mutex<QpState>,
}

impl QpShared {
    pub(super) fn set_peer(&self, peer: Option<Weak<QpShared>>) {
        lock(&self.state).peer = peer;
    }

    /// Report the outcome of a send-queue request. Failed requests always
    /// complete; successful ones only if signaled.
    fn complete(&self, wr: &SendWr, status: WcStatus, opcode: WcOpcode) {
        if status.is_success() && !(wr.signaled || self.caps.sq_sig_all) {
            return;
        }
        self.cq.push(Wc::new(wr.wr_id, status, opcode, wr.sge.length));
    }

    fn send(&self, peer: &QpShared, wr: &SendWr) {
        let len = wr.sge.length as usize;
        let Some(recv) = lock(&peer.state).recv.pop_front() else {
            log::debug!(
                "sim: qp {:#x} has no receive posted, SEND from qp {:#x} dropped",
                peer.num,
                self.num
            );
            self.complete(wr, WcStatus::RnrRetryExcErr, WcOpcode::Send);
            return;
        };

        let world = self.fabric.world();
        if !world.check(wr.sge.lkey, self.pd, wr.sge.addr, len, Permission::EMPTY) {
            drop(world);
            peer.cq.push(Wc::new(recv.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0));
            self.complete(wr, WcStatus::LocProtErr, WcOpcode::Send);
            return;
        }
        if len > recv.sge.length as usize {
            drop(world);
            peer.cq.push(Wc::new(recv.wr_id, WcStatus::LocLenErr, WcOpcode::Recv, 0));
            self.complete(wr, WcStatus::RemInvReqErr, WcOpcode::Send);
            return;
        }
        if !world.check(recv.sge.lkey, peer.pd, recv.sge.addr, len, Permission::LOCAL_WRITE) {
            drop(world);
            peer.cq.push(Wc::new(recv.wr_id, WcStatus::LocProtErr, WcOpcode::Recv, 0));
            self.complete(wr, WcStatus::RemOpErr, WcOpcode::Send);
            return;
        }

        // SAFETY: both spans lie in registered regions, which cannot be
        // deregistered while `world` is held.
        unsafe {
            std::ptr::copy(wr.sge.addr as *const u8, recv.sge.addr as *mut u8, len);
        }
        drop(world);

        peer.cq.push(Wc::new(recv.wr_id, WcStatus::Success, WcOpcode::Recv, len as u32));
        self.complete(wr, WcStatus::Success, WcOpcode::Send);
    }

    fn read(&self, peer: &QpShared, wr: &SendWr, remote_addr: u64, rkey: u32) {
        let len = wr.sge.length as usize;
        let world = self.fabric.world();
        if !world.check(wr.sge.lkey, self.pd, wr.sge.addr, len, Permission::LOCAL_WRITE) {
            drop(world);
            self.complete(wr, WcStatus::LocProtErr, WcOpcode::RdmaRead);
            return;
        }
        if !world.check(rkey, peer.pd, remote_addr, len, Permission::REMOTE_READ) {
            drop(world);
            log::debug!(
                "sim: READ of {} bytes at {:#x} with rkey {:#x} denied",
                len,
                remote_addr,
                rkey
            );
            self.complete(wr, WcStatus::RemAccessErr, WcOpcode::RdmaRead);
            return;
        }

        // SAFETY: as in `send`.
        unsafe {
            std::ptr::copy(remote_addr as *const u8, wr.sge.addr as *mut u8, len);
        }
        drop(world);
        self.complete(wr, WcStatus::Success, WcOpcode::RdmaRead);
    }
}

/// Software reliable-connected queue pair.
pub struct SimQp {
    shared: Arc<QpShared>,
}

impl SimQp {
    pub(super) fn new(fabric: &SimFabric, pd: usize, cq: Arc<CqShared>, caps: QpCaps) -> Self {
        Self {
            shared: Arc::new(QpShared {
                num: fabric.next_handle() as u32,
                pd,
                caps,
                cq,
                fabric: fabric.clone(),
                state: Mutex::new(QpState {
                    recv: VecDeque::new(),
                    peer: None,
                }),
            }),
        }
    }

    pub(super) fn shared(&self) -> &Arc<QpShared> {
        &self.shared
    }

    /// Number of receives posted and not yet consumed.
    pub fn posted_recvs(&self) -> usize {
        lock(&self.shared.state).recv.len()
    }
}

impl QueuePair for SimQp {
    fn qp_num(&self) -> u32 {
        self.shared.num
    }

    unsafe fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        if self.shared.caps.max_send_sge == 0 {
            return Err(os_err(libc::EINVAL));
        }
        let peer = lock(&self.shared.state)
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| os_err(libc::EINVAL))?;

        match wr.op {
            SendOp::Send => self.shared.send(&peer, wr),
            SendOp::Read { remote_addr, rkey } => self.shared.read(&peer, wr, remote_addr, rkey),
        }
        Ok(())
    }

    unsafe fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut state = lock(&self.shared.state);
        if self.shared.caps.max_recv_sge == 0
            || state.recv.len() >= self.shared.caps.max_recv_wr as usize
        {
            return Err(os_err(libc::ENOMEM));
        }
        state.recv.push_back(*wr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_qp_rejects_sends() {
        let fabric = SimFabric::with_device("rxe_0");
        let ctx = fabric.devices().unwrap()[0].open().unwrap();
        let chan = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &chan).unwrap();
        let caps = QpCaps {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            sq_sig_all: true,
        };
        let qp = SimQp::new(&fabric, 1, cq.shared().clone(), caps);

        let sge = Sge {
            addr: 0x1000,
            length: 8,
            lkey: 0x100,
        };
        assert!(unsafe { qp.post_send(&SendWr::send(1, sge)) }.is_err());

        // Receive queue capacity is enforced at post time.
        unsafe { qp.post_recv(&RecvWr::new(1, sge)) }.unwrap();
        assert!(unsafe { qp.post_recv(&RecvWr::new(2, sge)) }.is_err());
        assert_eq!(qp.posted_recvs(), 1);
    }

    #[test]
    fn send_without_receive_fails_with_rnr() {
        let fabric = SimFabric::with_device("rxe_0");
        let ctx = fabric.devices().unwrap()[0].open().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let chan = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &chan).unwrap();
        let caps = QpCaps {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            sq_sig_all: false,
        };
        let a = SimQp::new(&fabric, pd.id, cq.shared().clone(), caps);
        let b = SimQp::new(&fabric, pd.id, cq.shared().clone(), caps);
        a.shared().set_peer(Some(Arc::downgrade(b.shared())));
        b.shared().set_peer(Some(Arc::downgrade(a.shared())));

        let mut src = *b"rdread!\0";
        let mut dst = [0u8; 8];
        let src_mr = unsafe { pd.reg_mr(src.as_mut_ptr(), src.len(), Permission::EMPTY) }.unwrap();
        let dst_mr =
            unsafe { pd.reg_mr(dst.as_mut_ptr(), dst.len(), Permission::LOCAL_WRITE) }.unwrap();
        let src_sge = Sge {
            addr: src_mr.addr(),
            length: 8,
            lkey: src_mr.lkey(),
        };
        let dst_sge = Sge {
            addr: dst_mr.addr(),
            length: 8,
            lkey: dst_mr.lkey(),
        };

        // Unsignaled, but failures always complete.
        unsafe { a.post_send(&SendWr::send(7, src_sge)) }.unwrap();
        let mut wc = [Wc::default(); 4];
        assert_eq!(cq.poll_into(&mut wc).unwrap(), 1);
        assert_eq!(wc[0].wr_id(), 7);
        assert_eq!(wc[0].status(), WcStatus::RnrRetryExcErr);
        assert_eq!(wc[0].opcode(), WcOpcode::Send);

        unsafe { b.post_recv(&RecvWr::new(9, dst_sge)) }.unwrap();
        unsafe { a.post_send(&SendWr::send(8, src_sge).signaled()) }.unwrap();
        assert_eq!(cq.poll_into(&mut wc).unwrap(), 2);
        assert_eq!(wc[0].wr_id(), 9);
        assert_eq!(wc[0].opcode(), WcOpcode::Recv);
        assert_eq!(wc[0].ok(), Ok(8));
        assert_eq!(wc[1].wr_id(), 8);
        assert_eq!(wc[1].status(), WcStatus::Success);
        assert_eq!(wc[1].opcode(), WcOpcode::Send);
        assert_eq!(&dst, b"rdread!\0");
        assert_eq!(b.posted_recvs(), 0);
    }
}
