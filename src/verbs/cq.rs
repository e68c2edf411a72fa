use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use super::Context;
use crate::bindings::*;
use crate::fabric::{self, CompletionQueue, Wc, WcOpcode, WcStatus};
use crate::utils::interop::{from_c_err, from_c_ret};

/// Completions polled from the device per call.
const POLL_BATCH: usize = 16;

raw_handle! {
    /// Handle of `*mut ibv_comp_channel`.
    IbvCompChannel => ibv_comp_channel
}

struct CompChannelInner {
    chan: IbvCompChannel,
    _ctx: Context,
}

impl Drop for CompChannelInner {
    fn drop(&mut self) {
        // SAFETY: FFI; every CQ reporting to the channel holds a reference
        // to it and is therefore already destroyed.
        let ret = unsafe { ibv_destroy_comp_channel(self.chan.as_ptr()) };
        if ret != 0 {
            log::warn!(
                "rdread: failed to destroy completion channel: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Completion event channel.
pub struct CompChannel {
    inner: Arc<CompChannelInner>,
}

impl CompChannel {
    pub(super) fn new(ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let chan = unsafe { ibv_create_comp_channel(ctx.as_raw()) };
        let chan = NonNull::new(chan).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(CompChannelInner {
                chan: IbvCompChannel(chan),
                _ctx: ctx.clone(),
            }),
        })
    }
}

impl fabric::CompChannel for CompChannel {
    type Cq = CqRef;

    fn get_cq_event(&self) -> io::Result<CqRef> {
        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();

        // SAFETY: FFI.
        let ret = unsafe { ibv_get_cq_event(self.inner.chan.as_ptr(), &mut cq, &mut cq_context) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let cq = NonNull::new(cq).ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
        Ok(CqRef(IbvCq(cq)))
    }
}

raw_handle! {
    /// Handle of `*mut ibv_cq`.
    IbvCq => ibv_cq
}

impl IbvCq {
    fn req_notify(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_req_notify_cq(self.as_ptr(), 0) })
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        // SAFETY: `ibv_wc` is plain old data.
        let mut raw: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        let mut filled = 0;

        while filled < wc.len() {
            let want = (wc.len() - filled).min(POLL_BATCH);

            // SAFETY: FFI; `raw` has room for `want` entries.
            let n = unsafe { ibv_poll_cq(self.as_ptr(), want as i32, raw.as_mut_ptr()) };
            if n < 0 {
                return from_c_err(libc::EIO);
            }

            let n = n as usize;
            for (dst, src) in wc[filled..].iter_mut().zip(&raw[..n]) {
                *dst = Wc::new(
                    src.wr_id,
                    WcStatus::from(src.status),
                    WcOpcode::from(src.opcode),
                    src.byte_len,
                );
            }
            filled += n;
            if n < want {
                break;
            }
        }
        Ok(filled)
    }

    fn ack_events(&self, n: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(self.as_ptr(), n) };
    }
}

/// Completion queue.
pub struct Cq {
    cq: IbvCq,
    _chan: Arc<CompChannelInner>,
    _ctx: Context,
}

impl Cq {
    pub(super) fn new(ctx: &Context, depth: u32, channel: &CompChannel) -> io::Result<Self> {
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                depth as i32,
                ptr::null_mut(),
                channel.inner.chan.as_ptr(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            cq: IbvCq(cq),
            _chan: channel.inner.clone(),
            _ctx: ctx.clone(),
        })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }
}

impl CompletionQueue for Cq {
    fn req_notify(&self) -> io::Result<()> {
        self.cq.req_notify()
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        self.cq.poll_into(wc)
    }

    fn ack_events(&self, n: u32) {
        self.cq.ack_events(n)
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        // SAFETY: FFI. Blocks until every event of this CQ is acknowledged.
        let ret = unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("rdread: failed to destroy completion queue: {}", e);
        }
    }
}

/// Non-owning handle to the CQ that raised a completion event.
///
/// Valid while the [`Cq`] it refers to is alive.
pub struct CqRef(IbvCq);

impl CompletionQueue for CqRef {
    fn req_notify(&self) -> io::Result<()> {
        self.0.req_notify()
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        self.0.poll_into(wc)
    }

    fn ack_events(&self, n: u32) {
        self.0.ack_events(n)
    }
}
