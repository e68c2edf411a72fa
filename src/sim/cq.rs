use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::lock;
use crate::fabric::{CompChannel, CompletionQueue, Wc};

#[derive(Default)]
pub(super) struct CompQueue {
    ready: Mutex<VecDeque<Arc<CqShared>>>,
    cond: Condvar,
}

impl CompQueue {
    fn notify(&self, cq: Arc<CqShared>) {
        lock(&self.ready).push_back(cq);
        self.cond.notify_all();
    }
}

/// Software completion channel.
pub struct SimCompChannel {
    queue: Arc<CompQueue>,
}

impl SimCompChannel {
    pub(super) fn new() -> Self {
        Self {
            queue: Arc::new(CompQueue::default()),
        }
    }

    /// Number of completion events raised but not yet retrieved.
    pub fn pending_events(&self) -> usize {
        lock(&self.queue.ready).len()
    }
}

impl CompChannel for SimCompChannel {
    type Cq = SimCqRef;

    fn get_cq_event(&self) -> io::Result<SimCqRef> {
        let mut ready = lock(&self.queue.ready);
        loop {
            if let Some(cq) = ready.pop_front() {
                cq.unacked.fetch_add(1, Ordering::AcqRel);
                return Ok(SimCqRef { shared: cq });
            }
            ready = self
                .queue
                .cond
                .wait(ready)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

struct CqState {
    entries: VecDeque<Wc>,
    armed: bool,
}

pub(super) struct CqShared {
    depth: u32,
    state: Mutex<CqState>,
    channel: Arc<CompQueue>,
    unacked: AtomicU32,
}

impl CqShared {
    /// Append a completion, raising an event if the queue is armed.
    pub(super) fn push(self: &Arc<Self>, wc: Wc) {
        let fire = {
            let mut state = lock(&self.state);
            if state.entries.len() >= self.depth as usize {
                log::warn!(
                    "sim: completion queue overrun, dropping completion of wr {}",
                    wc.wr_id()
                );
                return;
            }
            state.entries.push_back(wc);
            std::mem::replace(&mut state.armed, false)
        };
        if fire {
            self.channel.notify(Arc::clone(self));
        }
    }

    fn req_notify(&self) {
        lock(&self.state).armed = true;
    }

    fn poll_into(&self, wc: &mut [Wc]) -> usize {
        let mut state = lock(&self.state);
        let n = wc.len().min(state.entries.len());
        for (slot, entry) in wc.iter_mut().zip(state.entries.drain(..n)) {
            *slot = entry;
        }
        n
    }

    fn ack_events(&self, n: u32) {
        let res = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(n));
        if res.is_err() {
            log::warn!("sim: acknowledging {} completion events that were never raised", n);
            self.unacked.store(0, Ordering::Release);
        }
    }
}

/// Software completion queue.
pub struct SimCq {
    shared: Arc<CqShared>,
}

impl SimCq {
    pub(super) fn new(depth: u32, channel: &SimCompChannel) -> Self {
        Self {
            shared: Arc::new(CqShared {
                depth,
                state: Mutex::new(CqState {
                    entries: VecDeque::new(),
                    armed: false,
                }),
                channel: channel.queue.clone(),
                unacked: AtomicU32::new(0),
            }),
        }
    }

    pub(super) fn shared(&self) -> &Arc<CqShared> {
        &self.shared
    }

    /// Get another handle to this queue, e.g., to inject from another thread.
    pub fn handle(&self) -> SimCqRef {
        SimCqRef {
            shared: self.shared.clone(),
        }
    }

    /// Append a completion as if the device produced it.
    pub fn inject(&self, wc: Wc) {
        self.shared.push(wc);
    }

    /// Number of retrieved but unacknowledged completion events.
    pub fn unacked_events(&self) -> u32 {
        self.shared.unacked.load(Ordering::Acquire)
    }
}

impl CompletionQueue for SimCq {
    fn req_notify(&self) -> io::Result<()> {
        self.shared.req_notify();
        Ok(())
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        Ok(self.shared.poll_into(wc))
    }

    fn ack_events(&self, n: u32) {
        self.shared.ack_events(n)
    }
}

impl Drop for SimCq {
    fn drop(&mut self) {
        let unacked = self.unacked_events();
        if unacked > 0 {
            // `ibv_destroy_cq` would block forever here.
            log::error!(
                "sim: destroying a completion queue with {} unacknowledged events",
                unacked
            );
        }
    }
}

/// Handle to the completion queue that raised an event.
#[derive(Clone)]
pub struct SimCqRef {
    shared: Arc<CqShared>,
}

impl SimCqRef {
    /// Append a completion as if the device produced it.
    pub fn inject(&self, wc: Wc) {
        self.shared.push(wc);
    }
}

impl CompletionQueue for SimCqRef {
    fn req_notify(&self) -> io::Result<()> {
        self.shared.req_notify();
        Ok(())
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        Ok(self.shared.poll_into(wc))
    }

    fn ack_events(&self, n: u32) {
        self.shared.ack_events(n)
    }
}
