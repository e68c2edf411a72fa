//! Waiting for work completions through a completion channel.

use crate::error::{Error, Result};
use crate::fabric::{CompChannel, CompletionQueue, Wc};

/// A completion event retrieved from a channel, acknowledged on drop.
///
/// Destroying a completion queue blocks until all of its events are
/// acknowledged, so the acknowledgement must happen on every path.
struct CqEvent<Q: CompletionQueue> {
    cq: Q,
}

impl<Q: CompletionQueue> Drop for CqEvent<Q> {
    fn drop(&mut self) {
        self.cq.ack_events(1);
    }
}

/// Block until `count` completions are collected from the queue that
/// raises the next event on `channel`.
///
/// The queue is re-armed before it is drained, so a completion arriving
/// during the drain raises a fresh event. Polling never blocks and never
/// returns partial results. The first non-success completion fails the
/// whole wait.
pub fn wait_for_completions<C: CompChannel>(channel: &C, count: usize) -> Result<Vec<Wc>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let event = CqEvent {
        cq: channel
            .get_cq_event()
            .map_err(Error::transport("ibv_get_cq_event"))?,
    };
    event
        .cq
        .req_notify()
        .map_err(Error::transport("ibv_req_notify_cq"))?;

    let mut wcs = vec![Wc::default(); count];
    let mut done = 0;
    while done < count {
        let n = event
            .cq
            .poll_into(&mut wcs[done..])
            .map_err(Error::transport("ibv_poll_cq"))?;

        for (i, wc) in wcs[done..done + n].iter().enumerate() {
            if let Err(status) = wc.ok() {
                log::error!(
                    "rdread: work completion (WC) has error status: {} at index {}",
                    status,
                    done + i
                );
                return Err(Error::WorkRequestFailed {
                    status,
                    index: done + i,
                });
            }
        }
        done += n;
    }

    log::debug!("{} work completion(s) collected", done);
    drop(event);
    Ok(wcs)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::fabric::*;
    use crate::sim::{SimCompChannel, SimCq, SimFabric};

    fn setup(fabric: &SimFabric) -> (SimCompChannel, SimCq) {
        let ctx = fabric.devices().unwrap().remove(0).open().unwrap();
        let channel = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &channel).unwrap();
        cq.req_notify().unwrap();
        (channel, cq)
    }

    fn ok(wr_id: u64) -> Wc {
        Wc::new(wr_id, WcStatus::Success, WcOpcode::RdmaRead, 0)
    }

    #[test]
    fn collects_exact_count() {
        let fabric = SimFabric::with_device("rxe_0");
        let (channel, cq) = setup(&fabric);

        cq.inject(ok(1));
        cq.inject(ok(2));
        let wcs = wait_for_completions(&channel, 2).unwrap();
        assert_eq!(wcs.iter().map(Wc::wr_id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(cq.unacked_events(), 0);
    }

    #[test]
    fn first_failure_wins() {
        let fabric = SimFabric::with_device("rxe_0");
        let (channel, cq) = setup(&fabric);

        cq.inject(ok(1));
        cq.inject(Wc::new(2, WcStatus::RemAccessErr, WcOpcode::RdmaRead, 0));
        cq.inject(Wc::new(3, WcStatus::WrFlushErr, WcOpcode::RdmaRead, 0));
        let err = wait_for_completions(&channel, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::WorkRequestFailed {
                status: WcStatus::RemAccessErr,
                index: 1,
            }
        ));

        // Acknowledged on the error path as well.
        assert_eq!(cq.unacked_events(), 0);
    }

    #[test]
    fn rearms_for_the_next_wait() {
        let fabric = SimFabric::with_device("rxe_0");
        let (channel, cq) = setup(&fabric);

        cq.inject(ok(1));
        assert_eq!(wait_for_completions(&channel, 1).unwrap()[0].wr_id(), 1);
        cq.inject(ok(2));
        assert_eq!(wait_for_completions(&channel, 1).unwrap()[0].wr_id(), 2);
        assert_eq!(cq.unacked_events(), 0);
    }

    #[test]
    fn unarmed_queue_raises_no_event() {
        let fabric = SimFabric::with_device("rxe_0");
        let ctx = fabric.devices().unwrap().remove(0).open().unwrap();
        let channel = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &channel).unwrap();

        cq.inject(ok(1));
        assert_eq!(channel.pending_events(), 0);
        cq.req_notify().unwrap();
        cq.inject(ok(2));
        assert_eq!(channel.pending_events(), 1);
    }

    #[test]
    fn waits_for_late_completions() {
        let fabric = SimFabric::with_device("rxe_0");
        let (channel, cq) = setup(&fabric);

        let handle = cq.handle();
        cq.inject(ok(1));
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.inject(ok(2));
        });

        let wcs = wait_for_completions(&channel, 2).unwrap();
        assert_eq!(wcs.len(), 2);
        assert_eq!(wcs[1].wr_id(), 2);
        producer.join().unwrap();
    }

    #[test]
    fn zero_count_does_not_block() {
        let fabric = SimFabric::with_device("rxe_0");
        let (channel, _cq) = setup(&fabric);
        assert!(wait_for_completions(&channel, 0).unwrap().is_empty());
    }
}
