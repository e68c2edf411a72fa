//! Waiting for connection-manager events.

use crate::error::{Error, Result};
use crate::fabric::{CmEvent, CmEventKind, EventChannel, Fabric};

/// Block for the next event on `channel` and check that it is a successful
/// event of kind `expected`.
///
/// On success the event is returned unacknowledged. On a nonzero status or
/// a kind mismatch the event is acknowledged before the error is returned.
pub fn wait_for_event<F: Fabric>(
    channel: &F::EventChannel,
    expected: CmEventKind,
) -> Result<F::Event> {
    let event = channel
        .get_event()
        .map_err(Error::transport("rdma_get_cm_event"))?;
    let (kind, status) = (event.kind(), event.status());

    if status != 0 {
        log::error!("rdread: cm event {} has non-zero status {}", kind, status);
        ack_logged::<F>(event);
        return Err(Error::RemoteRejected { kind, status });
    }

    if kind != expected {
        log::error!(
            "rdread: unexpected event received: {} [expecting: {}]",
            kind,
            expected
        );
        ack_logged::<F>(event);
        return Err(Error::UnexpectedEvent {
            got: kind,
            expected,
        });
    }

    log::info!("a new {} type event is received", kind);
    Ok(event)
}

/// Wait for a successful event of kind `expected` and acknowledge it.
pub fn expect_event<F: Fabric>(channel: &F::EventChannel, expected: CmEventKind) -> Result<()> {
    wait_for_event::<F>(channel, expected)?
        .ack()
        .map_err(Error::transport("rdma_ack_cm_event"))
}

/// Acknowledge an event on an error path, where the acknowledgement failure
/// is secondary to the error being reported.
pub(crate) fn ack_logged<F: Fabric>(event: F::Event) {
    let kind = event.kind();
    if let Err(e) = event.ack() {
        log::error!("rdread: failed to acknowledge the cm event {}: {}", kind, e);
    }
}
