use std::io;

use thiserror::Error;

use crate::fabric::{CmEventKind, WcStatus};

/// Errors of the protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating or configuring a resource failed.
    #[error("{step} failed: {source}")]
    SetupFailed {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// An event arrived whose kind differs from the one awaited.
    #[error("unexpected event {got} (expecting {expected})")]
    UnexpectedEvent {
        got: CmEventKind,
        expected: CmEventKind,
    },

    /// An event arrived with a nonzero status.
    #[error("{kind} reported status {status}")]
    RemoteRejected { kind: CmEventKind, status: i32 },

    /// The provider refused to register a buffer.
    #[error("registering {len} bytes ({perm}) failed: {source}")]
    RegistrationFailed {
        len: usize,
        perm: crate::fabric::Permission,
        #[source]
        source: io::Error,
    },

    /// The provider rejected a work request at post time.
    #[error("posting {op} failed: {source}")]
    PostFailed {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A work completion reported a non-success status.
    #[error("work completion #{index} failed: {status}")]
    WorkRequestFailed { status: WcStatus, index: usize },

    /// No device carries the configured name.
    #[error("RDMA device {0:?} not found")]
    DeviceNotFound(String),

    /// Retrieving or acknowledging an event or completion failed.
    #[error("{what} failed: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A received message is not a descriptor.
    #[error("malformed descriptor message of {0} bytes")]
    Malformed(usize),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn setup(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::SetupFailed { step, source }
    }

    pub(crate) fn post(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::PostFailed { op, source }
    }

    pub(crate) fn transport(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Transport { what, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_step() {
        let err = Error::setup("rdma_resolve_addr")(io::Error::from_raw_os_error(libc::ENODEV));
        assert!(err.to_string().starts_with("rdma_resolve_addr failed"));

        let err = Error::WorkRequestFailed {
            status: WcStatus::RemAccessErr,
            index: 0,
        };
        assert_eq!(err.to_string(), "work completion #0 failed: remote access error");

        let err = Error::RemoteRejected {
            kind: CmEventKind::Rejected,
            status: libc::ECONNREFUSED,
        };
        assert!(err.to_string().starts_with("RDMA_CM_EVENT_REJECTED reported status"));
    }
}
