use thiserror::Error;

/// Opcode of a work completion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    #[default]
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    BindMw,
    Recv,
    RecvRdmaImm,
    /// An opcode this crate does not interpret.
    Other(u32),
}

impl From<u32> for WcOpcode {
    fn from(raw: u32) -> Self {
        match raw {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            other => WcOpcode::Other(other),
        }
    }
}

/// Status of a work completion, numbered as `enum ibv_wc_status`.
///
/// The error messages are the ones `ibv_wc_status_str` prints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    #[default]
    #[error("success")]
    Success = 0,

    /// The message does not fit the posted buffers (or the port MTU limits).
    #[error("local length error")]
    LocLenErr = 1,

    #[error("local QP operation error")]
    LocQpOpErr = 2,

    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A local scatter/gather entry does not reference a memory region that
    /// permits the operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The request was outstanding when the queue pair entered the error state.
    #[error("Work Request Flushed Error")]
    WrFlushErr = 5,

    #[error("memory management operation error")]
    MwBindErr = 6,

    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// The remote key, permission or bounds check of an RDMA operation failed.
    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    /// The peer never acknowledged; it is gone or misconfigured.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The peer had no receive posted for an incoming SEND.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    #[error("aborted error")]
    RemAbortErr = 16,

    #[error("invalid EE context number")]
    InvEecnErr = 17,

    #[error("invalid EE context state")]
    InvEecStateErr = 18,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Anything else, including statuses unknown to this crate.
    #[error("general error")]
    GeneralErr = 21,
}

impl From<u32> for WcStatus {
    fn from(raw: u32) -> Self {
        use WcStatus::*;
        match raw {
            0 => Success,
            1 => LocLenErr,
            2 => LocQpOpErr,
            3 => LocEecOpErr,
            4 => LocProtErr,
            5 => WrFlushErr,
            6 => MwBindErr,
            7 => BadRespErr,
            8 => LocAccessErr,
            9 => RemInvReqErr,
            10 => RemAccessErr,
            11 => RemOpErr,
            12 => RetryExcErr,
            13 => RnrRetryExcErr,
            14 => LocRddViolErr,
            15 => RemInvRdReqErr,
            16 => RemAbortErr,
            17 => InvEecnErr,
            18 => InvEecStateErr,
            19 => FatalErr,
            20 => RespTimeoutErr,
            _ => GeneralErr,
        }
    }
}

impl WcStatus {
    #[inline]
    pub fn is_success(&self) -> bool {
        *self == WcStatus::Success
    }
}

/// Work completion entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Wc {
    wr_id: u64,
    status: WcStatus,
    opcode: WcOpcode,
    byte_len: u32,
}

impl Wc {
    pub fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion opcode. Only meaningful for successful completions.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes transferred. Only meaningful for successful
    /// receive completions.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.byte_len as usize
    }

    /// Return `Ok(byte_len)` if the completion succeeded, otherwise its status.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        if self.status.is_success() {
            Ok(self.byte_len())
        } else {
            Err(self.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(WcStatus::RemAccessErr.to_string(), "remote access error");
        assert_eq!(WcStatus::WrFlushErr.to_string(), "Work Request Flushed Error");
        assert_eq!(WcStatus::RnrRetryExcErr.to_string(), "RNR retry counter exceeded");
    }

    #[test]
    fn status_from_raw() {
        assert_eq!(WcStatus::from(0), WcStatus::Success);
        assert_eq!(WcStatus::from(10), WcStatus::RemAccessErr);
        assert_eq!(WcStatus::from(1000), WcStatus::GeneralErr);
        assert_eq!(WcStatus::RemAccessErr as u32, 10);
    }

    #[test]
    fn wc_ok() {
        let wc = Wc::new(7, WcStatus::Success, WcOpcode::Recv, 16);
        assert_eq!(wc.ok(), Ok(16));
        assert_eq!(wc.wr_id(), 7);

        let wc = Wc::new(7, WcStatus::LocProtErr, WcOpcode::default(), 0);
        assert_eq!(wc.ok(), Err(WcStatus::LocProtErr));
    }

    #[test]
    fn opcode_from_raw() {
        assert_eq!(WcOpcode::from(2), WcOpcode::RdmaRead);
        assert_eq!(WcOpcode::from(128), WcOpcode::Recv);
        assert_eq!(WcOpcode::from(77), WcOpcode::Other(77));
    }
}
