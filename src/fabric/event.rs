use std::fmt;

/// Connection-manager event types, numbered as `enum rdma_cm_event_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    /// An event type this crate does not know about.
    Unknown(u32),
}

impl CmEventKind {
    pub fn from_raw(raw: u32) -> Self {
        use CmEventKind::*;
        match raw {
            0 => AddrResolved,
            1 => AddrError,
            2 => RouteResolved,
            3 => RouteError,
            4 => ConnectRequest,
            5 => ConnectResponse,
            6 => ConnectError,
            7 => Unreachable,
            8 => Rejected,
            9 => Established,
            10 => Disconnected,
            11 => DeviceRemoval,
            12 => MulticastJoin,
            13 => MulticastError,
            14 => AddrChange,
            15 => TimewaitExit,
            other => Unknown(other),
        }
    }

    pub fn as_raw(&self) -> u32 {
        use CmEventKind::*;
        match *self {
            AddrResolved => 0,
            AddrError => 1,
            RouteResolved => 2,
            RouteError => 3,
            ConnectRequest => 4,
            ConnectResponse => 5,
            ConnectError => 6,
            Unreachable => 7,
            Rejected => 8,
            Established => 9,
            Disconnected => 10,
            DeviceRemoval => 11,
            MulticastJoin => 12,
            MulticastError => 13,
            AddrChange => 14,
            TimewaitExit => 15,
            Unknown(raw) => raw,
        }
    }

    /// The name `rdma_event_str` gives this event type.
    pub fn name(&self) -> &'static str {
        use CmEventKind::*;
        match self {
            AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            Rejected => "RDMA_CM_EVENT_REJECTED",
            Established => "RDMA_CM_EVENT_ESTABLISHED",
            Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
            Unknown(_) => "UNKNOWN EVENT",
        }
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_match_rdma_cma() {
        assert_eq!(CmEventKind::from_raw(9), CmEventKind::Established);
        assert_eq!(CmEventKind::Disconnected.as_raw(), 10);
        assert_eq!(CmEventKind::from_raw(99), CmEventKind::Unknown(99));
        assert_eq!(CmEventKind::Unknown(99).as_raw(), 99);
    }

    #[test]
    fn names_match_rdma_event_str() {
        assert_eq!(
            CmEventKind::ConnectRequest.to_string(),
            "RDMA_CM_EVENT_CONNECT_REQUEST"
        );
        assert_eq!(CmEventKind::Unknown(42).to_string(), "UNKNOWN EVENT");
    }
}
