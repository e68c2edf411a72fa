//! Protocol constants and the runtime configuration of both endpoints.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fabric::{ConnParams, QpCaps};

/// Timeout of address and route resolution. Nothing else times out.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Depth of every completion queue.
pub const CQ_DEPTH: u32 = 16;

/// Client queue pair: one outstanding request each way, all sends signaled.
pub const CLIENT_QP_CAPS: QpCaps = QpCaps {
    max_send_wr: 1,
    max_recv_wr: 1,
    max_send_sge: 1,
    max_recv_sge: 1,
    sq_sig_all: true,
};

/// Server per-connection queue pair.
pub const SERVER_QP_CAPS: QpCaps = QpCaps {
    max_send_wr: 4,
    max_recv_wr: 4,
    max_send_sge: 4,
    max_recv_sge: 4,
    sq_sig_all: false,
};

/// Reliability parameters used on both connect and accept.
pub const CONN_PARAMS: ConnParams = ConnParams {
    initiator_depth: 3,
    responder_resources: 3,
    retry_count: 3,
};

pub const LISTEN_BACKLOG: i32 = 1;

pub const DEFAULT_PORT: u16 = 1717;
pub const DEFAULT_DEVICE: &str = "rxe_0";
pub const DEFAULT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PAYLOAD: &str = "hello world!";

/// Endpoint configuration, read from the `[rdread]` table of a TOML file.
///
/// ```toml
/// [rdread]
/// addr = "10.0.0.1"
/// port = 1717
/// device = "mlx5_0"
/// payload = "hello world!"
/// ```
///
/// Missing keys take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the server binds to, or the client connects to.
    pub addr: IpAddr,
    pub port: u16,
    /// Name of the RDMA device the server opens.
    pub device: String,
    /// Text the server exposes for remote reads.
    pub payload: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR,
            port: DEFAULT_PORT,
            device: DEFAULT_DEVICE.to_owned(),
            payload: DEFAULT_PAYLOAD.to_owned(),
        }
    }
}

impl Config {
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let toml: toml::Table =
            toml::from_str(text).map_err(|e| Error::Config(format!("bad TOML: {}", e)))?;
        let table = match toml.get("rdread") {
            Some(t) if t.is_table() => t.clone(),
            _ => return Err(Error::Config("rdread configuration not found".to_owned())),
        };
        table
            .try_into()
            .map_err(|e| Error::Config(format!("bad rdread configuration: {}", e)))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// The data buffer the server registers: the payload followed by a NUL.
    pub fn payload_bytes(&self) -> Box<[u8]> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 1);
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes.push(0);
        bytes.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.socket_addr(), "0.0.0.0:1717".parse().unwrap());
        assert_eq!(config.device, "rxe_0");
        assert_eq!(&*config.payload_bytes(), b"hello world!\0");
        assert_eq!(config.payload_bytes().len(), 13);
    }

    #[test]
    fn partial_table() {
        let config = Config::from_toml_str(
            r#"
            [rdread]
            addr = "192.168.1.7"
            device = "mlx5_1"
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_addr(), "192.168.1.7:1717".parse().unwrap());
        assert_eq!(config.device, "mlx5_1");
        assert_eq!(config.payload, DEFAULT_PAYLOAD);
    }

    #[test]
    fn missing_table() {
        let err = Config::from_toml_str("[other]\nport = 1\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_values() {
        assert!(Config::from_toml_str("[rdread]\nport = \"x\"\n").is_err());
        assert!(Config::from_toml_str("[rdread]\nmystery = 1\n").is_err());
    }

    #[test]
    fn missing_file() {
        let err = Config::load_toml("/nonexistent/rdread.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
