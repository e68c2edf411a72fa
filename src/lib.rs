//! One-sided RDMA READ of a remotely described buffer.
//!
//! A server registers a buffer as remotely readable and, once a client's
//! reliable connection is established, sends it a 16-byte [`Descriptor`]
//! (address, length, remote key). The client then fetches the whole buffer
//! with a single RDMA READ, without any CPU involvement on the server.
//!
//! Connections are managed by `rdma_cm`. The protocol is written against the
//! provider traits in [`fabric`], implemented by the hardware provider in
//! `verbs` (feature `verbs`, requires rdma-core) and by the in-process
//! software fabric in [`sim`].
//!
//! # Example
//!
//! ```rust
//! use rdread::prelude::*;
//! use rdread::sim::SimFabric;
//!
//! fn main() -> rdread::Result<()> {
//!     let fabric = SimFabric::with_device("rxe_0");
//!     let mut server = ServerSession::new(&fabric, &Config::default())?;
//!
//!     let client = std::thread::spawn({
//!         let fabric = fabric.clone();
//!         move || -> rdread::Result<Vec<u8>> {
//!             let mut session = ClientSession::connect(&fabric, "0.0.0.0:1717".parse().unwrap())?;
//!             let data = session.read()?;
//!             session.disconnect()?;
//!             Ok(data)
//!         }
//!     });
//!
//!     // CONNECT_REQUEST, ESTABLISHED, DISCONNECTED.
//!     for _ in 0..3 {
//!         server.process_next_event()?;
//!     }
//!     assert_eq!(client.join().unwrap()?, b"hello world!\0");
//!     Ok(())
//! }
//! ```

/// Provider traits and the plain data types they exchange.
pub mod fabric;

pub mod config;
pub mod descriptor;
pub mod error;

/// Connection-manager event waiting.
pub mod event;

/// Completion-channel waiting.
pub mod completion;

pub mod region;

pub mod client;
pub mod server;

/// In-process software fabric.
pub mod sim;

#[cfg(feature = "verbs")]
mod bindings;
#[cfg(feature = "verbs")]
#[macro_use]
mod utils;

/// rdma-core provider: libibverbs and librdmacm.
#[cfg(feature = "verbs")]
pub mod verbs;

pub mod prelude;

pub use client::{ClientSession, ClientState};
pub use config::Config;
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use server::ServerSession;
