//! Runtime-agnostic RPC service registry
//!
//! Providers publish `(service key, endpoint)` registrations to a central
//! registry server over a small binary protocol; consumers subscribe to
//! service keys and receive the full registration list, versioned, every
//! time it changes. When a provider's connection drops, everything it
//! published is withdrawn and subscribers are told the endpoint went
//! offline.
//!
//! # Architecture
//!
//! The crate never spawns tasks. Servers and clients hand back futures and
//! the caller runs them on whichever executor it likes. It uses:
//!
//! - `async-net` for TCP
//! - `async-io` for timers
//! - `async-fs` for loading configuration
//! - Standard `futures` traits and channels
//!
//! # Example
//!
//! ```no_run
//! use rpc_registry::{RegistryServer, ServerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = RegistryServer::bind(ServerConfig::default()).await?;
//!
//! // Retransmits unacknowledged pushes until the server is dropped
//! let retransmitter = server.run_retransmitter();
//! # drop(retransmitter);
//!
//! loop {
//!     let handler = server.accept().await?;
//!     // User chooses how to run the handler
//!     // e.g., tokio::spawn, smol::spawn, etc.
//! #   drop(handler);
//! }
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod models;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod store;

mod sync;

pub use client::{ClientDriver, ClientStub, RegistryClient, Watchdog, WatchdogState, backoff_delay};
pub use config::{ClientConfig, RegistryConfig, ServerConfig};
pub use connection::{Connection, ConnectionId};
pub use error::{DecodeError, Error, Result};
pub use models::*;
pub use monitor::RegistryMonitor;
pub use protocol::{Envelope, FrameDecoder, MessageKind, SerializerKind};
pub use server::{ConnectionHandler, RegistryServer, ServerEngine};
pub use store::RegistryStore;

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        ChildEvent, ClientConfig, Endpoint, Error, NotifyEvent, Registration, RegistryClient,
        RegistryMonitor, RegistryServer, Result, ServerConfig, ServiceKey,
    };
}
