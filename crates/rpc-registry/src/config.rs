//! Configuration structures for the registry server and client

use crate::error::{Error, Result};
use crate::protocol::{DEFAULT_MAX_BODY_LENGTH, SerializerKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Server configuration (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    /// Client configuration (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:20001")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// How long a push may stay unacknowledged before it is resent
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// How often the retransmitter scans for expired pushes
    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,
    /// Close connections that send nothing for this long (0 disables)
    #[serde(default = "default_reader_idle_timeout_ms")]
    pub reader_idle_timeout_ms: u64,
    /// Body serializer for server pushes
    #[serde(default)]
    pub serializer: SerializerKind,
    /// Largest accepted frame body
    #[serde(default = "default_max_body_length")]
    pub max_body_length: usize,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Registry server address
    pub server_addr: String,
    /// How long a request may stay unacknowledged before it is resent
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// How often the retransmitter scans for expired requests
    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,
    /// Write a heartbeat after this long without traffic (0 disables)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Reconnect automatically when the connection drops
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Body serializer for requests
    #[serde(default)]
    pub serializer: SerializerKind,
    /// Largest accepted frame body
    #[serde(default = "default_max_body_length")]
    pub max_body_length: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:20001".to_string()
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_retransmit_interval_ms() -> u64 {
    300
}

fn default_reader_idle_timeout_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect() -> bool {
    true
}

fn default_max_body_length() -> usize {
    DEFAULT_MAX_BODY_LENGTH
}

fn optional(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ack_timeout_ms: default_ack_timeout_ms(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
            reader_idle_timeout_ms: default_reader_idle_timeout_ms(),
            serializer: SerializerKind::default(),
            max_body_length: default_max_body_length(),
        }
    }
}

impl ServerConfig {
    /// Default configuration listening on `addr`
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Ack timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Retransmit poll interval as a duration
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }

    /// Reader idle timeout, if enabled
    pub fn reader_idle_timeout(&self) -> Option<Duration> {
        optional(self.reader_idle_timeout_ms)
    }
}

impl ClientConfig {
    /// Default configuration targeting `server_addr`
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ack_timeout_ms: default_ack_timeout_ms(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect: default_reconnect(),
            serializer: SerializerKind::default(),
            max_body_length: default_max_body_length(),
        }
    }

    /// Ack timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Retransmit poll interval as a duration
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }

    /// Heartbeat interval, if enabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        optional(self.heartbeat_interval_ms)
    }

    /// Resolve the configured server address
    pub fn resolve_server_addr(&self) -> Result<std::net::SocketAddr> {
        self.server_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid server_addr '{}': {}", self.server_addr, e)))
    }
}

impl RegistryConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        // Try YAML first, then JSON
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("yaml")
            || path.as_ref().extension().and_then(|s| s.to_str()) == Some("yml")
        {
            Ok(serde_yaml::from_str(&contents)?)
        } else {
            Ok(serde_json::from_str(&contents)?)
        }
    }
}
