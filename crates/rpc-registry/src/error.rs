//! Error types for the service registry

use std::net::SocketAddr;
use thiserror::Error;

/// Service registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// Frame could not be decoded; fatal for the connection it arrived on
    #[error("Frame decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Initial connect to the registry server failed
    #[error("Failed to connect to registry at {addr}: {source}")]
    ConnectFailed {
        /// Address we tried to reach
        addr: SocketAddr,
        /// Underlying transport error
        #[source]
        source: std::io::Error,
    },

    /// Body does not fit the 32-bit length field
    #[error("Frame body too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while decoding a frame header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The magic sentinel did not match
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    /// The low nibble of the sign byte is not a known message kind
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    /// The kind is known but this side does not accept it
    #[error("unexpected message kind {0:?}")]
    UnexpectedKind(crate::protocol::MessageKind),

    /// The high nibble of the sign byte is not a known serializer
    #[error("unknown serializer code 0x{0:02x}")]
    UnknownSerializer(u8),

    /// Body length was negative or exceeded the configured maximum
    #[error("invalid body length {length} (max {max})")]
    InvalidBodyLength {
        /// Length carried in the header
        length: i32,
        /// Maximum accepted length
        max: usize,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
