//! Binary wire protocol
//!
//! Every message travels as a 16-byte big-endian header followed by an
//! opaque body:
//!
//! ```text
//! offset  size  field
//! 0       2     magic (0xBABE)
//! 2       1     sign = (serializer code << 4) | message kind
//! 3       1     status (reserved, written as 0)
//! 4       8     sequence id (i64)
//! 12      4     body length (i32)
//! 16      N     body
//! ```

mod codec;
mod serializer;

pub use codec::{FrameDecoder, encode};
pub use serializer::SerializerKind;

use crate::error::{DecodeError, Result};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Magic sentinel at the start of every frame
pub const MAGIC: u16 = 0xBABE;

/// Fixed header length in bytes
pub const HEADER_LENGTH: usize = 16;

/// Default upper bound on a frame body
pub const DEFAULT_MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

/// Registry message kinds (low nibble of the sign byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Provider announces a registration, or server pushes the full list
    PublishService = 0x03,
    /// Provider withdraws a registration, or server pushes the list after a removal
    PublishCancelService = 0x04,
    /// Consumer subscribes to a service key
    SubscribeService = 0x05,
    /// Server reports a provider endpoint as gone
    OfflineNotice = 0x06,
    /// Acknowledges a sequence id
    Ack = 0x07,
    /// Keep-alive, no body
    Heartbeat = 0x0F,
}

impl MessageKind {
    /// Parse the low nibble of a sign byte
    pub fn from_code(code: u8) -> std::result::Result<Self, DecodeError> {
        match code {
            0x03 => Ok(Self::PublishService),
            0x04 => Ok(Self::PublishCancelService),
            0x05 => Ok(Self::SubscribeService),
            0x06 => Ok(Self::OfflineNotice),
            0x07 => Ok(Self::Ack),
            0x0F => Ok(Self::Heartbeat),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Kinds a registry server accepts from its clients
pub const SERVER_ACCEPTS: &[MessageKind] = &[
    MessageKind::PublishService,
    MessageKind::PublishCancelService,
    MessageKind::SubscribeService,
    MessageKind::Ack,
    MessageKind::Heartbeat,
];

/// Kinds a registry client accepts from the server
pub const CLIENT_ACCEPTS: &[MessageKind] = &[
    MessageKind::PublishService,
    MessageKind::PublishCancelService,
    MessageKind::OfflineNotice,
    MessageKind::Ack,
    MessageKind::Heartbeat,
];

/// One wire-level protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender-local sequence number
    pub sequence_id: i64,
    /// What the body contains
    pub kind: MessageKind,
    /// How the body is serialized
    pub serializer: SerializerKind,
    /// Serialized payload
    pub body: Bytes,
}

impl Envelope {
    /// Serialize `payload` into a new envelope
    pub fn new<T: Serialize>(
        sequence_id: i64,
        kind: MessageKind,
        serializer: SerializerKind,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            sequence_id,
            kind,
            serializer,
            body: Bytes::from(serializer.encode(payload)?),
        })
    }

    /// Keep-alive envelope
    pub fn heartbeat(serializer: SerializerKind) -> Self {
        Self {
            sequence_id: 0,
            kind: MessageKind::Heartbeat,
            serializer,
            body: Bytes::new(),
        }
    }

    /// Acknowledgment for `sequence_id`
    pub fn ack(sequence_id: i64, serializer: SerializerKind) -> Result<Self> {
        Self::new(
            sequence_id,
            MessageKind::Ack,
            serializer,
            &crate::models::Acknowledge { sequence_id },
        )
    }

    /// Deserialize the body
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.serializer.decode(&self.body)
    }
}
