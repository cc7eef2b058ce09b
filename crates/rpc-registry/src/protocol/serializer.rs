//! Body serializers selected by the sign byte's high nibble

use crate::error::{DecodeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serializer used for frame bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// serde_json
    #[default]
    Json,
}

impl SerializerKind {
    /// Wire code (high nibble of the sign byte)
    pub fn code(self) -> u8 {
        match self {
            Self::Json => 0x01,
        }
    }

    /// Look up a serializer by wire code
    pub fn from_code(code: u8) -> std::result::Result<Self, DecodeError> {
        match code {
            0x01 => Ok(Self::Json),
            other => Err(DecodeError::UnknownSerializer(other)),
        }
    }

    /// Serialize a payload
    pub fn encode<T: Serialize>(self, payload: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(payload)?),
        }
    }

    /// Deserialize a payload
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}
