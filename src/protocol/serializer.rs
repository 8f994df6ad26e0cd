//! Frame serializer
//!
//! Encodes frames and typed payloads in the format both peers agreed on
//! during the handshake.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Frame, Payload};
use crate::error::SerializationError;

/// Formats a node can speak, in fixed priority order
pub const FORMAT_PRIORITY: [SerializationFormat; 2] =
    [SerializationFormat::Binary, SerializationFormat::Json];

/// Wire encoding for frames and payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// bincode
    Binary,
    /// JSON text
    Json,
}

impl SerializationFormat {
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Binary => "binary",
            SerializationFormat::Json => "json",
        }
    }

    /// Pick the highest-priority format both sides support
    pub fn negotiate(
        local: &[SerializationFormat],
        remote: &[SerializationFormat],
    ) -> Option<SerializationFormat> {
        FORMAT_PRIORITY
            .into_iter()
            .find(|format| local.contains(format) && remote.contains(format))
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The connection's unit of transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializedFrame {
    Binary(Bytes),
    Text(String),
}

impl SerializedFrame {
    pub fn len(&self) -> usize {
        match self {
            SerializedFrame::Binary(b) => b.len(),
            SerializedFrame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encoding(&self) -> &'static str {
        match self {
            SerializedFrame::Binary(_) => "binary",
            SerializedFrame::Text(_) => "text",
        }
    }
}

/// Serializer bound to one negotiated format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSerializer {
    format: SerializationFormat,
}

impl FrameSerializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<SerializedFrame, SerializationError> {
        match self.format {
            SerializationFormat::Binary => {
                Ok(SerializedFrame::Binary(Bytes::from(bincode::serialize(frame)?)))
            }
            SerializationFormat::Json => Ok(SerializedFrame::Text(serde_json::to_string(frame)?)),
        }
    }

    pub fn decode_frame(&self, frame: &SerializedFrame) -> Result<Frame, SerializationError> {
        match (self.format, frame) {
            (SerializationFormat::Binary, SerializedFrame::Binary(bytes)) => {
                Ok(bincode::deserialize(bytes)?)
            }
            (SerializationFormat::Json, SerializedFrame::Text(text)) => {
                Ok(serde_json::from_str(text)?)
            }
            (format, other) => Err(SerializationError::FormatMismatch {
                expected: format.name(),
                found: other.encoding(),
            }),
        }
    }

    pub fn encode_payload<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Payload, SerializationError> {
        encode_payload(self.format, value)
    }

    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        payload: &Payload,
    ) -> Result<T, SerializationError> {
        decode_payload(payload)
    }
}

/// Encode a value as a payload in the given format
pub fn encode_payload<T: Serialize + ?Sized>(
    format: SerializationFormat,
    value: &T,
) -> Result<Payload, SerializationError> {
    match format {
        SerializationFormat::Binary => Ok(Payload::Binary(bincode::serialize(value)?)),
        SerializationFormat::Json => Ok(Payload::Text(serde_json::to_string(value)?)),
    }
}

/// Decode a payload; the variant determines the format
pub fn decode_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, SerializationError> {
    match payload {
        Payload::Binary(bytes) => Ok(bincode::deserialize(bytes)?),
        Payload::Text(text) => Ok(serde_json::from_str(text)?),
    }
}
