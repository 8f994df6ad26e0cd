//! Error taxonomy
//!
//! `RpcError` is the only error that crosses the wire. Everything else stays
//! local to the layer that produced it and is converted at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status codes carried by [`RpcError`]
///
/// Values below 1000 follow HTTP semantics, values from 1000 up are
/// protocol-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    BadRequest = 400,
    NotFound = 404,
    RequestTimeout = 408,
    Conflict = 409,
    Cancelled = 499,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    ConnectionClosed = 1001,
    ProtocolViolation = 1002,
    StreamTimeout = 1003,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            400 => Some(Self::BadRequest),
            404 => Some(Self::NotFound),
            408 => Some(Self::RequestTimeout),
            409 => Some(Self::Conflict),
            499 => Some(Self::Cancelled),
            500 => Some(Self::InternalServerError),
            503 => Some(Self::ServiceUnavailable),
            1001 => Some(Self::ConnectionClosed),
            1002 => Some(Self::ProtocolViolation),
            1003 => Some(Self::StreamTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BadRequest => "bad request",
            Self::NotFound => "not found",
            Self::RequestTimeout => "request timeout",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::InternalServerError => "internal server error",
            Self::ServiceUnavailable => "service unavailable",
            Self::ConnectionClosed => "connection closed",
            Self::ProtocolViolation => "protocol violation",
            Self::StreamTimeout => "stream timeout",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// An error reported to (or by) the remote side of a call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
    /// Diagnostic detail a handler chose to attach
    pub details: Option<String>,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProtocolViolation, message)
    }

    pub fn stream_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::StreamTimeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalServerError, message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ConnectionClosed, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ServiceUnavailable, message)
    }

    /// Convert a handler failure into the error reported to the caller.
    ///
    /// An `RpcError` at the top of the chain is passed through verbatim;
    /// anything else becomes an `InternalServerError` carrying only the
    /// display message. The cause chain is logged here and never sent.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<RpcError>() {
            Ok(rpc) => rpc,
            Err(other) => {
                tracing::warn!(error = ?other, "handler failed");
                Self::internal(other.to_string())
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == StatusCode::NotFound
    }

    pub fn is_connection_closed(&self) -> bool {
        self.code == StatusCode::ConnectionClosed
    }
}

impl From<SerializationError> for RpcError {
    fn from(err: SerializationError) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

impl From<ConnectionError> for RpcError {
    fn from(err: ConnectionError) -> Self {
        RpcError::connection_closed(err.to_string())
    }
}

/// Payload and frame (de)serialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame encoding {found} does not match negotiated format {expected}")]
    FormatMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors raised by a [`Connection`](crate::network::Connection)
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::protocol::CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors raised while two nodes agree on format and extensions
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Malformed hello: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Expected a text hello frame")]
    UnexpectedFrame,

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Both peers claim the {0:?} role")]
    RoleConflict(crate::protocol::PeerRole),

    #[error("No common serialization format (local={local:?}, remote={remote:?})")]
    NoCommonFormat {
        local: Vec<crate::protocol::SerializationFormat>,
        remote: Vec<crate::protocol::SerializationFormat>,
    },

    #[error("Extension order differs between peers: local={local:?}, remote={remote:?}")]
    ExtensionOrder {
        local: Vec<String>,
        remote: Vec<String>,
    },

    #[error("Handshake timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_roundtrip() {
        for code in [
            StatusCode::NotFound,
            StatusCode::InternalServerError,
            StatusCode::ProtocolViolation,
            StatusCode::StreamTimeout,
        ] {
            assert_eq!(StatusCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(StatusCode::from_u16(7), None);
    }

    #[test]
    fn test_handler_rpc_error_passes_through() {
        let original = RpcError::not_found("no such user");
        let wrapped = anyhow::Error::new(original.clone());
        assert_eq!(RpcError::from_handler(wrapped), original);
    }

    #[test]
    fn test_handler_other_error_is_wrapped() {
        let err = anyhow::anyhow!("disk on fire").context("loading profile");
        let rpc = RpcError::from_handler(err);
        assert_eq!(rpc.code, StatusCode::InternalServerError);
        assert_eq!(rpc.message, "loading profile");
        // The cause stays on this side of the wire
        assert_eq!(rpc.details, None);
        assert!(!rpc.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_error_serializes_across_formats() {
        let err = RpcError::protocol_violation("frame for unknown reference")
            .with_details("reference=7");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<RpcError>(&json).unwrap(), err);
        let bin = bincode::serialize(&err).unwrap();
        assert_eq!(bincode::deserialize::<RpcError>(&bin).unwrap(), err);
    }
}
