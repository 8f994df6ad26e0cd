//! Protocol message definitions
//!
//! Defines the frames exchanged between two Tandem nodes once the handshake
//! has picked a serialization format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RpcError;

/// Stable name of a remote operation, used as the registry routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceCallIdentifier {
    pub service_id: String,
    pub call_id: String,
}

impl ServiceCallIdentifier {
    pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for ServiceCallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.call_id)
    }
}

impl FromStr for ServiceCallIdentifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((service, call)) if !service.is_empty() && !call.is_empty() => {
                Ok(Self::new(service, call))
            }
            _ => Err(format!("expected <service>/<call>, got {:?}", s)),
        }
    }
}

/// Identifies one in-flight call on a connection
///
/// The connection initiator allocates odd references and the acceptor even
/// ones, so both peers can open calls without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcReference(pub u32);

impl fmt::Display for RpcReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the connection a node is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Opened the connection
    Initiator,
    /// Accepted the connection
    Acceptor,
}

impl PeerRole {
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Initiator => PeerRole::Acceptor,
            PeerRole::Acceptor => PeerRole::Initiator,
        }
    }

    /// Whether `reference` was allocated by a node with this role
    pub fn owns(self, reference: RpcReference) -> bool {
        match self {
            PeerRole::Initiator => reference.0 % 2 == 1,
            PeerRole::Acceptor => reference.0 % 2 == 0,
        }
    }

    pub(crate) fn first_reference(self) -> u32 {
        match self {
            PeerRole::Initiator => 1,
            PeerRole::Acceptor => 2,
        }
    }

    /// Tie-break rank: on equal revisions the initiator's write wins
    pub fn rank(self) -> u8 {
        match self {
            PeerRole::Initiator => 1,
            PeerRole::Acceptor => 0,
        }
    }
}

/// The four supported call shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPattern {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl CallPattern {
    /// Whether the caller sends a request stream (rather than one request)
    pub fn streams_requests(self) -> bool {
        matches!(self, CallPattern::ClientStream | CallPattern::BidiStream)
    }

    /// Whether the callee answers with a stream (rather than one response)
    pub fn streams_responses(self) -> bool {
        matches!(self, CallPattern::ServerStream | CallPattern::BidiStream)
    }
}

/// A value encoded in one of the supported formats
///
/// The variant says how to decode it: binary payloads are bincode, text
/// payloads are JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Binary(b) => b.len(),
            Payload::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All frames exchanged after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Start a call; unary and server-stream calls carry the request inline
    Open {
        reference: RpcReference,
        call: ServiceCallIdentifier,
        pattern: CallPattern,
        payload: Option<Payload>,
    },

    /// One request or response item
    Data {
        reference: RpcReference,
        payload: Payload,
    },

    /// Terminal failure of the call
    Error {
        reference: RpcReference,
        error: RpcError,
    },

    /// End of the sender's half of the call
    Close { reference: RpcReference },

    /// The caller abandoned the call
    Cancel { reference: RpcReference },

    /// Informational; never answered and never routed to a call
    Warning {
        reference: Option<RpcReference>,
        message: String,
    },
}

impl Frame {
    /// Reference the frame belongs to, if any
    pub fn reference(&self) -> Option<RpcReference> {
        match self {
            Frame::Open { reference, .. }
            | Frame::Data { reference, .. }
            | Frame::Error { reference, .. }
            | Frame::Close { reference }
            | Frame::Cancel { reference } => Some(*reference),
            Frame::Warning { reference, .. } => *reference,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open { .. } => "open",
            Frame::Data { .. } => "data",
            Frame::Error { .. } => "error",
            Frame::Close { .. } => "close",
            Frame::Cancel { .. } => "cancel",
            Frame::Warning { .. } => "warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_parse_and_display() {
        let id: ServiceCallIdentifier = "demo/strlen".parse().unwrap();
        assert_eq!(id, ServiceCallIdentifier::new("demo", "strlen"));
        assert_eq!(id.to_string(), "demo/strlen");
        assert!("nocall".parse::<ServiceCallIdentifier>().is_err());
        assert!("/x".parse::<ServiceCallIdentifier>().is_err());
    }

    #[test]
    fn test_reference_parity() {
        assert!(PeerRole::Initiator.owns(RpcReference(1)));
        assert!(!PeerRole::Initiator.owns(RpcReference(2)));
        assert!(PeerRole::Acceptor.owns(RpcReference(2)));
        assert_eq!(PeerRole::Acceptor.opposite(), PeerRole::Initiator);
    }

    #[test]
    fn test_frame_reference() {
        let frame = Frame::Close { reference: RpcReference(9) };
        assert_eq!(frame.reference(), Some(RpcReference(9)));
        assert_eq!(frame.kind(), "close");
        let warning = Frame::Warning { reference: None, message: "x".into() };
        assert_eq!(warning.reference(), None);
    }
}
