//! Connection handshake
//!
//! Both sides send a JSON `Hello` and then read the peer's. The pair of hellos
//! decides the frame format and which extensions are installed, in what order.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{PeerRole, SerializationFormat, SerializedFrame, PROTOCOL_VERSION};
use crate::error::HandshakeError;
use crate::network::Connection;

/// An extension as advertised to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionOffer {
    pub name: String,
    /// Install only if the peer offers it too
    pub requires_peer: bool,
}

/// First message on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub node_id: String,
    pub role: PeerRole,
    pub formats: Vec<SerializationFormat>,
    pub extensions: Vec<ExtensionOffer>,
}

/// What both sides agreed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub format: SerializationFormat,
    pub peer_node_id: String,
    /// Indices into the local offer list, in local order
    pub active_extensions: Vec<usize>,
}

/// Exchange hellos over `connection` and agree on format and extensions
pub async fn perform(
    connection: &dyn Connection,
    local: &Hello,
    timeout: Duration,
) -> Result<Agreement, HandshakeError> {
    let remote = tokio::time::timeout(timeout, exchange(connection, local))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    agree(local, &remote)
}

async fn exchange(connection: &dyn Connection, local: &Hello) -> Result<Hello, HandshakeError> {
    let text = serde_json::to_string(local)?;
    connection.send(SerializedFrame::Text(text)).await?;

    match connection.receive().await? {
        SerializedFrame::Text(text) => Ok(serde_json::from_str(&text)?),
        SerializedFrame::Binary(_) => Err(HandshakeError::UnexpectedFrame),
    }
}

/// Decide the outcome of a hello exchange
///
/// Both peers run this on the same pair of hellos, so they fail or succeed
/// together.
pub fn agree(local: &Hello, remote: &Hello) -> Result<Agreement, HandshakeError> {
    if remote.protocol_version != local.protocol_version {
        return Err(HandshakeError::VersionMismatch {
            local: local.protocol_version,
            remote: remote.protocol_version,
        });
    }

    if remote.role == local.role {
        return Err(HandshakeError::RoleConflict(local.role));
    }

    let format = SerializationFormat::negotiate(&local.formats, &remote.formats).ok_or_else(|| {
        HandshakeError::NoCommonFormat {
            local: local.formats.clone(),
            remote: remote.formats.clone(),
        }
    })?;

    let offered_by_peer = |name: &str| remote.extensions.iter().any(|e| e.name == name);

    let active_extensions: Vec<usize> = local
        .extensions
        .iter()
        .enumerate()
        .filter(|(_, offer)| !offer.requires_peer || offered_by_peer(&offer.name))
        .map(|(index, _)| index)
        .collect();

    // Extensions present on both sides must be ordered the same way on both
    let shared_local: Vec<String> = local
        .extensions
        .iter()
        .filter(|offer| offered_by_peer(&offer.name))
        .map(|offer| offer.name.clone())
        .collect();
    let shared_remote: Vec<String> = remote
        .extensions
        .iter()
        .filter(|offer| local.extensions.iter().any(|e| e.name == offer.name))
        .map(|offer| offer.name.clone())
        .collect();

    if shared_local != shared_remote {
        return Err(HandshakeError::ExtensionOrder {
            local: shared_local,
            remote: shared_remote,
        });
    }

    Ok(Agreement {
        format,
        peer_node_id: remote.node_id.clone(),
        active_extensions,
    })
}

impl Hello {
    pub fn new(
        node_id: String,
        role: PeerRole,
        formats: Vec<SerializationFormat>,
        extensions: Vec<ExtensionOffer>,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            node_id,
            role,
            formats,
            extensions,
        }
    }
}
