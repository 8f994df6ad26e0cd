//! Tandem Client
//!
//! Dials a Tandem server and runs an initiator node over the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

use super::connection::{ConnectionStats, TcpConnection};
use super::NetworkConfig;
use crate::error::HandshakeError;
use crate::protocol::PeerRole;
use crate::rpc::{ClientTransport, NodeBuilder, RpcNode};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connected initiator node
pub struct RpcClient {
    node: RpcNode,
    connection: Arc<TcpConnection>,
}

impl RpcClient {
    /// Connect to a server by address
    ///
    /// The builder's role is overridden: the dialing side is always the
    /// initiator.
    pub async fn connect(
        server_addr: SocketAddr,
        config: &NetworkConfig,
        builder: NodeBuilder,
    ) -> ClientResult<Self> {
        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };

        let connection = Arc::new(TcpConnection::new(stream, server_addr));
        let node = builder
            .role(PeerRole::Initiator)
            .connect_arc(connection.clone())
            .await?;

        tracing::info!(
            peer = node.peer_node_id(),
            format = node.format().name(),
            "Connected to {}",
            server_addr
        );
        Ok(Self { node, connection })
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(
        hostname: &str,
        config: &NetworkConfig,
        builder: NodeBuilder,
    ) -> ClientResult<Self> {
        let addr = super::resolve_host(hostname, config.port).await?;
        Self::connect(addr, config, builder).await
    }

    pub fn node(&self) -> &RpcNode {
        &self.node
    }

    /// Handle for issuing calls to the server
    pub fn transport(&self) -> ClientTransport {
        self.node.client()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    pub fn is_connected(&self) -> bool {
        !self.node.is_closed()
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        self.node.close().await;
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("remote_addr", &self.remote_addr())
            .field("node", &self.node)
            .finish()
    }
}
