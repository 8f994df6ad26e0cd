//! Tandem Server
//!
//! The server accepts TCP connections and runs an acceptor node for each
//! one, built from a shared `NodeBuilder`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::TcpConnection;
use super::NetworkConfig;
use crate::error::HandshakeError;
use crate::protocol::PeerRole;
use crate::rpc::{NodeBuilder, RpcNode};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A peer completed the handshake
    PeerConnected { addr: SocketAddr, node_id: String },
    /// A peer's node shut down
    PeerDisconnected { addr: SocketAddr },
    /// A connection was dropped during the handshake
    HandshakeFailed { addr: SocketAddr, message: String },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// A connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// The acceptor node serving this peer
    pub node: RpcNode,
}

type Peers = Arc<RwLock<HashMap<SocketAddr, PeerInfo>>>;

/// Tandem Server
pub struct RpcServer {
    config: NetworkConfig,
    builder: NodeBuilder,
    peers: Peers,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
}

impl RpcServer {
    /// Create a new server; every accepted connection gets a node built
    /// from a clone of `builder`
    pub fn new(config: NetworkConfig, builder: NodeBuilder) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            builder: builder.role(PeerRole::Acceptor),
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let builder = self.builder.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let peers = peers.clone();
                                let event_tx = event_tx.clone();
                                let builder = builder.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = serve_peer(stream, addr, builder, peers, &event_tx).await {
                                        tracing::warn!("Handshake with {} failed: {}", addr, e);
                                        emit(&event_tx, ServerEvent::HandshakeFailed {
                                            addr,
                                            message: e.to_string(),
                                        });
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                emit(&event_tx, ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            emit(&event_tx, ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every peer's node
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let nodes: Vec<RpcNode> = self
            .peers
            .read()
            .await
            .values()
            .map(|peer| peer.node.clone())
            .collect();
        for node in nodes {
            node.close().await;
        }

        Ok(())
    }

    /// Get a list of connected peers
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    /// The node serving a given peer
    pub async fn peer(&self, addr: &SocketAddr) -> Option<RpcNode> {
        self.peers.read().await.get(addr).map(|peer| peer.node.clone())
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

// Events are dropped when nobody drains the receiver
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if event_tx.try_send(event).is_err() {
        tracing::trace!("server event dropped");
    }
}

/// Run one peer's node until it shuts down
async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    builder: NodeBuilder,
    peers: Peers,
    event_tx: &mpsc::Sender<ServerEvent>,
) -> Result<(), HandshakeError> {
    let connection = TcpConnection::new(stream, addr);
    let node = builder.connect(connection).await?;

    {
        let mut peers = peers.write().await;
        peers.insert(
            addr,
            PeerInfo {
                addr,
                node: node.clone(),
            },
        );
    }

    emit(
        event_tx,
        ServerEvent::PeerConnected {
            addr,
            node_id: node.peer_node_id().to_string(),
        },
    );

    node.closed().await;

    {
        let mut peers = peers.write().await;
        peers.remove(&addr);
    }

    tracing::info!("Peer {} disconnected", addr);
    emit(event_tx, ServerEvent::PeerDisconnected { addr });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RpcClient;
    use crate::protocol::ServiceCallIdentifier;
    use crate::rpc::ServiceRegistry;
    use std::time::Duration;

    fn loopback() -> NetworkConfig {
        NetworkConfig::new(0).with_bind_address("127.0.0.1")
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = RpcServer::new(loopback(), NodeBuilder::new(PeerRole::Acceptor));
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_serves_calls_and_reports_peers() {
        let mut registry = ServiceRegistry::new();
        registry.register_unary(ServiceCallIdentifier::new("math", "double"), |n: i64| async move {
            Ok(n * 2)
        });

        let mut server = RpcServer::new(loopback(), NodeBuilder::new(PeerRole::Acceptor).registry(registry));
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();
        assert!(matches!(events.recv().await, Some(ServerEvent::Started { .. })));

        let client = RpcClient::connect(addr, &loopback(), NodeBuilder::new(PeerRole::Initiator))
            .await
            .unwrap();
        let doubled: i64 = client
            .transport()
            .unary(&ServiceCallIdentifier::new("math", "double"), &21i64)
            .await
            .unwrap();
        assert_eq!(doubled, 42);

        match events.recv().await {
            Some(ServerEvent::PeerConnected { node_id, .. }) => {
                assert_eq!(node_id, client.node().node_id())
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.peers().await.len(), 1);

        client.disconnect().await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ServerEvent::PeerDisconnected { .. })));

        server.stop().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ServerEvent::Stopped)));
        assert!(!server.is_running().await);
    }
}
