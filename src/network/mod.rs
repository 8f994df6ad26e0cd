//! Network module - Connections and the TCP client/server facades
//!
//! Provides:
//! - The `Connection` contract the RPC node reads and writes through
//! - A TCP connection and an in-process loopback pair
//! - Server for accepting incoming connections
//! - Client for connecting to servers

mod client;
mod connection;
mod memory;
mod server;

pub use client::*;
pub use connection::*;
pub use memory::*;
pub use server::*;

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::ConnectionResult;
use crate::protocol::SerializedFrame;

/// A duplex channel of serialized frames
///
/// Implementations handle their transport's own control traffic (ping, pong,
/// close) and only surface frames.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one frame; fails with `ConnectionError::Transport` or `Closed`
    async fn send(&self, frame: SerializedFrame) -> ConnectionResult<()>;

    /// Wait for the next frame; fails with `ConnectionError::Closed` once the
    /// peer or this side has closed
    async fn receive(&self) -> ConnectionResult<SerializedFrame>;

    /// Close the connection; idempotent, wakes pending receivers
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl From<&crate::config::Config> for NetworkConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            port: config.network.port,
            bind_address: config
                .network
                .bind_address
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            connect_timeout_ms: config.network.connect_timeout_ms,
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
