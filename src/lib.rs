//! Tandem - Bidirectional multiplexed RPC
//!
//! Two peers share one connection. Either side can call services the other
//! registered, with unary, client-streaming, server-streaming and
//! bidirectional calls interleaved on the same connection. Extensions hook
//! into every frame; the bundled ones keep the connection alive and mirror a
//! typed key-value context between the peers.

pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod network;
pub mod protocol;
pub mod rpc;

pub use context::{ContextKey, SessionContext, SessionContextFactory};
pub use error::{RpcError, StatusCode};
pub use extension::{Extension, ExtensionFactory, HeartbeatFactory};
pub use network::{Connection, MemoryConnection, RpcClient, RpcServer};
pub use protocol::{CallPattern, PeerRole, SerializationFormat, ServiceCallIdentifier};
pub use rpc::{ClientTransport, NodeBuilder, NodeConfig, RpcNode, ServiceRegistry};
