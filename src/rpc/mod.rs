//! RPC module - Call dispatch over one connection
//!
//! Provides:
//! - `RpcNode`, the per-connection dispatcher, and its `NodeBuilder`
//! - `ServiceRegistry` for the handlers a node serves
//! - `ClientTransport` with typed helpers for the four call patterns
//! - Per-call handles: `Streaming`, `StreamSender`, `ResponseSink`

mod call;
mod node;
mod registry;
mod transport;

pub use call::{ClientStreamCall, ResponseSink, StreamSender, Streaming};
pub use node::{NodeBuilder, NodeConfig, OpenCalls, RpcNode};
pub use registry::ServiceRegistry;
pub use transport::ClientTransport;
