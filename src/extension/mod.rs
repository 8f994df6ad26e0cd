//! Extension module - Pluggable per-connection behaviour
//!
//! An extension can see and rewrite every frame, contribute handlers to the
//! node's registry, and run a background task for the life of the node.
//! Extensions are offered during the handshake; both peers must list the
//! extensions they share in the same order.

pub mod heartbeat;

pub use heartbeat::{HeartbeatFactory, HeartbeatStats};

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::Frame;
use crate::rpc::{ClientTransport, ServiceRegistry};

/// Per-connection extension instance
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Name advertised in the handshake
    fn name(&self) -> &str;

    /// See a frame on its way in; `None` drops it
    fn intercept_incoming(&self, frame: Frame) -> Option<Frame> {
        Some(frame)
    }

    /// See a frame on its way out; `None` drops it
    fn intercept_outgoing(&self, frame: Frame) -> Option<Frame> {
        Some(frame)
    }

    /// Add handlers to the node's registry before it starts serving
    fn register_services(self: Arc<Self>, _registry: &mut ServiceRegistry) {}

    /// Called once with the node's transport before any frame flows
    fn bind(&self, _transport: &ClientTransport) {}

    /// Background work; aborted when the node shuts down
    async fn run(self: Arc<Self>, _transport: ClientTransport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates one [`Extension`] per connection
pub trait ExtensionFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Install only if the peer offers the same extension
    fn requires_peer(&self) -> bool {
        true
    }

    fn create(&self) -> Arc<dyn Extension>;
}

/// Installed extensions, in negotiated order
///
/// Incoming frames visit extensions first to last, outgoing frames last to
/// first, so the extension nearest the wire is the outermost layer both ways.
#[derive(Clone, Default)]
pub(crate) struct ExtensionPipeline {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionPipeline {
    pub(crate) fn new(extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self { extensions }
    }

    pub(crate) fn incoming(&self, frame: Frame) -> Option<Frame> {
        self.extensions
            .iter()
            .try_fold(frame, |frame, extension| extension.intercept_incoming(frame))
    }

    pub(crate) fn outgoing(&self, frame: Frame) -> Option<Frame> {
        self.extensions
            .iter()
            .rev()
            .try_fold(frame, |frame, extension| extension.intercept_outgoing(frame))
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|extension| extension.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryConnection;
    use crate::protocol::{PeerRole, RpcReference, ServiceCallIdentifier};
    use crate::rpc::NodeBuilder;
    use parking_lot::Mutex;

    /// Records the frame kinds it sees, tagged with its own name
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        drop_cancels: bool,
    }

    impl Extension for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn intercept_incoming(&self, frame: Frame) -> Option<Frame> {
            self.log.lock().push(format!("{} in {}", self.name, frame.kind()));
            if self.drop_cancels && matches!(frame, Frame::Cancel { .. }) {
                return None;
            }
            Some(frame)
        }

        fn intercept_outgoing(&self, frame: Frame) -> Option<Frame> {
            self.log.lock().push(format!("{} out {}", self.name, frame.kind()));
            Some(frame)
        }
    }

    struct RecorderFactory {
        name: &'static str,
        requires_peer: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ExtensionFactory for RecorderFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn requires_peer(&self) -> bool {
            self.requires_peer
        }

        fn create(&self) -> Arc<dyn Extension> {
            Arc::new(Recorder {
                name: self.name.to_string(),
                log: self.log.clone(),
                drop_cancels: false,
            })
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, drop_cancels: bool) -> Arc<dyn Extension> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            drop_cancels,
        })
    }

    #[test]
    fn test_pipeline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![recorder("a", &log, false), recorder("b", &log, false)]);

        let frame = Frame::Close {
            reference: RpcReference(1),
        };
        assert!(pipeline.incoming(frame.clone()).is_some());
        assert!(pipeline.outgoing(frame).is_some());
        assert_eq!(
            *log.lock(),
            vec!["a in close", "b in close", "b out close", "a out close"]
        );
    }

    #[test]
    fn test_dropped_frame_stops_the_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![recorder("gate", &log, true), recorder("after", &log, false)]);

        let cancel = Frame::Cancel {
            reference: RpcReference(3),
        };
        assert!(pipeline.incoming(cancel).is_none());
        assert_eq!(*log.lock(), vec!["gate in cancel"]);
    }

    #[tokio::test]
    async fn test_optional_extension_installs_alone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = MemoryConnection::pair();

        let initiator = NodeBuilder::new(PeerRole::Initiator)
            .extension(RecorderFactory {
                name: "audit",
                requires_peer: false,
                log: log.clone(),
            })
            .extension(RecorderFactory {
                name: "needs-peer",
                requires_peer: true,
                log: log.clone(),
            });
        let mut registry = ServiceRegistry::new();
        registry.register_unary(ServiceCallIdentifier::new("svc", "ping"), |n: u32| async move { Ok(n) });
        let acceptor = NodeBuilder::new(PeerRole::Acceptor).registry(registry);

        let (client, server) = tokio::join!(initiator.connect(a), acceptor.connect(b));
        let (client, server) = (client.unwrap(), server.unwrap());
        assert_eq!(client.active_extensions(), vec!["audit".to_string()]);
        assert!(server.active_extensions().is_empty());

        let echoed: u32 = client
            .client()
            .unary(&ServiceCallIdentifier::new("svc", "ping"), &9u32)
            .await
            .unwrap();
        assert_eq!(echoed, 9);

        let seen = log.lock().clone();
        assert_eq!(seen.first().map(String::as_str), Some("audit out open"));
        assert!(seen.contains(&"audit in data".to_string()));
    }
}
