//! Context sync extension
//!
//! Serves `rpc.context/update` for the peer's batches and drains the local
//! outbox, one batch at a time, towards the peer.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ContextUpdateRequest, ContextUpdateResponse, Outgoing, SessionContext};
use crate::extension::{Extension, ExtensionFactory};
use crate::protocol::{SerializationFormat, ServiceCallIdentifier};
use crate::rpc::{ClientTransport, ServiceRegistry};

pub const CONTEXT_EXTENSION: &str = "session-context";
pub const CONTEXT_SERVICE: &str = "rpc.context";

fn update_call() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new(CONTEXT_SERVICE, "update")
}

type ContextHook = Arc<dyn Fn(Arc<SessionContext>) + Send + Sync>;

enum Source {
    Shared(Arc<SessionContext>),
    PerConnection {
        format: SerializationFormat,
        on_connect: ContextHook,
    },
}

/// Installs context sync on a node
pub struct SessionContextFactory {
    source: Source,
}

impl SessionContextFactory {
    /// Sync `context` over the node this factory is given to
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            source: Source::Shared(context),
        }
    }

    /// A fresh context for every connection, handed to `on_connect`
    ///
    /// Meant for servers, where one builder serves many peers.
    pub fn per_connection<F>(format: SerializationFormat, on_connect: F) -> Self
    where
        F: Fn(Arc<SessionContext>) + Send + Sync + 'static,
    {
        Self {
            source: Source::PerConnection {
                format,
                on_connect: Arc::new(on_connect),
            },
        }
    }
}

impl ExtensionFactory for SessionContextFactory {
    fn name(&self) -> &str {
        CONTEXT_EXTENSION
    }

    fn create(&self) -> Arc<dyn Extension> {
        let context = match &self.source {
            Source::Shared(context) => context.clone(),
            Source::PerConnection { format, on_connect } => {
                let context = SessionContext::with_format(*format);
                on_connect(context.clone());
                context
            }
        };
        Arc::new(ContextSync { context })
    }
}

struct ContextSync {
    context: Arc<SessionContext>,
}

#[async_trait]
impl Extension for ContextSync {
    fn name(&self) -> &str {
        CONTEXT_EXTENSION
    }

    fn register_services(self: Arc<Self>, registry: &mut ServiceRegistry) {
        let context = self.context.clone();
        registry.register_unary(update_call(), move |request: ContextUpdateRequest| {
            let context = context.clone();
            async move { Ok(context.apply_remote(request)) }
        });
    }

    fn bind(&self, transport: &ClientTransport) {
        self.context.set_role(transport.role());
    }

    async fn run(self: Arc<Self>, transport: ClientTransport) -> anyhow::Result<()> {
        let call = update_call();
        let mut pending = self.context.pending.lock().await;

        while let Some(outgoing) = pending.recv().await {
            let request = match outgoing {
                Outgoing::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
                Outgoing::Batch(request) => request,
            };

            let keys = request.modifications.len();
            match transport
                .unary::<_, ContextUpdateResponse>(&call, &request)
                .await
            {
                Ok(response) => {
                    let rejected: Vec<&str> = response.rejected().collect();
                    if !rejected.is_empty() {
                        debug!(?rejected, "peer rejected context writes; reconciling");
                    }
                    self.context.reconcile(response);
                }
                Err(e) if e.is_connection_closed() => return Ok(()),
                Err(e) => warn!(keys, error = %e, "context update failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextKey;
    use crate::network::MemoryConnection;
    use crate::protocol::PeerRole;
    use crate::rpc::{NodeBuilder, RpcNode};

    const MODE: ContextKey<String> = ContextKey::new("session.mode");
    const LIMIT: ContextKey<u32> = ContextKey::new("session.limit");

    async fn linked(left: Arc<SessionContext>, right: Arc<SessionContext>) -> (RpcNode, RpcNode) {
        let (a, b) = MemoryConnection::pair();
        let initiator = NodeBuilder::new(PeerRole::Initiator).extension(SessionContextFactory::new(left));
        let acceptor = NodeBuilder::new(PeerRole::Acceptor).extension(SessionContextFactory::new(right));
        let (client, server) = tokio::join!(initiator.connect(a), acceptor.connect(b));
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_writes_reach_the_peer() {
        let (left, right) = (SessionContext::new(), SessionContext::new());
        // Written before the node exists; sent once it connects
        left.set(&LIMIT, &10).unwrap();
        let (_client, _server) = linked(left.clone(), right.clone()).await;

        left.set(&MODE, &"fast".to_string()).unwrap();
        left.flush().await.unwrap();
        assert_eq!(right.get(&LIMIT).unwrap(), Some(10));
        assert_eq!(right.get(&MODE).unwrap(), Some("fast".to_string()));

        right.remove(&LIMIT);
        right.flush().await.unwrap();
        assert_eq!(left.get(&LIMIT).unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_writes_converge() {
        let (left, right) = (SessionContext::new(), SessionContext::new());
        let (_client, _server) = linked(left.clone(), right.clone()).await;

        left.set(&MODE, &"left".to_string()).unwrap();
        right.set(&MODE, &"right".to_string()).unwrap();
        let (a, b) = tokio::join!(left.flush(), right.flush());
        a.unwrap();
        b.unwrap();

        assert_eq!(left.get(&MODE).unwrap(), right.get(&MODE).unwrap());
        assert_eq!(left.get(&MODE).unwrap(), Some("left".to_string()));
    }

    #[tokio::test]
    async fn test_per_connection_contexts_are_handed_out() {
        let handed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let factory = {
            let handed = handed.clone();
            SessionContextFactory::per_connection(SerializationFormat::Json, move |context| {
                handed.lock().push(context)
            })
        };
        let client_context = SessionContext::new();

        let (a, b) = MemoryConnection::pair();
        let initiator =
            NodeBuilder::new(PeerRole::Initiator).extension(SessionContextFactory::new(client_context.clone()));
        let acceptor = NodeBuilder::new(PeerRole::Acceptor).extension(factory);
        let (client, server) = tokio::join!(initiator.connect(a), acceptor.connect(b));
        let (_client, _server) = (client.unwrap(), server.unwrap());

        client_context.set(&LIMIT, &3).unwrap();
        client_context.flush().await.unwrap();

        let server_context = handed.lock().first().cloned().unwrap();
        assert_eq!(server_context.get(&LIMIT).unwrap(), Some(3));
    }
}
