//! Service registry
//!
//! Maps a `ServiceCallIdentifier` to a call pattern and a type-erased handler.
//! The typed `register_*` methods wrap user handlers so the dispatcher only
//! ever sees one shape of function.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::call::{InboundRequest, ResponseSink, Streaming};
use crate::error::RpcError;
use crate::protocol::{CallPattern, ServiceCallIdentifier};

pub(crate) type ErasedHandler =
    Arc<dyn Fn(InboundRequest) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct RegisteredCall {
    pub pattern: CallPattern,
    pub handler: ErasedHandler,
}

/// Handlers this node serves, keyed by service call identifier
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    calls: HashMap<ServiceCallIdentifier, RegisteredCall>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One request, one response
    pub fn register_unary<Req, Resp, F, Fut>(
        &mut self,
        call: ServiceCallIdentifier,
        handler: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |mut request: InboundRequest| {
            let handler = handler.clone();
            async move {
                let input: Req = request.decode_request()?;
                let output = handler(input).await.map_err(RpcError::from_handler)?;
                let response = request.encode_response(&output)?;
                request.respond(response).await
            }
            .boxed()
        });
        self.insert(call, CallPattern::Unary, erased)
    }

    /// A stream of requests, one response
    pub fn register_client_stream<Req, Resp, F, Fut>(
        &mut self,
        call: ServiceCallIdentifier,
        handler: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |mut request: InboundRequest| {
            let handler = handler.clone();
            async move {
                let requests = request.request_stream::<Req>();
                let output = handler(requests).await.map_err(RpcError::from_handler)?;
                let response = request.encode_response(&output)?;
                request.respond(response).await
            }
            .boxed()
        });
        self.insert(call, CallPattern::ClientStream, erased)
    }

    /// One request, a stream of responses
    pub fn register_server_stream<Req, Resp, F, Fut>(
        &mut self,
        call: ServiceCallIdentifier,
        handler: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |mut request: InboundRequest| {
            let handler = handler.clone();
            async move {
                let input: Req = request.decode_request()?;
                let sink = request.response_sink::<Resp>();
                handler(input, sink).await.map_err(RpcError::from_handler)
            }
            .boxed()
        });
        self.insert(call, CallPattern::ServerStream, erased)
    }

    /// Streams in both directions
    pub fn register_bidi_stream<Req, Resp, F, Fut>(
        &mut self,
        call: ServiceCallIdentifier,
        handler: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Streaming<Req>, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |mut request: InboundRequest| {
            let handler = handler.clone();
            async move {
                let requests = request.request_stream::<Req>();
                let sink = request.response_sink::<Resp>();
                handler(requests, sink).await.map_err(RpcError::from_handler)
            }
            .boxed()
        });
        self.insert(call, CallPattern::BidiStream, erased)
    }

    fn insert(
        &mut self,
        call: ServiceCallIdentifier,
        pattern: CallPattern,
        handler: ErasedHandler,
    ) -> &mut Self {
        if self.calls.contains_key(&call) {
            warn!(call = %call, "replacing previously registered handler");
        }
        self.calls.insert(call, RegisteredCall { pattern, handler });
        self
    }

    pub fn contains(&self, call: &ServiceCallIdentifier) -> bool {
        self.calls.contains_key(call)
    }

    /// Pattern a call was registered with
    pub fn pattern(&self, call: &ServiceCallIdentifier) -> Option<CallPattern> {
        self.calls.get(call).map(|registered| registered.pattern)
    }

    /// Registered identifiers, sorted
    pub fn calls(&self) -> Vec<ServiceCallIdentifier> {
        let mut calls: Vec<_> = self.calls.keys().cloned().collect();
        calls.sort_by(|a, b| (&a.service_id, &a.call_id).cmp(&(&b.service_id, &b.call_id)));
        calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub(crate) fn lookup(&self, call: &ServiceCallIdentifier) -> Option<RegisteredCall> {
        self.calls.get(call).cloned()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.calls().into_iter().map(|call| {
                let pattern = self.pattern(&call);
                (call.to_string(), pattern)
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ServiceCallIdentifier {
        s.parse().unwrap()
    }

    #[test]
    fn test_patterns_are_recorded() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_unary(id("math/double"), |x: i64| async move { Ok(x * 2) })
            .register_server_stream(id("math/count"), |n: u32, sink: ResponseSink<u32>| async move {
                for i in 0..n {
                    sink.send(&i).await?;
                }
                Ok(())
            })
            .register_client_stream(id("math/sum"), |mut items: Streaming<i64>| async move {
                let mut total = 0;
                while let Some(item) = items.message().await? {
                    total += item;
                }
                Ok(total)
            });

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.pattern(&id("math/double")), Some(CallPattern::Unary));
        assert_eq!(registry.pattern(&id("math/count")), Some(CallPattern::ServerStream));
        assert_eq!(registry.pattern(&id("math/sum")), Some(CallPattern::ClientStream));
        assert!(!registry.contains(&id("math/missing")));
        assert_eq!(
            registry.calls(),
            vec![id("math/count"), id("math/double"), id("math/sum")]
        );
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = ServiceRegistry::new();
        registry.register_unary(id("svc/call"), |x: u8| async move { Ok(x) });
        registry.register_bidi_stream(
            id("svc/call"),
            |_requests: Streaming<u8>, _sink: ResponseSink<u8>| async move { Ok(()) },
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pattern(&id("svc/call")), Some(CallPattern::BidiStream));
    }
}
