//! Client transport
//!
//! Typed helpers for the four call patterns. Every helper allocates a
//! reference, sends `Open`, and hands back a handle whose drop cancels the
//! call if it has not finished.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::call::{CallGuard, ClientStreamCall, StreamSender, Streaming};
use super::node::NodeInner;
use crate::error::RpcError;
use crate::protocol::{
    CallPattern, Frame, Payload, PeerRole, RpcReference, SerializationFormat, ServiceCallIdentifier,
};

/// Calls towards the peer of one node
///
/// Cheap to clone; all clones share the node.
#[derive(Clone)]
pub struct ClientTransport {
    node: Arc<NodeInner>,
}

impl ClientTransport {
    pub(crate) fn new(node: Arc<NodeInner>) -> Self {
        Self { node }
    }

    /// This node's role on the connection
    pub fn role(&self) -> PeerRole {
        self.node.role()
    }

    pub fn format(&self) -> SerializationFormat {
        self.node.format()
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }

    /// Close the underlying node
    pub async fn close(&self) {
        self.node
            .shutdown(RpcError::connection_closed("closed by transport user"))
            .await;
    }

    /// One request, one response
    pub async fn unary<Req, Resp>(
        &self,
        call: &ServiceCallIdentifier,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.node.encode_payload(request)?;
        let (_, response) = self
            .start::<Resp>(call, CallPattern::Unary, Some(payload), false)
            .await?;
        response.single().await
    }

    /// Stream requests, then `finish` for the single response
    pub async fn client_stream<Req, Resp>(
        &self,
        call: &ServiceCallIdentifier,
    ) -> Result<ClientStreamCall<Req, Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (reference, response) = self
            .start::<Resp>(call, CallPattern::ClientStream, None, false)
            .await?;
        let sender = StreamSender::new(Arc::clone(&self.node), reference);
        Ok(ClientStreamCall::new(sender, response))
    }

    /// One request, a lazy stream of responses
    pub async fn server_stream<Req, Resp>(
        &self,
        call: &ServiceCallIdentifier,
        request: &Req,
    ) -> Result<Streaming<Resp>, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.node.encode_payload(request)?;
        let (_, responses) = self
            .start::<Resp>(call, CallPattern::ServerStream, Some(payload), true)
            .await?;
        Ok(responses)
    }

    /// Independent request and response streams
    pub async fn bidi_stream<Req, Resp>(
        &self,
        call: &ServiceCallIdentifier,
    ) -> Result<(StreamSender<Req>, Streaming<Resp>), RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (reference, responses) = self
            .start::<Resp>(call, CallPattern::BidiStream, None, true)
            .await?;
        Ok((StreamSender::new(Arc::clone(&self.node), reference), responses))
    }

    async fn start<Resp>(
        &self,
        call: &ServiceCallIdentifier,
        pattern: CallPattern,
        payload: Option<Payload>,
        streaming: bool,
    ) -> Result<(RpcReference, Streaming<Resp>), RpcError> {
        let (reference, events) = self.node.open_outbound(call, pattern)?;
        let guard = CallGuard::new(Arc::clone(&self.node), reference);
        let start_timeout = if streaming {
            self.node.stream_start_timeout()
        } else {
            None
        };
        // Built before sending so a failed send still releases the slot
        let responses = Streaming::outbound(events, guard, start_timeout);

        self.node
            .send_frame(Frame::Open {
                reference,
                call: call.clone(),
                pattern,
                payload,
            })
            .await?;
        Ok((reference, responses))
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("role", &self.role())
            .field("format", &self.format())
            .finish()
    }
}
