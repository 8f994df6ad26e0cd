//! Per-call handles
//!
//! Everything a caller or a handler holds while a call is open: the typed
//! receiving side (`Streaming`), the typed sending sides (`StreamSender` for
//! callers, `ResponseSink` for handlers), and the guard that cancels an
//! abandoned outbound call.

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;

use super::node::NodeInner;
use crate::error::RpcError;
use crate::protocol::{decode_payload, Frame, Payload, RpcReference};

/// The receive loop's end of one call's delivery channel
///
/// Items are buffered up to a fixed depth. The outcome travels separately so
/// it is never stuck behind a full buffer.
pub(crate) struct CallFeed {
    data: mpsc::Sender<Payload>,
    end: oneshot::Sender<Result<(), RpcError>>,
}

/// The call's buffer was full when an item arrived
#[derive(Debug)]
pub(crate) struct Overflow;

impl CallFeed {
    /// Buffer one item; a receiver that is gone swallows it
    pub(crate) fn deliver(&self, payload: Payload) -> Result<(), Overflow> {
        match self.data.try_send(payload) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Overflow),
        }
    }

    /// End the call; items already buffered are read before the outcome
    pub(crate) fn finish(self, outcome: Result<(), RpcError>) {
        let _ = self.end.send(outcome);
    }
}

/// The consuming end of a [`CallFeed`]
pub(crate) struct CallEvents {
    data: mpsc::Receiver<Payload>,
    drained: bool,
    end: Option<oneshot::Receiver<Result<(), RpcError>>>,
}

impl CallEvents {
    /// An already finished channel with nothing in it
    fn finished() -> Self {
        let (feed, events) = call_channel(1);
        feed.finish(Ok(()));
        events
    }

    /// `Ready(None)` once the call ended cleanly
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Payload, RpcError>>> {
        if !self.drained {
            match self.data.poll_recv(cx) {
                Poll::Ready(Some(payload)) => return Poll::Ready(Some(Ok(payload))),
                Poll::Ready(None) => self.drained = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        let Some(end) = self.end.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = ready!(Pin::new(end).poll(cx));
        self.end = None;
        match outcome {
            Ok(Ok(())) => Poll::Ready(None),
            Ok(Err(error)) => Poll::Ready(Some(Err(error))),
            Err(_) => Poll::Ready(Some(Err(RpcError::cancelled("call ended without an outcome")))),
        }
    }
}

/// Delivery channel for one call holding at most `depth` unread items
pub(crate) fn call_channel(depth: usize) -> (CallFeed, CallEvents) {
    let (data, data_rx) = mpsc::channel(depth.max(1));
    let (end, end_rx) = oneshot::channel();
    (
        CallFeed { data, end },
        CallEvents {
            data: data_rx,
            drained: false,
            end: Some(end_rx),
        },
    )
}

/// Cancels an outbound call when dropped before it finished
pub(crate) struct CallGuard {
    node: Arc<NodeInner>,
    reference: RpcReference,
    completed: bool,
}

impl CallGuard {
    pub(crate) fn new(node: Arc<NodeInner>, reference: RpcReference) -> Self {
        Self {
            node,
            reference,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.node.cancel_outbound(self.reference);
        }
    }
}

/// A lazy sequence of typed items received on one call
///
/// Used for server-stream and bidi responses on the caller side and for
/// request streams on the handler side. The sequence ends when the peer closes
/// its half; an error item terminates it. Dropping an unfinished outbound
/// stream cancels the call.
pub struct Streaming<T> {
    events: CallEvents,
    reference: RpcReference,
    guard: Option<CallGuard>,
    start_deadline: Option<Pin<Box<Sleep>>>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Streaming<T> {
    pub(crate) fn inbound(reference: RpcReference, events: CallEvents) -> Self {
        Self {
            events,
            reference,
            guard: None,
            start_deadline: None,
            done: false,
            _marker: PhantomData,
        }
    }

    pub(crate) fn outbound(
        events: CallEvents,
        guard: CallGuard,
        start_timeout: Option<Duration>,
    ) -> Self {
        Self {
            events,
            reference: guard.reference,
            guard: Some(guard),
            start_deadline: start_timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            done: false,
            _marker: PhantomData,
        }
    }

    pub fn reference(&self) -> RpcReference {
        self.reference
    }

    /// Whether the sequence has ended
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Cancel the call; no further items are delivered
    pub fn cancel(self) {
        drop(self)
    }

    /// The caller got what it needed; the trailing close is not awaited
    pub(crate) fn complete(&mut self) {
        self.done = true;
        if let Some(guard) = self.guard.as_mut() {
            guard.complete();
        }
    }
}

impl<T: DeserializeOwned> Streaming<T> {
    /// Next item, `Ok(None)` once the peer closed its half
    pub async fn message(&mut self) -> Result<Option<T>, RpcError> {
        futures::StreamExt::next(self).await.transpose()
    }

    /// Wait for exactly one item; used for single-response calls
    pub(crate) async fn single(mut self) -> Result<T, RpcError> {
        let item = self.message().await;
        self.complete();
        item?.ok_or_else(|| {
            RpcError::protocol_violation(format!("call {} closed without a response", self.reference))
        })
    }
}

impl<T: DeserializeOwned> Stream for Streaming<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.events.poll_event(cx) {
            Poll::Ready(Some(Ok(payload))) => {
                this.start_deadline = None;
                Poll::Ready(Some(decode_payload(&payload).map_err(RpcError::from)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.complete();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => {
                let timed_out = this
                    .start_deadline
                    .as_mut()
                    .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready());
                if !timed_out {
                    return Poll::Pending;
                }

                tracing::debug!(reference = %this.reference, "stream did not start in time");
                this.start_deadline = None;
                this.done = true;
                // Dropping the guard cancels the call on both sides
                this.guard.take();
                Poll::Ready(Some(Err(RpcError::stream_timeout(format!(
                    "stream {} produced nothing within the start window",
                    this.reference
                )))))
            }
        }
    }
}

/// Caller side of a request stream (client-stream and bidi calls)
///
/// Dropping the sender without [`close`](Self::close) still ends the request
/// stream.
pub struct StreamSender<T> {
    node: Arc<NodeInner>,
    reference: RpcReference,
    closed: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> StreamSender<T> {
    pub(crate) fn new(node: Arc<NodeInner>, reference: RpcReference) -> Self {
        Self {
            node,
            reference,
            closed: false,
            _marker: PhantomData,
        }
    }

    pub fn reference(&self) -> RpcReference {
        self.reference
    }

    /// Send one request item
    ///
    /// Fails once the call has terminated; the terminating error itself is
    /// reported on the response side. The item is encoded before the returned
    /// future is first polled, so it need not outlive the call.
    pub fn send(&self, item: &T) -> impl Future<Output = Result<(), RpcError>> + Send + '_ {
        let frame = self
            .check_open()
            .and_then(|()| self.node.data_frame(self.reference, item));
        async move { self.node.send_frame(frame?).await }
    }

    fn check_open(&self) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::bad_request(format!(
                "request stream {} already closed",
                self.reference
            )));
        }
        if !self.node.is_outbound_open(self.reference) {
            return Err(RpcError::cancelled(format!("call {} is no longer open", self.reference)));
        }
        Ok(())
    }

    /// End the request stream
    pub async fn close(&mut self) -> Result<(), RpcError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.node
            .send_frame(Frame::Close {
                reference: self.reference,
            })
            .await
    }
}

impl<T> Drop for StreamSender<T> {
    fn drop(&mut self) {
        if !self.closed && self.node.is_outbound_open(self.reference) {
            self.node.post_frame(Frame::Close {
                reference: self.reference,
            });
        }
    }
}

/// Handler side of a response stream (server-stream and bidi calls)
pub struct ResponseSink<T> {
    node: Arc<NodeInner>,
    reference: RpcReference,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> ResponseSink<T> {
    pub(crate) fn new(node: Arc<NodeInner>, reference: RpcReference) -> Self {
        Self {
            node,
            reference,
            _marker: PhantomData,
        }
    }

    pub fn reference(&self) -> RpcReference {
        self.reference
    }

    /// Send one response item to the caller
    ///
    /// Encodes eagerly; the returned future does not borrow `item`.
    pub fn send(&self, item: &T) -> impl Future<Output = Result<(), RpcError>> + Send + '_ {
        let frame = self.node.data_frame(self.reference, item);
        async move { self.node.send_frame(frame?).await }
    }
}

/// An open client-stream call: send requests, then `finish` for the response
pub struct ClientStreamCall<Req, Resp> {
    sender: StreamSender<Req>,
    response: Streaming<Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStreamCall<Req, Resp> {
    pub(crate) fn new(sender: StreamSender<Req>, response: Streaming<Resp>) -> Self {
        Self { sender, response }
    }

    pub fn reference(&self) -> RpcReference {
        self.sender.reference()
    }

    pub fn send(&self, item: &Req) -> impl Future<Output = Result<(), RpcError>> + Send + '_ {
        self.sender.send(item)
    }

    /// Close the request stream and wait for the single response
    pub async fn finish(self) -> Result<Resp, RpcError> {
        let Self {
            mut sender,
            response,
        } = self;
        if sender.node.is_outbound_open(sender.reference) {
            sender.close().await?;
        } else {
            sender.closed = true;
        }
        response.single().await
    }
}

/// Handler-side view of an inbound call, handed to registered handlers
pub(crate) struct InboundRequest {
    reference: RpcReference,
    first: Option<Payload>,
    requests: Option<CallEvents>,
    node: Arc<NodeInner>,
}

impl InboundRequest {
    pub(crate) fn new(
        reference: RpcReference,
        first: Option<Payload>,
        requests: Option<CallEvents>,
        node: Arc<NodeInner>,
    ) -> Self {
        Self {
            reference,
            first,
            requests,
            node,
        }
    }

    pub(crate) fn decode_request<T: DeserializeOwned>(&mut self) -> Result<T, RpcError> {
        let payload = self.first.take().ok_or_else(|| {
            RpcError::protocol_violation(format!("call {} carried no request", self.reference))
        })?;
        Ok(decode_payload(&payload)?)
    }

    pub(crate) fn request_stream<T>(&mut self) -> Streaming<T> {
        let events = self.requests.take().unwrap_or_else(CallEvents::finished);
        Streaming::inbound(self.reference, events)
    }

    pub(crate) fn response_sink<T: Serialize>(&self) -> ResponseSink<T> {
        ResponseSink::new(self.node.clone(), self.reference)
    }

    /// Encode the single response
    pub(crate) fn encode_response<T: Serialize>(&self, value: &T) -> Result<Frame, RpcError> {
        self.node.data_frame(self.reference, value)
    }

    pub(crate) async fn respond(&self, response: Frame) -> Result<(), RpcError> {
        self.node.send_frame(response).await
    }
}
