//! RPC node
//!
//! One node per connection. The node:
//! - performs the handshake and installs the agreed extensions
//! - runs the single receive loop that reads the connection
//! - routes frames to waiting callers or to handler tasks
//! - funnels every outgoing frame through one writer task
//!
//! All call state lives in one table behind a `parking_lot` mutex. The guard
//! is never held across an `.await`.

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::call::{call_channel, CallEvents, CallFeed, InboundRequest};
use super::registry::ServiceRegistry;
use super::transport::ClientTransport;
use crate::config::Config;
use crate::error::{HandshakeError, RpcError};
use crate::extension::{Extension, ExtensionFactory, ExtensionPipeline};
use crate::network::Connection;
use crate::protocol::handshake::{self, ExtensionOffer, Hello};
use crate::protocol::{
    CallPattern, Frame, FrameSerializer, Payload, PeerRole, RpcReference, SerializationFormat,
    SerializedFrame, ServiceCallIdentifier, FORMAT_PRIORITY,
};

/// Runtime settings for a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Formats offered in the handshake
    pub formats: Vec<SerializationFormat>,
    pub handshake_timeout: Duration,
    /// How long a server-stream or bidi call may stay silent before its first
    /// item; `None` waits forever
    pub stream_start_timeout: Option<Duration>,
    /// How long frames for a finished call are silently dropped
    pub grace_window: Duration,
    /// Violations tolerated before the connection is closed; 0 disables
    pub max_protocol_violations: u32,
    /// Frames buffered ahead of the writer before senders suspend
    pub send_queue_depth: usize,
    /// Unread items one call may buffer; a call that overflows is terminated
    pub call_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            formats: FORMAT_PRIORITY.to_vec(),
            handshake_timeout: Duration::from_secs(5),
            stream_start_timeout: None,
            grace_window: Duration::from_secs(10),
            max_protocol_violations: 8,
            send_queue_depth: 256,
            call_buffer: 1024,
        }
    }
}

impl From<&Config> for NodeConfig {
    fn from(config: &Config) -> Self {
        let start = config.node.stream_start_timeout_ms;
        Self {
            formats: config.node.formats.clone(),
            handshake_timeout: Duration::from_millis(config.network.handshake_timeout_ms),
            stream_start_timeout: (start > 0).then(|| Duration::from_millis(start)),
            grace_window: Duration::from_millis(config.node.grace_window_ms),
            max_protocol_violations: config.node.max_protocol_violations,
            send_queue_depth: config.node.send_queue_depth.max(1),
            call_buffer: config.node.call_buffer.max(1),
        }
    }
}

/// Open references, for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenCalls {
    /// Calls this node started
    pub outbound: Vec<RpcReference>,
    /// Calls the peer started that are still being handled
    pub inbound: Vec<RpcReference>,
}

struct OutboundCall {
    call: ServiceCallIdentifier,
    pattern: CallPattern,
    feed: CallFeed,
    responded: bool,
}

struct InboundCall {
    call: ServiceCallIdentifier,
    pattern: CallPattern,
    /// `None` once the request half has ended (or never existed)
    requests: Option<CallFeed>,
    task: JoinHandle<()>,
}

struct CallTable {
    first_reference: u32,
    next_reference: u32,
    outbound: HashMap<RpcReference, OutboundCall>,
    inbound: HashMap<RpcReference, InboundCall>,
    retired: HashMap<RpcReference, Instant>,
    retired_order: VecDeque<(RpcReference, Instant)>,
    grace: Duration,
}

impl CallTable {
    fn new(role: PeerRole, grace: Duration) -> Self {
        Self {
            first_reference: role.first_reference(),
            next_reference: role.first_reference(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            grace,
        }
    }

    /// Next free reference of our parity, skipping open and recently closed ones
    fn allocate(&mut self) -> RpcReference {
        self.prune();
        loop {
            let candidate = RpcReference(self.next_reference);
            self.next_reference = self
                .next_reference
                .checked_add(2)
                .unwrap_or(self.first_reference);
            if !self.outbound.contains_key(&candidate) && !self.retired.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn retire(&mut self, reference: RpcReference) {
        let now = Instant::now();
        self.retired.insert(reference, now);
        self.retired_order.push_back((reference, now));
        self.prune();
    }

    fn is_retired(&self, reference: RpcReference) -> bool {
        self.retired
            .get(&reference)
            .is_some_and(|at| at.elapsed() < self.grace)
    }

    fn prune(&mut self) {
        while let Some(&(reference, at)) = self.retired_order.front() {
            if at.elapsed() < self.grace {
                break;
            }
            self.retired_order.pop_front();
            if self.retired.get(&reference) == Some(&at) {
                self.retired.remove(&reference);
            }
        }
    }
}

/// How a frame landed
enum Routed {
    Delivered,
    /// For a call that ended inside the grace window
    Late,
    Violation(String),
    /// The call's buffer was full; the call has been dropped locally
    Overflow(String),
    Unknown,
}

pub(crate) struct NodeInner {
    node_id: String,
    peer_node_id: String,
    role: PeerRole,
    connection: Arc<dyn Connection>,
    serializer: FrameSerializer,
    registry: ServiceRegistry,
    pipeline: ExtensionPipeline,
    config: NodeConfig,
    calls: Mutex<CallTable>,
    outgoing: mpsc::Sender<SerializedFrame>,
    violations: AtomicU32,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeInner {
    pub(crate) fn role(&self) -> PeerRole {
        self.role
    }

    pub(crate) fn format(&self) -> SerializationFormat {
        self.serializer.format()
    }

    pub(crate) fn stream_start_timeout(&self) -> Option<Duration> {
        self.config.stream_start_timeout
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Reserve a reference and the event channel for a new outbound call
    pub(crate) fn open_outbound(
        &self,
        call: &ServiceCallIdentifier,
        pattern: CallPattern,
    ) -> Result<(RpcReference, CallEvents), RpcError> {
        let mut table = self.calls.lock();
        // Checked under the lock so shutdown cannot miss this entry
        if self.is_closed() {
            return Err(RpcError::connection_closed("node is shut down"));
        }

        let reference = table.allocate();
        let (feed, rx) = call_channel(self.config.call_buffer);
        table.outbound.insert(
            reference,
            OutboundCall {
                call: call.clone(),
                pattern,
                feed,
                responded: false,
            },
        );
        debug!(reference = %reference, call = %call, ?pattern, "opening call");
        Ok((reference, rx))
    }

    pub(crate) fn is_outbound_open(&self, reference: RpcReference) -> bool {
        self.calls.lock().outbound.contains_key(&reference)
    }

    /// Drop an unfinished outbound call and tell the peer; never blocks
    pub(crate) fn cancel_outbound(&self, reference: RpcReference) {
        let removed = {
            let mut table = self.calls.lock();
            let removed = table.outbound.remove(&reference);
            if removed.is_some() {
                table.retire(reference);
            }
            removed
        };

        if let Some(call) = removed {
            debug!(reference = %reference, call = %call.call, "cancelling call");
            self.post_frame(Frame::Cancel { reference });
        }
    }

    pub(crate) fn encode_payload<T: serde::Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Payload, RpcError> {
        Ok(self.serializer.encode_payload(value)?)
    }

    pub(crate) fn data_frame<T: serde::Serialize + ?Sized>(
        &self,
        reference: RpcReference,
        value: &T,
    ) -> Result<Frame, RpcError> {
        let payload = self.encode_payload(value)?;
        Ok(Frame::Data { reference, payload })
    }

    /// Queue a frame for the writer, suspending while the queue is full
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        let Some(serialized) = self.prepare(frame)? else {
            return Ok(());
        };
        self.outgoing
            .send(serialized)
            .await
            .map_err(|_| RpcError::connection_closed("connection is closed"))
    }

    /// Queue a frame without waiting; used from `Drop`
    pub(crate) fn post_frame(&self, frame: Frame) {
        let serialized = match self.prepare(frame) {
            Ok(Some(serialized)) => serialized,
            Ok(None) => return,
            Err(e) => {
                trace!(error = %e, "not posting frame");
                return;
            }
        };

        match self.outgoing.try_send(serialized) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(serialized)) => {
                let outgoing = self.outgoing.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = outgoing.send(serialized).await;
                        });
                    }
                    Err(_) => debug!("send queue full and no runtime; frame dropped"),
                }
            }
        }
    }

    /// Outgoing interceptors, then encoding
    fn prepare(&self, frame: Frame) -> Result<Option<SerializedFrame>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::connection_closed("connection is closed"));
        }

        let Some(frame) = self.pipeline.outgoing(frame) else {
            trace!("outgoing frame dropped by extension");
            return Ok(None);
        };
        trace!(kind = frame.kind(), reference = ?frame.reference(), "sending frame");

        self.serializer
            .encode_frame(&frame)
            .map(Some)
            .map_err(|e| RpcError::internal(format!("failed to encode frame: {}", e)))
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<SerializedFrame>) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = self.connection.send(frame).await {
                self.shutdown(RpcError::connection_closed(format!("write failed: {}", e)))
                    .await;
                return;
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();

        let reason = loop {
            let received = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return,
                received = self.connection.receive() => received,
            };

            let serialized = match received {
                Ok(serialized) => serialized,
                Err(e) => break RpcError::connection_closed(format!("connection lost: {}", e)),
            };

            let frame = match self.serializer.decode_frame(&serialized) {
                Ok(frame) => frame,
                Err(e) => break RpcError::protocol_violation(format!("undecodable frame: {}", e)),
            };

            let Some(frame) = self.pipeline.incoming(frame) else {
                trace!("incoming frame dropped by extension");
                continue;
            };
            trace!(kind = frame.kind(), reference = ?frame.reference(), "received frame");

            if let Err(reason) = self.route(frame).await {
                break reason;
            }
        };

        self.shutdown(reason).await;
    }

    /// Route one frame; an error return is fatal for the connection
    async fn route(self: &Arc<Self>, frame: Frame) -> Result<(), RpcError> {
        match frame {
            Frame::Open {
                reference,
                call,
                pattern,
                payload,
            } => self.handle_open(reference, call, pattern, payload).await,

            Frame::Data { reference, payload } => {
                let routed = if self.role.owns(reference) {
                    self.outbound_data(reference, payload)
                } else {
                    self.inbound_data(reference, payload)
                };
                self.settle(reference, "data", routed).await
            }

            Frame::Close { reference } => {
                let routed = if self.role.owns(reference) {
                    self.outbound_end(reference, Ok(()))
                } else {
                    self.inbound_close(reference)
                };
                self.settle(reference, "close", routed).await
            }

            Frame::Error { reference, error } => {
                let routed = if self.role.owns(reference) {
                    self.outbound_end(reference, Err(error))
                } else {
                    self.inbound_abort(reference, "error")
                };
                self.settle(reference, "error", routed).await
            }

            Frame::Cancel { reference } => {
                let routed = if self.role.owns(reference) {
                    self.outbound_end(reference, Err(RpcError::cancelled("call cancelled by peer")))
                } else {
                    self.inbound_abort(reference, "cancel")
                };
                self.settle(reference, "cancel", routed).await
            }

            Frame::Warning { reference, message } => {
                warn!(peer = %self.peer_node_id, reference = ?reference, "peer warning: {}", message);
                Ok(())
            }
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        reference: RpcReference,
        call: ServiceCallIdentifier,
        pattern: CallPattern,
        payload: Option<Payload>,
    ) -> Result<(), RpcError> {
        if self.role.owns(reference) {
            // Answering would hit our own call with the same number
            return self
                .violation(Some(reference), &format!("peer opened {} with our parity", reference))
                .await;
        }

        let duplicate = self.calls.lock().inbound.remove(&reference);
        if let Some(existing) = duplicate {
            existing.task.abort();
            let message = format!("{} opened twice", reference);
            return self
                .reject_open(reference, RpcError::protocol_violation(message.clone()), Some(message))
                .await;
        }

        let Some(registered) = self.registry.lookup(&call) else {
            debug!(reference = %reference, call = %call, "no handler registered");
            let error = RpcError::not_found(format!("no handler registered for {}", call));
            return self.reject_open(reference, error, None).await;
        };

        if registered.pattern != pattern {
            let message = format!(
                "{} is registered as {:?} but was opened as {:?}",
                call, registered.pattern, pattern
            );
            return self
                .reject_open(reference, RpcError::protocol_violation(message.clone()), Some(message))
                .await;
        }

        if pattern.streams_requests() == payload.is_some() {
            let message = format!("open for {} {:?} has a misplaced request payload", call, pattern);
            return self
                .reject_open(reference, RpcError::protocol_violation(message.clone()), Some(message))
                .await;
        }

        let (requests, requests_rx) = if pattern.streams_requests() {
            let (feed, events) = call_channel(self.config.call_buffer);
            (Some(feed), Some(events))
        } else {
            (None, None)
        };

        debug!(reference = %reference, call = %call, ?pattern, "dispatching call");
        let request = InboundRequest::new(reference, payload, requests_rx, Arc::clone(self));
        let handler = registered.handler;
        let node = Arc::clone(self);

        // Spawned and recorded under one lock so the task cannot finish first
        let mut table = self.calls.lock();
        let task = tokio::spawn(async move {
            let outcome = handler(request).await;
            node.finish_inbound(reference, outcome).await;
        });
        table.inbound.insert(
            reference,
            InboundCall {
                call,
                pattern,
                requests,
                task,
            },
        );
        Ok(())
    }

    async fn reject_open(
        &self,
        reference: RpcReference,
        error: RpcError,
        violation: Option<String>,
    ) -> Result<(), RpcError> {
        self.calls.lock().retire(reference);
        self.send_frame(Frame::Error { reference, error }).await?;
        match violation {
            Some(message) => self.violation(Some(reference), &message).await,
            None => Ok(()),
        }
    }

    /// Report the end of a handler task to the caller
    async fn finish_inbound(&self, reference: RpcReference, outcome: Result<(), RpcError>) {
        let finished = {
            let mut table = self.calls.lock();
            let finished = table.inbound.remove(&reference);
            if finished.is_some() {
                table.retire(reference);
            }
            finished
        };
        // Already cancelled or torn down
        let Some(finished) = finished else {
            return;
        };

        let frame = match outcome {
            Ok(()) => Frame::Close { reference },
            Err(error) => {
                debug!(reference = %reference, call = %finished.call, error = %error, "handler failed");
                Frame::Error { reference, error }
            }
        };
        if let Err(e) = self.send_frame(frame).await {
            debug!(reference = %reference, error = %e, "could not report call result");
        }
    }

    fn outbound_data(&self, reference: RpcReference, payload: Payload) -> Routed {
        let mut table = self.calls.lock();
        let late = table.is_retired(reference);

        match table.outbound.entry(reference) {
            Entry::Occupied(mut entry) => {
                let call = entry.get_mut();
                if call.pattern.streams_responses() || !call.responded {
                    call.responded = true;
                    if call.feed.deliver(payload).is_ok() {
                        return Routed::Delivered;
                    }

                    let call = entry.remove();
                    let message = format!(
                        "{} buffered more than {} unread responses",
                        call.call, self.config.call_buffer
                    );
                    call.feed.finish(Err(RpcError::unavailable(message.clone())));
                    table.retire(reference);
                    return Routed::Overflow(message);
                }

                let call = entry.remove();
                let message = format!("second response for single-response call {}", call.call);
                call.feed
                    .finish(Err(RpcError::protocol_violation(message.clone())));
                table.retire(reference);
                Routed::Violation(message)
            }
            Entry::Vacant(_) if late => Routed::Late,
            Entry::Vacant(_) => Routed::Unknown,
        }
    }

    /// Terminal frame (close, error, cancel) for one of our calls
    fn outbound_end(&self, reference: RpcReference, outcome: Result<(), RpcError>) -> Routed {
        let mut table = self.calls.lock();
        match table.outbound.remove(&reference) {
            Some(call) => {
                call.feed.finish(outcome);
                table.retire(reference);
                Routed::Delivered
            }
            None if table.is_retired(reference) => Routed::Late,
            None => Routed::Unknown,
        }
    }

    fn inbound_data(&self, reference: RpcReference, payload: Payload) -> Routed {
        let mut table = self.calls.lock();
        let Some(call) = table.inbound.get_mut(&reference) else {
            return if table.is_retired(reference) {
                Routed::Late
            } else {
                Routed::Unknown
            };
        };

        if let Some(requests) = &call.requests {
            if requests.deliver(payload).is_ok() {
                return Routed::Delivered;
            }

            let message = format!(
                "{} buffered more than {} unread requests",
                call.call, self.config.call_buffer
            );
            if let Some(call) = table.inbound.remove(&reference) {
                call.task.abort();
            }
            table.retire(reference);
            return Routed::Overflow(message);
        }

        let message = format!(
            "request data for {} {:?} after its request half ended",
            call.call, call.pattern
        );
        if let Some(call) = table.inbound.remove(&reference) {
            call.task.abort();
        }
        table.retire(reference);
        Routed::Violation(message)
    }

    fn inbound_close(&self, reference: RpcReference) -> Routed {
        let mut table = self.calls.lock();
        let Some(call) = table.inbound.get_mut(&reference) else {
            return if table.is_retired(reference) {
                Routed::Late
            } else {
                Routed::Unknown
            };
        };

        if let Some(requests) = call.requests.take() {
            requests.finish(Ok(()));
            return Routed::Delivered;
        }

        let message = format!("close for {} {:?} with no open request half", call.call, call.pattern);
        if let Some(call) = table.inbound.remove(&reference) {
            call.task.abort();
        }
        table.retire(reference);
        Routed::Violation(message)
    }

    fn inbound_abort(&self, reference: RpcReference, kind: &'static str) -> Routed {
        let mut table = self.calls.lock();
        match table.inbound.remove(&reference) {
            Some(call) => {
                debug!(reference = %reference, call = %call.call, kind, "aborting handler");
                call.task.abort();
                table.retire(reference);
                Routed::Delivered
            }
            None if table.is_retired(reference) => Routed::Late,
            None => Routed::Unknown,
        }
    }

    async fn settle(
        &self,
        reference: RpcReference,
        kind: &'static str,
        routed: Routed,
    ) -> Result<(), RpcError> {
        match routed {
            Routed::Delivered => Ok(()),
            Routed::Late => {
                trace!(reference = %reference, kind, "dropping frame for recently closed call");
                Ok(())
            }
            Routed::Violation(message) => {
                self.answer_violation(reference, &message).await?;
                self.violation(Some(reference), &message).await
            }
            Routed::Overflow(message) => {
                warn!(peer = %self.peer_node_id, reference = %reference, "call terminated: {}", message);
                self.answer(reference, RpcError::unavailable(message)).await
            }
            Routed::Unknown => {
                let message = format!("{} frame for unknown call {}", kind, reference);
                // Terminal frames are never answered
                if kind != "error" && kind != "cancel" {
                    self.answer_violation(reference, &message).await?;
                }
                self.violation(Some(reference), &message).await
            }
        }
    }

    /// Terminate the offending call on the peer's side too
    async fn answer_violation(&self, reference: RpcReference, message: &str) -> Result<(), RpcError> {
        self.answer(reference, RpcError::protocol_violation(message)).await
    }

    /// Cancel our own call, or fail the peer's call with `error`
    async fn answer(&self, reference: RpcReference, error: RpcError) -> Result<(), RpcError> {
        let frame = if self.role.owns(reference) {
            Frame::Cancel { reference }
        } else {
            Frame::Error { reference, error }
        };
        self.send_frame(frame).await
    }

    async fn violation(&self, reference: Option<RpcReference>, message: &str) -> Result<(), RpcError> {
        let count = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(peer = %self.peer_node_id, reference = ?reference, count, "protocol violation: {}", message);

        let limit = self.config.max_protocol_violations;
        if limit == 0 || count < limit {
            return Ok(());
        }

        let notice = format!("closing connection after {} protocol violations", count);
        // Written directly so it is on the wire before the connection closes
        if let Ok(Some(frame)) = self.prepare(Frame::Warning {
            reference: None,
            message: notice.clone(),
        }) {
            let _ = self.connection.send(frame).await;
        }
        Err(RpcError::protocol_violation(notice))
    }

    /// Tear the node down; only the first call has any effect
    pub(crate) async fn shutdown(&self, reason: RpcError) {
        if self.closed.send_replace(true) {
            return;
        }

        if reason.is_connection_closed() {
            info!(peer = %self.peer_node_id, "{}", reason.message);
        } else {
            error!(peer = %self.peer_node_id, error = %reason, "shutting down node");
        }

        let (outbound, inbound) = {
            let mut table = self.calls.lock();
            (
                std::mem::take(&mut table.outbound),
                std::mem::take(&mut table.inbound),
            )
        };
        for call in outbound.into_values() {
            call.feed
                .finish(Err(RpcError::connection_closed(reason.message.clone())));
        }

        self.connection.close().await;

        for call in inbound.into_values() {
            call.task.abort();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    fn open_calls(&self) -> OpenCalls {
        let table = self.calls.lock();
        let mut outbound: Vec<_> = table.outbound.keys().copied().collect();
        let mut inbound: Vec<_> = table.inbound.keys().copied().collect();
        outbound.sort();
        inbound.sort();
        OpenCalls { outbound, inbound }
    }
}

/// Configures and connects an [`RpcNode`]
///
/// Cloneable so a server can build one node per accepted connection.
#[derive(Clone)]
pub struct NodeBuilder {
    role: PeerRole,
    config: NodeConfig,
    registry: ServiceRegistry,
    extensions: Vec<Arc<dyn ExtensionFactory>>,
}

impl NodeBuilder {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            config: NodeConfig::default(),
            registry: ServiceRegistry::new(),
            extensions: Vec::new(),
        }
    }

    pub fn role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add an extension; order matters and must match the peer's
    pub fn extension(mut self, factory: impl ExtensionFactory) -> Self {
        self.extensions.push(Arc::new(factory));
        self
    }

    pub fn extension_arc(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        self.extensions.push(factory);
        self
    }

    pub async fn connect<C: Connection>(self, connection: C) -> Result<RpcNode, HandshakeError> {
        self.connect_arc(Arc::new(connection)).await
    }

    /// Handshake over `connection`, then start the node's tasks
    pub async fn connect_arc(self, connection: Arc<dyn Connection>) -> Result<RpcNode, HandshakeError> {
        let node_id = Uuid::new_v4().to_string();
        let offers = self
            .extensions
            .iter()
            .map(|factory| ExtensionOffer {
                name: factory.name().to_string(),
                requires_peer: factory.requires_peer(),
            })
            .collect();
        let hello = Hello::new(node_id.clone(), self.role, self.config.formats.clone(), offers);

        let agreement =
            match handshake::perform(connection.as_ref(), &hello, self.config.handshake_timeout).await {
                Ok(agreement) => agreement,
                Err(e) => {
                    warn!(error = %e, "handshake failed");
                    connection.close().await;
                    return Err(e);
                }
            };

        let extensions: Vec<Arc<dyn Extension>> = agreement
            .active_extensions
            .iter()
            .map(|&index| self.extensions[index].create())
            .collect();

        let mut registry = self.registry;
        for extension in &extensions {
            Arc::clone(extension).register_services(&mut registry);
        }

        let (outgoing, outgoing_rx) = mpsc::channel(self.config.send_queue_depth.max(1));
        let inner = Arc::new(NodeInner {
            node_id,
            peer_node_id: agreement.peer_node_id,
            role: self.role,
            connection,
            serializer: FrameSerializer::new(agreement.format),
            registry,
            pipeline: ExtensionPipeline::new(extensions.clone()),
            calls: Mutex::new(CallTable::new(self.role, self.config.grace_window)),
            config: self.config,
            outgoing,
            violations: AtomicU32::new(0),
            closed: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        });

        let transport = ClientTransport::new(Arc::clone(&inner));
        for extension in &extensions {
            extension.bind(&transport);
        }

        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn(Arc::clone(&inner).write_loop(outgoing_rx)));
            for extension in extensions {
                let transport = transport.clone();
                tasks.push(tokio::spawn(async move {
                    let name = extension.name().to_string();
                    if let Err(e) = extension.run(transport).await {
                        warn!(extension = %name, error = %e, "extension task ended with error");
                    }
                }));
            }
        }
        tokio::spawn(Arc::clone(&inner).receive_loop());

        info!(
            node = %inner.node_id,
            peer = %inner.peer_node_id,
            role = ?inner.role,
            format = %inner.format(),
            extensions = ?inner.pipeline.names(),
            "node connected"
        );
        Ok(RpcNode { inner })
    }
}

/// A connected RPC endpoint
///
/// Both peers are symmetric: each serves its registry and can call the other.
/// Dropping the handle does not close the connection; use [`close`](Self::close).
#[derive(Clone)]
pub struct RpcNode {
    inner: Arc<NodeInner>,
}

impl RpcNode {
    pub fn builder(role: PeerRole) -> NodeBuilder {
        NodeBuilder::new(role)
    }

    /// Typed call helpers towards the peer
    pub fn client(&self) -> ClientTransport {
        ClientTransport::new(Arc::clone(&self.inner))
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn peer_node_id(&self) -> &str {
        &self.inner.peer_node_id
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    pub fn format(&self) -> SerializationFormat {
        self.inner.format()
    }

    /// Installed extensions, in pipeline order
    pub fn active_extensions(&self) -> Vec<String> {
        self.inner.pipeline.names()
    }

    pub fn open_calls(&self) -> OpenCalls {
        self.inner.open_calls()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the connection; open calls fail with `ConnectionClosed`
    pub async fn close(&self) {
        self.inner
            .shutdown(RpcError::connection_closed("closed locally"))
            .await;
    }

    /// Resolves once the node has shut down, for whatever reason
    pub async fn closed(&self) {
        self.inner.wait_closed().await;
    }
}

impl std::fmt::Debug for RpcNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcNode")
            .field("node_id", &self.inner.node_id)
            .field("peer_node_id", &self.inner.peer_node_id)
            .field("role", &self.inner.role)
            .field("format", &self.inner.format())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryConnection;
    use crate::rpc::{ResponseSink, Streaming};
    use crate::error::StatusCode;
    use serde::{Deserialize, Serialize};
    use std::cell::Cell;
    use std::sync::atomic::AtomicU64;

    fn id(s: &str) -> ServiceCallIdentifier {
        s.parse().unwrap()
    }

    async fn connected(registry: ServiceRegistry, config: NodeConfig) -> (RpcNode, RpcNode) {
        let (a, b) = MemoryConnection::pair();
        let initiator = NodeBuilder::new(PeerRole::Initiator).config(config.clone());
        let acceptor = NodeBuilder::new(PeerRole::Acceptor)
            .config(config)
            .registry(registry);
        let (left, right) = tokio::join!(initiator.connect(a), acceptor.connect(b));
        (left.unwrap(), right.unwrap())
    }

    /// Drive the acceptor side by hand to misbehave on purpose
    async fn raw_peer(registry: ServiceRegistry, config: NodeConfig) -> (RpcNode, MemoryConnection) {
        let (a, b) = MemoryConnection::pair();
        let raw = b.clone();
        let peer_hello = Hello::new("raw".into(), PeerRole::Initiator, vec![SerializationFormat::Json], vec![]);
        let acceptor = NodeBuilder::new(PeerRole::Acceptor).config(config).registry(registry);
        let (node, agreement) = tokio::join!(
            acceptor.connect(a),
            handshake::perform(&b, &peer_hello, Duration::from_secs(1))
        );
        assert_eq!(agreement.unwrap().format, SerializationFormat::Json);
        (node.unwrap(), raw)
    }

    async fn send_raw(conn: &MemoryConnection, frame: Frame) {
        let text = serde_json::to_string(&frame).unwrap();
        conn.send(SerializedFrame::Text(text)).await.unwrap();
    }

    async fn recv_raw(conn: &MemoryConnection) -> Frame {
        match tokio::time::timeout(Duration::from_secs(1), conn.receive())
            .await
            .unwrap()
            .unwrap()
        {
            SerializedFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_reference_allocation_parity_and_reuse() {
        let mut table = CallTable::new(PeerRole::Acceptor, Duration::from_secs(60));
        let first = table.allocate();
        let second = table.allocate();
        assert_eq!((first, second), (RpcReference(2), RpcReference(4)));

        table.retire(first);
        assert!(table.is_retired(first));
        assert!(!table.is_retired(second));

        table.next_reference = u32::MAX - 1;
        let wrapped = table.allocate();
        assert_eq!(wrapped, RpcReference(u32::MAX - 1));
        // Wraps to the start and skips the recently closed reference
        assert_eq!(table.allocate(), RpcReference(4));
    }

    #[test]
    fn test_retired_references_expire() {
        let mut table = CallTable::new(PeerRole::Initiator, Duration::ZERO);
        table.retire(RpcReference(1));
        assert!(!table.is_retired(RpcReference(1)));
        assert_eq!(table.allocate(), RpcReference(1));
    }

    #[tokio::test]
    async fn test_unary_and_node_metadata() {
        let mut registry = ServiceRegistry::new();
        registry.register_unary(id("math/double"), |x: i64| async move { Ok(x * 2) });
        let (client, server) = connected(registry, NodeConfig::default()).await;

        assert_eq!(client.format(), SerializationFormat::Binary);
        assert_eq!(client.peer_node_id(), server.node_id());
        assert_eq!(server.role(), PeerRole::Acceptor);

        let doubled: i64 = client.client().unary(&id("math/double"), &21i64).await.unwrap();
        assert_eq!(doubled, 42);
    }

    #[tokio::test]
    async fn test_handler_errors_reach_the_caller() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_unary(id("svc/denied"), |_: ()| async move {
                Err::<(), anyhow::Error>(RpcError::new(StatusCode::Conflict, "already taken").into())
            })
            .register_unary(id("svc/broken"), |_: ()| async move {
                Err::<(), _>(anyhow::anyhow!("disk full"))
            });
        let (client, _server) = connected(registry, NodeConfig::default()).await;
        let transport = client.client();

        let err = transport.unary::<_, ()>(&id("svc/denied"), &()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Conflict);
        let err = transport.unary::<_, ()>(&id("svc/broken"), &()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::InternalServerError);
        assert_eq!(err.message, "disk full");
    }

    /// Send but not Sync
    #[derive(Serialize)]
    struct Tally {
        count: Cell<u32>,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Counted {
        count: u32,
    }

    #[tokio::test]
    async fn test_responses_need_not_be_sync() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_unary(id("tally/one"), |n: u32| async move {
                Ok(Tally { count: Cell::new(n) })
            })
            .register_server_stream(id("tally/many"), |n: u32, sink: ResponseSink<Tally>| async move {
                let tally = Tally { count: Cell::new(0) };
                for _ in 0..n {
                    tally.count.set(tally.count.get() + 1);
                    sink.send(&tally).await?;
                }
                Ok(())
            });
        let (client, _server) = connected(registry, NodeConfig::default()).await;
        let transport = client.client();

        let one: Counted = transport.unary(&id("tally/one"), &7u32).await.unwrap();
        assert_eq!(one, Counted { count: 7 });

        let mut many: Streaming<Counted> = transport.server_stream(&id("tally/many"), &3u32).await.unwrap();
        let mut counts = Vec::new();
        while let Some(item) = many.message().await.unwrap() {
            counts.push(item.count);
        }
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unread_responses_overflow_terminates_call() {
        let sent = Arc::new(AtomicU64::new(0));
        let mut registry = ServiceRegistry::new();
        {
            let sent = sent.clone();
            registry.register_server_stream(id("feed/flood"), move |_: (), sink: ResponseSink<Vec<u8>>| {
                let sent = sent.clone();
                async move {
                    let item = vec![0u8; 1024];
                    loop {
                        sink.send(&item).await?;
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
        let config = NodeConfig {
            call_buffer: 8,
            ..NodeConfig::default()
        };
        let (client, server) = connected(registry, config).await;

        let mut flood: Streaming<Vec<u8>> = client
            .client()
            .server_stream(&id("feed/flood"), &())
            .await
            .unwrap();

        // Nobody reads: the call is dropped on both sides instead of growing
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.open_calls(), OpenCalls::default());
        assert_eq!(server.open_calls(), OpenCalls::default());
        let produced = sent.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sent.load(Ordering::SeqCst), produced);

        // What was buffered is still readable, then the reason
        let mut received = 0;
        let err = loop {
            match flood.message().await {
                Ok(Some(_)) => received += 1,
                Ok(None) => panic!("flood ended without an error"),
                Err(e) => break e,
            }
        };
        assert!(received <= 8);
        assert_eq!(err.code, StatusCode::ServiceUnavailable);

        assert!(!client.is_closed());
        assert_eq!(client.inner.violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unread_requests_overflow_fails_the_call() {
        let mut registry = ServiceRegistry::new();
        registry.register_client_stream(id("sink/ignore"), |_items: Streaming<u32>| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(0u32)
        });
        let config = NodeConfig {
            call_buffer: 4,
            ..NodeConfig::default()
        };
        let (client, server) = connected(registry, config).await;

        let call = client
            .client()
            .client_stream::<u32, u32>(&id("sink/ignore"))
            .await
            .unwrap();
        for n in 0..32u32 {
            // Sends fail once the peer has dropped the call
            if call.send(&n).await.is_err() {
                break;
            }
        }
        let err = call.finish().await.unwrap_err();
        assert_eq!(err.code, StatusCode::ServiceUnavailable);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.open_calls(), OpenCalls::default());
        assert!(!server.is_closed());
        assert_eq!(server.inner.violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pattern_mismatch_is_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register_server_stream(id("feed/ticks"), |n: u32, sink: ResponseSink<u32>| async move {
            for i in 0..n {
                sink.send(&i).await?;
            }
            Ok(())
        });
        let (client, _server) = connected(registry, NodeConfig::default()).await;

        let err = client
            .client()
            .unary::<_, u32>(&id("feed/ticks"), &3u32)
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::ProtocolViolation);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_stream_start_timeout_cancels_call() {
        let mut registry = ServiceRegistry::new();
        registry.register_server_stream(id("feed/silent"), |_: (), _sink: ResponseSink<u32>| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let config = NodeConfig {
            stream_start_timeout: Some(Duration::from_millis(50)),
            ..NodeConfig::default()
        };
        let (client, server) = connected(registry, config).await;

        let mut stream: Streaming<u32> = client
            .client()
            .server_stream(&id("feed/silent"), &())
            .await
            .unwrap();
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code, StatusCode::StreamTimeout);
        assert!(stream.message().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.open_calls(), OpenCalls::default());
        assert_eq!(server.open_calls(), OpenCalls::default());
    }

    #[tokio::test]
    async fn test_frames_for_unknown_calls_are_violations() {
        let config = NodeConfig {
            max_protocol_violations: 2,
            ..NodeConfig::default()
        };
        let (node, raw) = raw_peer(ServiceRegistry::new(), config).await;

        send_raw(
            &raw,
            Frame::Data {
                reference: RpcReference(7),
                payload: Payload::Text("1".into()),
            },
        )
        .await;
        match recv_raw(&raw).await {
            Frame::Error { reference, error } => {
                assert_eq!(reference, RpcReference(7));
                assert_eq!(error.code, StatusCode::ProtocolViolation);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!node.is_closed());

        // Unknown terminal frames are not answered, but still count
        send_raw(&raw, Frame::Cancel { reference: RpcReference(9) }).await;
        match recv_raw(&raw).await {
            Frame::Warning { reference: None, .. } => {}
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(1), node.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_fatal_and_late_frames_are_dropped() {
        let (node, raw) = raw_peer(ServiceRegistry::new(), NodeConfig::default()).await;

        send_raw(
            &raw,
            Frame::Open {
                reference: RpcReference(1),
                call: id("nobody/home"),
                pattern: CallPattern::ClientStream,
                payload: None,
            },
        )
        .await;
        match recv_raw(&raw).await {
            Frame::Error { error, .. } => assert!(error.is_not_found()),
            other => panic!("unexpected {:?}", other),
        }

        // Stragglers for the rejected call fall inside the grace window
        send_raw(
            &raw,
            Frame::Data {
                reference: RpcReference(1),
                payload: Payload::Text("1".into()),
            },
        )
        .await;
        send_raw(&raw, Frame::Close { reference: RpcReference(1) }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!node.is_closed());
        assert_eq!(node.inner.violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_fatal() {
        let (node, raw) = raw_peer(ServiceRegistry::new(), NodeConfig::default()).await;
        raw.send(SerializedFrame::Text("{not json".into())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), node.closed())
            .await
            .unwrap();
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_open_calls() {
        let mut registry = ServiceRegistry::new();
        registry.register_unary(id("svc/slow"), |_: ()| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let (client, server) = connected(registry, NodeConfig::default()).await;

        let transport = client.client();
        let pending = tokio::spawn(async move { transport.unary::<_, ()>(&id("svc/slow"), &()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.open_calls().inbound.len(), 1);

        client.close().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_connection_closed());

        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
        assert_eq!(server.open_calls(), OpenCalls::default());

        let err = client
            .client()
            .unary::<_, ()>(&id("svc/slow"), &())
            .await
            .unwrap_err();
        assert!(err.is_connection_closed());
    }
}
