//! Context module - A typed key-value context mirrored between two peers
//!
//! Local writes are stamped with per-key revisions, applied at once, and sent
//! to the peer as `rpc.context/update` batches. The peer accepts or rejects
//! each key; rejected writers adopt the winning slot, so both sides converge.

mod extension;
mod store;

pub use extension::{SessionContextFactory, CONTEXT_EXTENSION, CONTEXT_SERVICE};
pub use store::{
    ContextItem, ContextUpdateRequest, ContextUpdateResponse, Modification, ModificationOutcome,
    SlotSnapshot,
};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{RpcError, SerializationError};
use crate::protocol::{decode_payload, encode_payload, Payload, PeerRole, SerializationFormat};
use store::{Change, StagedOp, Store};

/// Typed, named key into a session context
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({})", self.name)
    }
}

type ListenerFn = Arc<dyn Fn(Option<&Payload>, Option<&Payload>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<String, Vec<(u64, ListenerFn)>>>,
}

/// Registration returned by [`SessionContext::add_listener`]
///
/// The listener stays installed until [`remove`](Self::remove) is called.
#[must_use = "a listener stays installed until its handle is removed"]
pub struct ListenerHandle {
    listeners: Arc<Listeners>,
    key: String,
    id: u64,
}

impl ListenerHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Uninstall the listener
    pub fn remove(self) {
        let mut by_key = self.listeners.by_key.lock();
        if let Some(entries) = by_key.get_mut(&self.key) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                by_key.remove(&self.key);
            }
        }
    }
}

/// Writes staged by [`SessionContext::update`], committed together
pub struct ContextBatch {
    format: SerializationFormat,
    ops: Vec<(String, StagedOp)>,
}

impl ContextBatch {
    fn stage(&mut self, key: &str, op: StagedOp) {
        // Last write to a key wins within a batch
        self.ops.retain(|(staged, _)| staged != key);
        self.ops.push((key.to_string(), op));
    }

    pub fn set<T: Serialize>(
        &mut self,
        key: &ContextKey<T>,
        value: &T,
    ) -> Result<&mut Self, SerializationError> {
        let payload = encode_payload(self.format, value)?;
        self.stage(key.name(), StagedOp::Set(payload));
        Ok(self)
    }

    pub fn remove<T>(&mut self, key: &ContextKey<T>) -> &mut Self {
        self.stage(key.name(), StagedOp::Remove);
        self
    }

    /// Make the peer check that it holds the same revision of `key`
    pub fn require<T>(&mut self, key: &ContextKey<T>) -> &mut Self {
        self.stage(key.name(), StagedOp::Require);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

enum Outgoing {
    Batch(ContextUpdateRequest),
    Flush(oneshot::Sender<()>),
}

/// Context shared with one peer
///
/// Install it on a node with [`SessionContextFactory`]. Writes made before
/// the node connects are queued and sent once it does.
pub struct SessionContext {
    format: SerializationFormat,
    role: Mutex<PeerRole>,
    store: Mutex<Store>,
    listeners: Arc<Listeners>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outgoing>>,
}

impl SessionContext {
    /// A context whose values are encoded as JSON
    pub fn new() -> Arc<Self> {
        Self::with_format(SerializationFormat::Json)
    }

    pub fn with_format(format: SerializationFormat) -> Arc<Self> {
        let (outbox, pending) = mpsc::unbounded_channel();
        Arc::new(Self {
            format,
            role: Mutex::new(PeerRole::Initiator),
            store: Mutex::new(Store::default()),
            listeners: Arc::new(Listeners::default()),
            outbox,
            pending: tokio::sync::Mutex::new(pending),
        })
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        key: &ContextKey<T>,
    ) -> Result<Option<T>, SerializationError> {
        let payload = self.store.lock().value(key.name()).cloned();
        payload.map(|payload| decode_payload(&payload)).transpose()
    }

    /// Revision of the key's current value
    pub fn revision<T>(&self, key: &ContextKey<T>) -> Option<u64> {
        self.store.lock().live_revision(key.name())
    }

    /// Names of keys that currently hold a value
    pub fn keys(&self) -> Vec<String> {
        self.store.lock().keys()
    }

    pub fn set<T: Serialize>(&self, key: &ContextKey<T>, value: &T) -> Result<(), SerializationError> {
        self.update(|batch| batch.set(key, value).map(|_| ()))
    }

    pub fn remove<T>(&self, key: &ContextKey<T>) {
        // Staging a remove cannot fail
        let _ = self.update(|batch| {
            batch.remove(key);
            Ok(())
        });
    }

    pub fn require<T>(&self, key: &ContextKey<T>) {
        let _ = self.update(|batch| {
            batch.require(key);
            Ok(())
        });
    }

    /// Stage several writes and commit them as one batch
    pub fn update<F>(&self, stage: F) -> Result<(), SerializationError>
    where
        F: FnOnce(&mut ContextBatch) -> Result<(), SerializationError>,
    {
        let mut batch = ContextBatch {
            format: self.format,
            ops: Vec::new(),
        };
        stage(&mut batch)?;
        if batch.is_empty() {
            return Ok(());
        }

        let changes = {
            let mut store = self.store.lock();
            let (request, changes) = store.commit_local(batch.ops);
            // Queued under the store lock so batches leave in revision order
            if !request.modifications.is_empty() {
                let _ = self.outbox.send(Outgoing::Batch(request));
            }
            changes
        };
        self.notify(changes);
        Ok(())
    }

    /// Watch one key; the callback gets the old and the new value
    pub fn add_listener<T, F>(&self, key: &ContextKey<T>, listener: F) -> ListenerHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(Option<T>, Option<T>) + Send + Sync + 'static,
    {
        let name = key.name();
        let erased: ListenerFn = Arc::new(move |old: Option<&Payload>, new: Option<&Payload>| {
            let decode = |payload: Option<&Payload>| {
                payload.and_then(|payload| match decode_payload::<T>(payload) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!(key = name, error = %e, "listener could not decode value");
                        None
                    }
                })
            };
            listener(decode(old), decode(new));
        });

        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .by_key
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, erased));

        ListenerHandle {
            listeners: self.listeners.clone(),
            key: name.to_string(),
            id,
        }
    }

    /// Wait until every batch queued so far has been answered by the peer
    pub async fn flush(&self) -> Result<(), RpcError> {
        let (done, acknowledged) = oneshot::channel();
        self.outbox
            .send(Outgoing::Flush(done))
            .map_err(|_| RpcError::connection_closed("context outbox is gone"))?;
        acknowledged
            .await
            .map_err(|_| RpcError::connection_closed("context sync stopped before flushing"))
    }

    pub(crate) fn set_role(&self, role: PeerRole) {
        *self.role.lock() = role;
    }

    pub(crate) fn apply_remote(&self, request: ContextUpdateRequest) -> ContextUpdateResponse {
        let role = *self.role.lock();
        let (response, changes) = self.store.lock().apply_remote(request, role);
        self.notify(changes);
        response
    }

    pub(crate) fn reconcile(&self, response: ContextUpdateResponse) {
        let role = *self.role.lock();
        let changes = self.store.lock().reconcile(response, role);
        self.notify(changes);
    }

    fn notify(&self, changes: Vec<Change>) {
        for change in changes {
            // Callbacks run outside the lock so they may touch the context
            let callbacks: Vec<ListenerFn> = self
                .listeners
                .by_key
                .lock()
                .get(&change.key)
                .map(|entries| entries.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default();
            for callback in callbacks {
                callback(change.old.as_ref(), change.new.as_ref());
            }
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("format", &self.format)
            .field("role", &*self.role.lock())
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: ContextKey<u32> = ContextKey::new("test.counter");
    const LABEL: ContextKey<String> = ContextKey::new("test.label");

    #[test]
    fn test_local_writes_and_reads() {
        let context = SessionContext::new();
        assert_eq!(context.get(&COUNTER).unwrap(), None);

        context.set(&COUNTER, &1).unwrap();
        context.set(&COUNTER, &2).unwrap();
        assert_eq!(context.get(&COUNTER).unwrap(), Some(2));
        assert_eq!(context.revision(&COUNTER), Some(2));

        context.remove(&COUNTER);
        assert_eq!(context.get(&COUNTER).unwrap(), None);
        assert_eq!(context.revision(&COUNTER), None);
    }

    #[test]
    fn test_listeners_see_old_and_new_until_removed() {
        let context = SessionContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = seen.clone();
            context.add_listener(&COUNTER, move |old, new| seen.lock().push((old, new)))
        };

        context.set(&COUNTER, &1).unwrap();
        context.set(&COUNTER, &5).unwrap();
        context.set(&LABEL, &"ignored".to_string()).unwrap();
        handle.remove();
        context.set(&COUNTER, &9).unwrap();

        assert_eq!(*seen.lock(), vec![(None, Some(1)), (Some(1), Some(5))]);
    }

    #[test]
    fn test_batch_commits_last_write_per_key() {
        let context = SessionContext::new();
        context
            .update(|batch| {
                batch.set(&COUNTER, &1)?.set(&LABEL, &"a".to_string())?;
                batch.set(&COUNTER, &3)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(context.get(&COUNTER).unwrap(), Some(3));
        assert_eq!(context.revision(&COUNTER), Some(1));
        assert_eq!(context.keys(), vec!["test.counter".to_string(), "test.label".to_string()]);
    }

    #[test]
    fn test_remote_batch_notifies_after_apply() {
        let context = SessionContext::new();
        context.set_role(PeerRole::Acceptor);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _handle = {
            let seen = seen.clone();
            let probe = context.clone();
            context.add_listener(&LABEL, move |_, new: Option<String>| {
                // The whole batch is visible by the time listeners run
                seen.lock().push((new, probe.get(&COUNTER).unwrap()));
            })
        };

        let mut request = ContextUpdateRequest::default();
        for (key, value) in [("test.label", "\"hi\""), ("test.counter", "7")] {
            request.modifications.insert(
                key.to_string(),
                Modification::Set {
                    old_revision: None,
                    item: ContextItem {
                        revision: 1,
                        value: Payload::Text(value.to_string()),
                    },
                },
            );
        }
        let response = context.apply_remote(request);
        assert!(response.rejected().next().is_none());
        assert_eq!(*seen.lock(), vec![(Some("hi".to_string()), Some(7))]);
    }
}
