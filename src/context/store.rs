//! Revision-tracked slots and the rules for merging writes
//!
//! Every key holds a slot stamped with a revision and the role of the peer
//! that wrote it. A removed key keeps a tombstone slot so its revision keeps
//! counting. Slots are ordered by `(revision, writer rank)`, where the
//! connection initiator outranks the acceptor on equal revisions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::protocol::{Payload, PeerRole};

/// A value together with the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    pub revision: u64,
    pub value: Payload,
}

/// One key's change inside a batch; revisions are the sender's preconditions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Assert the live revision without changing anything
    Required { old_revision: Option<u64> },
    Set {
        old_revision: Option<u64>,
        item: ContextItem,
    },
    /// The tombstone is stamped `old_revision + 1`
    Remove { old_revision: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdateRequest {
    pub modifications: BTreeMap<String, Modification>,
}

/// The receiver's slot, returned with a rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub revision: u64,
    pub writer: PeerRole,
    /// `None` for a removed key
    pub value: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationOutcome {
    Applied,
    Rejected { current: Option<SlotSnapshot> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdateResponse {
    pub outcomes: BTreeMap<String, ModificationOutcome>,
}

impl ContextUpdateResponse {
    pub fn rejected(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ModificationOutcome::Rejected { .. }))
            .map(|(key, _)| key.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Writer {
    Local,
    Remote,
}

impl Writer {
    fn role(self, local: PeerRole) -> PeerRole {
        match self {
            Writer::Local => local,
            Writer::Remote => local.opposite(),
        }
    }

    fn from_role(role: PeerRole, local: PeerRole) -> Self {
        if role == local {
            Writer::Local
        } else {
            Writer::Remote
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    revision: u64,
    writer: Writer,
    value: Option<Payload>,
}

impl Slot {
    /// Revision of the current value; tombstones have none
    fn live_revision(&self) -> Option<u64> {
        self.value.as_ref().map(|_| self.revision)
    }

    fn rank(&self, local: PeerRole) -> (u64, u8) {
        (self.revision, self.writer.role(local).rank())
    }

    fn snapshot(&self, local: PeerRole) -> SlotSnapshot {
        SlotSnapshot {
            revision: self.revision,
            writer: self.writer.role(local),
            value: self.value.clone(),
        }
    }
}

/// A value change to report to listeners
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub key: String,
    pub old: Option<Payload>,
    pub new: Option<Payload>,
}

/// A local write waiting to be committed
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StagedOp {
    Set(Payload),
    Remove,
    Require,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    slots: HashMap<String, Slot>,
}

impl Store {
    pub fn value(&self, key: &str) -> Option<&Payload> {
        self.slots.get(key).and_then(|slot| slot.value.as_ref())
    }

    pub fn live_revision(&self, key: &str) -> Option<u64> {
        self.slots.get(key).and_then(Slot::live_revision)
    }

    /// Keys that currently hold a value, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stamp local writes and build the batch that mirrors them
    pub fn commit_local(
        &mut self,
        ops: Vec<(String, StagedOp)>,
    ) -> (ContextUpdateRequest, Vec<Change>) {
        let mut request = ContextUpdateRequest::default();
        let mut changes = Vec::new();

        for (key, op) in ops {
            let current = self.slots.get(&key);
            let live = current.and_then(Slot::live_revision);

            match op {
                StagedOp::Set(value) => {
                    let revision = current.map_or(1, |slot| slot.revision + 1);
                    let old = current.and_then(|slot| slot.value.clone());
                    self.slots.insert(
                        key.clone(),
                        Slot {
                            revision,
                            writer: Writer::Local,
                            value: Some(value.clone()),
                        },
                    );
                    request.modifications.insert(
                        key.clone(),
                        Modification::Set {
                            old_revision: live,
                            item: ContextItem {
                                revision,
                                value: value.clone(),
                            },
                        },
                    );
                    changes.push(Change {
                        key,
                        old,
                        new: Some(value),
                    });
                }
                StagedOp::Remove => {
                    // Removing an absent key is a no-op
                    let Some(old_revision) = live else {
                        continue;
                    };
                    let Some(slot) = self.slots.get_mut(&key) else {
                        continue;
                    };
                    let old = slot.value.take();
                    slot.revision = old_revision + 1;
                    slot.writer = Writer::Local;
                    request
                        .modifications
                        .insert(key.clone(), Modification::Remove { old_revision });
                    changes.push(Change {
                        key,
                        old,
                        new: None,
                    });
                }
                StagedOp::Require => {
                    request
                        .modifications
                        .insert(key, Modification::Required { old_revision: live });
                }
            }
        }

        (request, changes)
    }

    /// Evaluate a peer's batch key by key
    pub fn apply_remote(
        &mut self,
        request: ContextUpdateRequest,
        local: PeerRole,
    ) -> (ContextUpdateResponse, Vec<Change>) {
        let mut response = ContextUpdateResponse::default();
        let mut changes = Vec::new();

        for (key, modification) in request.modifications {
            let (precondition, incoming) = match modification {
                Modification::Required { old_revision } => {
                    let outcome = if self.live_revision(&key) == old_revision {
                        ModificationOutcome::Applied
                    } else {
                        self.rejection(&key, local)
                    };
                    response.outcomes.insert(key, outcome);
                    continue;
                }
                Modification::Set { old_revision, item } => (
                    old_revision,
                    Slot {
                        revision: item.revision,
                        writer: Writer::Remote,
                        value: Some(item.value),
                    },
                ),
                Modification::Remove { old_revision } => (
                    Some(old_revision),
                    Slot {
                        revision: old_revision.saturating_add(1),
                        writer: Writer::Remote,
                        value: None,
                    },
                ),
            };

            // A re-delivered write is acknowledged without touching the slot
            if self.slots.get(&key) == Some(&incoming) {
                response.outcomes.insert(key, ModificationOutcome::Applied);
                continue;
            }

            let outcome = match self.offer(&key, precondition, incoming, local) {
                Some(change) => {
                    if change.old != change.new {
                        changes.push(change);
                    }
                    ModificationOutcome::Applied
                }
                None => self.rejection(&key, local),
            };
            response.outcomes.insert(key, outcome);
        }

        (response, changes)
    }

    /// Adopt the peer's slots for rejected keys where they outrank ours
    pub fn reconcile(
        &mut self,
        response: ContextUpdateResponse,
        local: PeerRole,
    ) -> Vec<Change> {
        let mut changes = Vec::new();

        for (key, outcome) in response.outcomes {
            let ModificationOutcome::Rejected {
                current: Some(snapshot),
            } = outcome
            else {
                continue;
            };

            let theirs = Slot {
                revision: snapshot.revision,
                writer: Writer::from_role(snapshot.writer, local),
                value: snapshot.value,
            };
            let adopt = match self.slots.get(&key) {
                Some(ours) => theirs.rank(local) > ours.rank(local),
                None => true,
            };
            if !adopt {
                continue;
            }

            let old = self.slots.get(&key).and_then(|slot| slot.value.clone());
            let new = theirs.value.clone();
            self.slots.insert(key.clone(), theirs);
            if old != new {
                changes.push(Change { key, old, new });
            }
        }

        changes
    }

    /// Store `incoming` if its precondition holds or it outranks the slot
    fn offer(
        &mut self,
        key: &str,
        precondition: Option<u64>,
        incoming: Slot,
        local: PeerRole,
    ) -> Option<Change> {
        let accepted = match self.slots.get(key) {
            None => true,
            Some(current) => {
                let matches =
                    current.live_revision() == precondition && incoming.revision > current.revision;
                matches || incoming.rank(local) > current.rank(local)
            }
        };
        if !accepted {
            return None;
        }

        let old = self.slots.get(key).and_then(|slot| slot.value.clone());
        let new = incoming.value.clone();
        self.slots.insert(key.to_string(), incoming);
        Some(Change {
            key: key.to_string(),
            old,
            new,
        })
    }

    fn rejection(&self, key: &str, local: PeerRole) -> ModificationOutcome {
        ModificationOutcome::Rejected {
            current: self.slots.get(key).map(|slot| slot.snapshot(local)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    fn set(old_revision: Option<u64>, revision: u64, value: &str) -> Modification {
        Modification::Set {
            old_revision,
            item: ContextItem {
                revision,
                value: text(value),
            },
        }
    }

    fn batch(key: &str, modification: Modification) -> ContextUpdateRequest {
        ContextUpdateRequest {
            modifications: BTreeMap::from([(key.to_string(), modification)]),
        }
    }

    #[test]
    fn test_local_set_stamps_revisions() {
        let mut store = Store::default();
        let (request, changes) = store.commit_local(vec![("k".into(), StagedOp::Set(text("1")))]);
        assert_eq!(request, batch("k", set(None, 1, "1")));
        assert_eq!(changes[0].new, Some(text("1")));

        let (request, _) = store.commit_local(vec![("k".into(), StagedOp::Set(text("2")))]);
        assert_eq!(request, batch("k", set(Some(1), 2, "2")));
        assert_eq!(store.live_revision("k"), Some(2));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let mut store = Store::default();
        store.commit_local(vec![("k".into(), StagedOp::Set(text("1")))]);
        let (request, changes) = store.commit_local(vec![("k".into(), StagedOp::Remove)]);
        assert_eq!(request, batch("k", Modification::Remove { old_revision: 1 }));
        assert_eq!(changes[0].new, None);
        assert_eq!(store.live_revision("k"), None);
        assert!(store.keys().is_empty());

        // A later set continues from the tombstone's revision
        let (request, _) = store.commit_local(vec![("k".into(), StagedOp::Set(text("3")))]);
        assert_eq!(request, batch("k", set(None, 3, "3")));

        // Removing something absent sends nothing
        let (request, changes) = store.commit_local(vec![("gone".into(), StagedOp::Remove)]);
        assert!(request.modifications.is_empty());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_stale_set_is_rejected_and_changes_nothing() {
        let mut store = Store::default();
        store.commit_local(vec![("k".into(), StagedOp::Set(text("a")))]);
        store.commit_local(vec![("k".into(), StagedOp::Set(text("b")))]);
        store.commit_local(vec![("k".into(), StagedOp::Set(text("c")))]);

        let (response, changes) = store.apply_remote(batch("k", set(Some(1), 2, "stale")), PeerRole::Initiator);
        assert!(changes.is_empty());
        match &response.outcomes["k"] {
            ModificationOutcome::Rejected { current: Some(current) } => {
                assert_eq!(current.revision, 3);
                assert_eq!(current.writer, PeerRole::Initiator);
                assert_eq!(current.value, Some(text("c")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.value("k"), Some(&text("c")));
        assert_eq!(store.live_revision("k"), Some(3));

        // Applying the same stale write again is just as harmless
        let (again, _) = store.apply_remote(batch("k", set(Some(1), 2, "stale")), PeerRole::Initiator);
        assert_eq!(again, response);
    }

    #[test]
    fn test_matching_precondition_is_applied() {
        let mut store = Store::default();
        let (response, changes) = store.apply_remote(batch("k", set(None, 1, "x")), PeerRole::Acceptor);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert_eq!(changes.len(), 1);

        let (response, _) = store.apply_remote(batch("k", set(Some(1), 2, "y")), PeerRole::Acceptor);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert_eq!(store.value("k"), Some(&text("y")));
        assert_eq!(store.live_revision("k"), Some(2));
    }

    #[test]
    fn test_required_only_checks() {
        let mut store = Store::default();
        store.commit_local(vec![("k".into(), StagedOp::Set(text("1")))]);

        let ok = batch("k", Modification::Required { old_revision: Some(1) });
        let (response, changes) = store.apply_remote(ok, PeerRole::Initiator);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert!(changes.is_empty());

        let stale = batch("k", Modification::Required { old_revision: None });
        let (response, _) = store.apply_remote(stale, PeerRole::Initiator);
        assert_eq!(response.rejected().collect::<Vec<_>>(), vec!["k"]);
    }

    #[test]
    fn test_concurrent_sets_converge_on_initiator_write() {
        let mut initiator = Store::default();
        let mut acceptor = Store::default();

        let (from_initiator, _) = initiator.commit_local(vec![("k".into(), StagedOp::Set(text("1")))]);
        let (from_acceptor, _) = acceptor.commit_local(vec![("k".into(), StagedOp::Set(text("2")))]);

        let (reply_to_initiator, _) = acceptor.apply_remote(from_initiator, PeerRole::Acceptor);
        let (reply_to_acceptor, _) = initiator.apply_remote(from_acceptor, PeerRole::Initiator);
        assert_eq!(reply_to_initiator.outcomes["k"], ModificationOutcome::Applied);
        assert!(matches!(reply_to_acceptor.outcomes["k"], ModificationOutcome::Rejected { .. }));

        initiator.reconcile(reply_to_initiator, PeerRole::Initiator);
        acceptor.reconcile(reply_to_acceptor, PeerRole::Acceptor);

        for store in [&initiator, &acceptor] {
            assert_eq!(store.value("k"), Some(&text("1")));
            assert_eq!(store.live_revision("k"), Some(1));
        }
    }

    #[test]
    fn test_higher_revision_wins_regardless_of_role() {
        let mut initiator = Store::default();
        initiator.commit_local(vec![("k".into(), StagedOp::Set(text("a")))]);

        // The acceptor wrote twice without seeing the initiator's write
        let (response, changes) =
            initiator.apply_remote(batch("k", set(Some(1), 2, "b")), PeerRole::Initiator);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert_eq!(changes[0].old, Some(text("a")));
        assert_eq!(initiator.value("k"), Some(&text("b")));
    }

    #[test]
    fn test_redelivered_write_is_acknowledged() {
        let mut store = Store::default();
        let write = batch("k", set(None, 1, "x"));
        store.apply_remote(write.clone(), PeerRole::Acceptor);
        let (response, changes) = store.apply_remote(write, PeerRole::Acceptor);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_remote_remove() {
        let mut store = Store::default();
        store.apply_remote(batch("k", set(None, 1, "x")), PeerRole::Acceptor);

        let (response, changes) =
            store.apply_remote(batch("k", Modification::Remove { old_revision: 1 }), PeerRole::Acceptor);
        assert_eq!(response.outcomes["k"], ModificationOutcome::Applied);
        assert_eq!(changes[0].new, None);
        assert_eq!(store.value("k"), None);

        // A stale remove of an older revision is refused
        store.commit_local(vec![("k".into(), StagedOp::Set(text("y")))]);
        let (response, _) =
            store.apply_remote(batch("k", Modification::Remove { old_revision: 1 }), PeerRole::Acceptor);
        assert!(matches!(response.outcomes["k"], ModificationOutcome::Rejected { .. }));
        assert_eq!(store.value("k"), Some(&text("y")));
    }
}
