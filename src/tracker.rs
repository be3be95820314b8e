//! Change Tracker: the in-memory change-set of one local instance.
//!
//! The change-set maps each dirty entity id to its latest local record.
//! Later edits collapse earlier ones, so a burst of keystrokes on one task
//! produces a single entry. Draining hands the set to a push; entities the
//! remote did not acknowledge must be re-inserted, because draining is not
//! the same as "successfully synced".
//!
//! The durable counterpart of the set is the store's pending markers, which
//! every instance of the scope shares. [`ChangeTracker::absorb_pending`] and
//! [`ChangeTracker::retain_pending`] keep the two in step.

use crate::entity::{EntityId, EntityRecord, Revision};
use crate::store::{LocalStore, StoreError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct TrackedEntry {
    order: u64,
    record: EntityRecord,
}

#[derive(Debug, Default)]
struct TrackerState {
    entries: HashMap<EntityId, TrackedEntry>,
    next_order: u64,
    /// Entities the remote refused, with its reason (errored-dirty)
    rejected: HashMap<EntityId, String>,
}

impl TrackerState {
    /// Insert `record` unless a newer revision of it is already tracked.
    fn upsert(&mut self, record: EntityRecord) -> bool {
        if let Some(existing) = self.entries.get(&record.id) {
            if existing.record.revision > record.revision {
                return false;
            }
        }
        self.next_order += 1;
        let order = self.next_order;
        self.entries
            .insert(record.id.clone(), TrackedEntry { order, record });
        true
    }
}

/// Ordered, deduplicated set of dirty entities taken by one push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    records: Vec<EntityRecord>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.iter()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    pub fn into_records(self) -> Vec<EntityRecord> {
        self.records
    }
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit, replacing any earlier entry for the same id.
    pub async fn mark_dirty(&self, record: EntityRecord) {
        let mut state = self.state.lock().await;
        let id = record.id.clone();
        let revision = record.revision;
        if state.upsert(record) {
            // A new revision deserves a fresh attempt
            state.rejected.remove(&id);
            debug!("[tracker] marked {} dirty at {}", id, revision);
        }
    }

    /// Atomically take the current change-set, leaving the tracker empty.
    pub async fn drain(&self) -> ChangeSet {
        let mut state = self.state.lock().await;
        let mut entries: Vec<TrackedEntry> = state.entries.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.order);
        ChangeSet {
            records: entries.into_iter().map(|e| e.record).collect(),
        }
    }

    /// Put back entities a push did not get acknowledged.
    ///
    /// An entry that was re-edited while the push was in flight is newer and
    /// is left untouched.
    pub async fn reinsert(&self, records: impl IntoIterator<Item = EntityRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.upsert(record);
        }
    }

    /// Drop the entry for `id` if `revision` (typically pulled from the
    /// remote) is at least as new. Returns whether an entry was removed.
    pub async fn discard_superseded(&self, id: &EntityId, revision: Revision) -> bool {
        let mut state = self.state.lock().await;
        let superseded = state
            .entries
            .get(id)
            .map(|e| e.record.revision <= revision)
            .unwrap_or(false);
        if superseded {
            state.entries.remove(id);
            state.rejected.remove(id);
            debug!("[tracker] {} superseded by remote {}", id, revision);
        }
        superseded
    }

    /// Load every durable pending marker of the storage scope.
    ///
    /// This is how a leader picks up edits made by sibling instances and
    /// edits a crashed leader never got acknowledged. Returns how many
    /// entries were added or refreshed.
    pub async fn absorb_pending(&self, store: &LocalStore) -> Result<usize, StoreError> {
        let mut loaded = Vec::new();
        for entry in store.pending()? {
            if let Some(record) = store.get(&entry.id)? {
                if record.revision == entry.revision {
                    loaded.push((record, entry.rejected));
                }
            }
        }

        let mut state = self.state.lock().await;
        let mut changed = 0;
        for (record, rejected) in loaded {
            let tracked = state
                .entries
                .get(&record.id)
                .map(|e| e.record.revision >= record.revision)
                .unwrap_or(false);
            if let Some(reason) = rejected {
                state.rejected.insert(record.id.clone(), reason);
            }
            if !tracked && state.upsert(record) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Drop entries the store no longer marks pending (another instance
    /// pushed them, or a pull superseded them). Returns how many were dropped.
    pub async fn retain_pending(&self, store: &LocalStore) -> Result<usize, StoreError> {
        let ids: Vec<EntityId> = {
            let state = self.state.lock().await;
            state.entries.keys().cloned().collect()
        };
        let mut settled = Vec::new();
        for id in ids {
            if store.pending_entry(&id)?.is_none() {
                settled.push(id);
            }
        }

        let mut state = self.state.lock().await;
        for id in &settled {
            state.entries.remove(id);
            state.rejected.remove(id);
        }
        Ok(settled.len())
    }

    pub async fn mark_rejected(&self, id: &EntityId, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejected
            .insert(id.clone(), reason.into());
    }

    pub async fn clear_rejected(&self, id: &EntityId) {
        self.state.lock().await.rejected.remove(id);
    }

    /// Entities currently failing to sync, with the remote's reason.
    pub async fn rejected(&self) -> Vec<(EntityId, String)> {
        let state = self.state.lock().await;
        let mut rejected: Vec<_> = state
            .rejected
            .iter()
            .map(|(id, reason)| (id.clone(), reason.clone()))
            .collect();
        rejected.sort();
        rejected
    }

    pub async fn rejected_count(&self) -> usize {
        self.state.lock().await.rejected.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn contains(&self, id: &EntityId) -> bool {
        self.state.lock().await.entries.contains_key(id)
    }
}
