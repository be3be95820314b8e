//! Sync status exposed to the UI layer.
//!
//! The status moves `idle → syncing → {synced | error}`. It is written by
//! the sync engine of a leader, by a non-leader instance mirroring the
//! `synced` result of a sibling leader's cycle, and by `resume` resetting it
//! to idle. Everything else holds a read-only [`StatusReader`] or an event
//! subscription.

use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Entities the remote refused that are still queued (soft warning)
    #[serde(default)]
    pub failed_items: usize,
}

impl SyncStatus {
    /// Short human-readable line, e.g. for a status bar.
    pub fn summary(&self) -> String {
        let mut line = match (&self.state, &self.last_error) {
            (SyncState::Error, Some(err)) => format!("sync error: {}", err),
            (state, _) => state.to_string(),
        };
        if self.failed_items > 0 {
            line.push_str(&format!(" ({} items failed to sync)", self.failed_items));
        }
        line
    }
}

/// Events consumed by the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStatusChanged(SyncStatus),
    RemoteChangesApplied { entity_ids: Vec<EntityId> },
}

/// Owner side of the status: held by the sync engine.
pub struct StatusModel {
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl StatusModel {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { status, events }
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn reader(&self) -> StatusReader {
        StatusReader {
            status: self.status.subscribe(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn set_syncing(&self) {
        self.update(|s| s.state = SyncState::Syncing);
    }

    pub(crate) fn set_synced(&self, at: DateTime<Utc>, failed_items: usize) {
        self.update(|s| {
            s.state = SyncState::Synced;
            s.last_synced_at = Some(at);
            s.last_error = None;
            s.failed_items = failed_items;
        });
    }

    pub(crate) fn set_error(&self, error: String, failed_items: usize) {
        self.update(|s| {
            s.state = SyncState::Error;
            s.last_error = Some(error);
            s.failed_items = failed_items;
        });
    }

    /// Back to idle without surfacing anything (transient failures, resume).
    pub(crate) fn set_idle(&self) {
        self.update(|s| s.state = SyncState::Idle);
    }

    pub(crate) fn remote_changes_applied(&self, entity_ids: Vec<EntityId>) {
        if entity_ids.is_empty() {
            return;
        }
        // No subscribers is fine
        let _ = self
            .events
            .send(SyncEvent::RemoteChangesApplied { entity_ids });
    }

    fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let mut next = self.current();
        f(&mut next);
        if next != *self.status.borrow() {
            self.status.send_replace(next.clone());
            let _ = self.events.send(SyncEvent::SyncStatusChanged(next));
        }
    }
}

impl Default for StatusModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the sync status.
#[derive(Clone)]
pub struct StatusReader {
    status: watch::Receiver<SyncStatus>,
}

impl StatusReader {
    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Wait for the next status change.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        self.status.changed().await.ok()?;
        Some(self.status.borrow_and_update().clone())
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl Fn(&SyncStatus) -> bool) -> Option<SyncStatus> {
        loop {
            {
                let current = self.status.borrow_and_update();
                if predicate(&current) {
                    return Some(current.clone());
                }
            }
            self.status.changed().await.ok()?;
        }
    }
}
