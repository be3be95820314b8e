//! Synchronizable records and the cursors that describe sync progress.
//!
//! Every domain object (task, project, canvas layout blob) is stored and
//! replicated as an [`EntityRecord`]. The coordinator never looks inside the
//! payload; ordering between versions of the same entity is decided by
//! [`Revision`] alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, globally unique identifier of a synchronizable entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-entity version. Higher revisions win.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    /// Allocate the revision for a local edit.
    ///
    /// Hybrid-logical-clock style: strictly greater than `current`, and at
    /// least the wall clock in milliseconds, so edits made on different
    /// devices rarely tie.
    pub fn next_local(current: Option<Revision>, now_millis: i64) -> Revision {
        let floor = current.map(|r| r.0.saturating_add(1)).unwrap_or(1);
        let wall = u64::try_from(now_millis).unwrap_or(0);
        Revision(floor.max(wall))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Cursor marking the last point successfully pulled from the remote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    pub const START: Checkpoint = Checkpoint(0);
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A synchronizable domain object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub revision: Revision,
    /// Opaque serialized content owned by the domain layer
    pub payload: serde_json::Value,
    /// Tombstone marker; deleted entities keep replicating so deletes propagate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EntityRecord {
    pub fn new(id: impl Into<EntityId>, revision: Revision, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            revision,
            payload,
            deleted_at: None,
        }
    }

    /// Build the tombstone that replaces this record.
    pub fn tombstone(&self, revision: Revision, at: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            revision,
            payload: serde_json::Value::Null,
            deleted_at: Some(at),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether this record should replace `current` under last-write-wins.
    ///
    /// Two different copies with the same revision (devices that allocated
    /// it in the same millisecond) are ordered by [`EntityRecord::tiebreak_key`],
    /// so every replica keeps the same one. An identical copy never
    /// supersedes.
    pub fn supersedes(&self, current: Option<&EntityRecord>) -> bool {
        match current {
            Some(existing) if self.revision == existing.revision => {
                self.tiebreak_key() > existing.tiebreak_key()
            }
            Some(existing) => self.revision > existing.revision,
            None => true,
        }
    }

    /// Tombstones win ties, then the greater canonical payload encoding.
    fn tiebreak_key(&self) -> (bool, String) {
        (self.is_deleted(), self.payload.to_string())
    }
}
