//! Local Store: the authoritative, durable snapshot of every entity.
//!
//! All local instances of one storage scope share a single [`LocalStore`]
//! handle. Besides entity records it owns the sync checkpoint, the durable
//! pending markers that back the change-set, and the leader token record.

mod error;
mod local;

pub use error::StoreError;
pub use local::LocalStore;

use crate::entity::{Checkpoint, EntityId, EntityRecord, Revision};
use crate::leader::LeaderToken;
use serde::{Deserialize, Serialize};

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A user edit made by one of the local instances
    Local,
    /// A record received from the remote during a pull
    Remote,
}

/// Result of a single [`LocalStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was written and received store sequence `seq`
    Applied { seq: u64 },
    /// The store already holds this revision or a newer one; nothing changed
    Stale { current: Revision },
}

impl PutOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PutOutcome::Applied { .. })
    }
}

/// An entity record together with the store sequence of its last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub seq: u64,
    pub record: EntityRecord,
}

/// Durable marker for a local write that the remote has not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: EntityId,
    pub revision: Revision,
    /// Store sequence of the write, used to keep pushes in edit order
    pub seq: u64,
    /// Reason given by the remote the last time it refused this revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// What a pull batch did to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Records that replaced (or created) local state
    pub applied: Vec<(EntityId, Revision)>,
    /// Pending local writes discarded because the remote had a newer revision
    pub superseded_pending: Vec<EntityId>,
    /// Records ignored because the local revision was equal or newer
    pub stale: usize,
    /// Checkpoint stored after the batch
    pub checkpoint: Checkpoint,
}

/// Result of a leader token compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Swapped,
    /// The stored token did not match the expectation
    Conflict { actual: Option<LeaderToken> },
}

/// Counts used for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub entities: usize,
    pub pending: usize,
    pub rejected: usize,
    pub checkpoint: Checkpoint,
    pub latest_seq: u64,
}
