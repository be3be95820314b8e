//! redb-backed implementation of the Local Store.
//!
//! Tables:
//! - entities: entity id → StoredRecord (JSON)
//! - sequence: store seq → entity id (index for `list_since`)
//! - pending: entity id → PendingEntry (JSON), the durable change-set
//! - meta: name → u64 (checkpoint, last store seq)
//! - leader: storage scope → LeaderToken (JSON)

use super::{
    ApplyReport, CasResult, PendingEntry, PutOutcome, StoreError, StoreSummary, StoredRecord,
    WriteOrigin,
};
use crate::entity::{Checkpoint, EntityId, EntityRecord, Revision};
use crate::leader::LeaderToken;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, Table, TableDefinition};
use std::path::Path;
use tracing::debug;

const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const SEQUENCE: TableDefinition<u64, &str> = TableDefinition::new("sequence");
const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const LEADER: TableDefinition<&str, &[u8]> = TableDefinition::new("leader");

const META_CHECKPOINT: &str = "checkpoint";
const META_LAST_SEQ: &str = "last_seq";

/// Durable local snapshot shared by every instance of a storage scope.
///
/// The instances of a scope live in the process that opened the store and
/// share this handle.
///
/// Every method runs in its own redb transaction and write transactions are
/// committed with immediate durability before returning, so an acknowledged
/// write survives a process crash. redb serializes write transactions, which
/// makes each read-check-write below atomic.
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    /// Open or create a store at the given path.
    ///
    /// redb locks the file for the lifetime of the handle, so one process
    /// owns a database and its instances share the returned store. A second
    /// open fails with [`StoreError::InUse`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StoreError::InUse {
                path: path.to_path_buf(),
            },
            other => StoreError::Database(other),
        })?;
        Self::init(db)
    }

    /// Create a store that lives only in memory.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        // Ensure tables exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTITIES)?;
            let _ = write_txn.open_table(SEQUENCE)?;
            let _ = write_txn.open_table(PENDING)?;
            let _ = write_txn.open_table(META)?;
            let _ = write_txn.open_table(LEADER)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, id: &EntityId) -> Result<Option<EntityRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;
        match table.get(id.as_str())? {
            Some(v) => Ok(Some(decode::<StoredRecord>(v.value())?.record)),
            None => Ok(None),
        }
    }

    /// Write a record if its revision is newer than the stored one.
    ///
    /// Local writes record a pending marker in the same transaction. Remote
    /// writes drop any pending marker they supersede.
    pub fn put(&self, record: &EntityRecord, origin: WriteOrigin) -> Result<PutOutcome, StoreError> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut entities = write_txn.open_table(ENTITIES)?;
            let mut sequence = write_txn.open_table(SEQUENCE)?;
            let mut pending = write_txn.open_table(PENDING)?;
            let mut meta = write_txn.open_table(META)?;

            let current = read_stored(&entities, &record.id)?;
            if !record.supersedes(current.as_ref().map(|s| &s.record)) {
                let current = current.map(|s| s.record.revision).unwrap_or_default();
                debug!(
                    "Ignoring stale write for {} ({} <= {})",
                    record.id, record.revision, current
                );
                PutOutcome::Stale { current }
            } else {
                let seq = write_record(
                    &mut entities,
                    &mut sequence,
                    &mut meta,
                    record,
                    current.map(|s| s.seq),
                )?;
                match origin {
                    WriteOrigin::Local => {
                        let entry = PendingEntry {
                            id: record.id.clone(),
                            revision: record.revision,
                            seq,
                            rejected: None,
                        };
                        pending.insert(record.id.as_str(), encode(&entry)?.as_slice())?;
                    }
                    WriteOrigin::Remote => {
                        drop_superseded_pending(&mut pending, &record.id, record.revision)?;
                    }
                }
                PutOutcome::Applied { seq }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Apply one pull result and advance the checkpoint in a single transaction.
    pub fn apply_remote(
        &self,
        records: &[EntityRecord],
        checkpoint: Checkpoint,
    ) -> Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();
        let write_txn = self.db.begin_write()?;
        {
            let mut entities = write_txn.open_table(ENTITIES)?;
            let mut sequence = write_txn.open_table(SEQUENCE)?;
            let mut pending = write_txn.open_table(PENDING)?;
            let mut meta = write_txn.open_table(META)?;

            for record in records {
                let current = read_stored(&entities, &record.id)?;
                if !record.supersedes(current.as_ref().map(|s| &s.record)) {
                    report.stale += 1;
                    continue;
                }
                write_record(
                    &mut entities,
                    &mut sequence,
                    &mut meta,
                    record,
                    current.map(|s| s.seq),
                )?;
                if drop_superseded_pending(&mut pending, &record.id, record.revision)? {
                    report.superseded_pending.push(record.id.clone());
                }
                report.applied.push((record.id.clone(), record.revision));
            }

            let stored = meta.get(META_CHECKPOINT)?.map(|v| v.value()).unwrap_or(0);
            let next = stored.max(checkpoint.0);
            meta.insert(META_CHECKPOINT, next)?;
            report.checkpoint = Checkpoint(next);
        }
        write_txn.commit()?;
        Ok(report)
    }

    /// Records written after store sequence `since`, oldest first.
    pub fn list_since(&self, since: u64) -> Result<Vec<StoredRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let sequence = read_txn.open_table(SEQUENCE)?;
        let entities = read_txn.open_table(ENTITIES)?;

        let mut result = Vec::new();
        for entry in sequence.range(since.saturating_add(1)..)? {
            let (_, id) = entry?;
            if let Some(v) = entities.get(id.value())? {
                result.push(decode::<StoredRecord>(v.value())?);
            }
        }
        Ok(result)
    }

    pub fn latest_seq(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        Ok(meta.get(META_LAST_SEQ)?.map(|v| v.value()).unwrap_or(0))
    }

    pub fn checkpoint(&self) -> Result<Checkpoint, StoreError> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        Ok(Checkpoint(
            meta.get(META_CHECKPOINT)?.map(|v| v.value()).unwrap_or(0),
        ))
    }

    /// Store a new checkpoint. Regressions are ignored; returns whether it moved.
    pub fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let moved = {
            let mut meta = write_txn.open_table(META)?;
            let stored = meta.get(META_CHECKPOINT)?.map(|v| v.value()).unwrap_or(0);
            if checkpoint.0 > stored {
                meta.insert(META_CHECKPOINT, checkpoint.0)?;
                true
            } else {
                false
            }
        };
        write_txn.commit()?;
        Ok(moved)
    }

    /// All pending markers in edit order.
    pub fn pending(&self) -> Result<Vec<PendingEntry>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            entries.push(decode::<PendingEntry>(value.value())?);
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    pub fn pending_entry(&self, id: &EntityId) -> Result<Option<PendingEntry>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;
        match table.get(id.as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Remove the pending marker for `id` if it still refers to `revision`.
    ///
    /// A marker for a newer revision means the entity was edited again while
    /// the push was in flight, so it stays queued.
    pub fn clear_pending(&self, id: &EntityId, revision: Revision) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let cleared = {
            let mut table = write_txn.open_table(PENDING)?;
            match read_pending(&table, id)? {
                Some(entry) if entry.revision == revision => {
                    table.remove(id.as_str())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(cleared)
    }

    /// Record that the remote refused `revision` of `id`. The marker stays.
    pub fn mark_rejected(
        &self,
        id: &EntityId,
        revision: Revision,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let marked = {
            let mut table = write_txn.open_table(PENDING)?;
            match read_pending(&table, id)? {
                Some(mut entry) if entry.revision == revision => {
                    entry.rejected = Some(reason.to_string());
                    table.insert(id.as_str(), encode(&entry)?.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(marked)
    }

    pub fn leader_token(&self, scope: &str) -> Result<Option<LeaderToken>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEADER)?;
        match table.get(scope)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Atomically replace the leader token of `scope` if it equals `expected`.
    ///
    /// `next = None` clears the token.
    pub fn compare_and_set_leader(
        &self,
        scope: &str,
        expected: Option<&LeaderToken>,
        next: Option<&LeaderToken>,
    ) -> Result<CasResult, StoreError> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(LEADER)?;
            let actual: Option<LeaderToken> = match table.get(scope)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };

            if actual.as_ref() != expected {
                CasResult::Conflict { actual }
            } else {
                match next {
                    Some(token) => {
                        table.insert(scope, encode(token)?.as_slice())?;
                    }
                    None => {
                        table.remove(scope)?;
                    }
                }
                CasResult::Swapped
            }
        };
        match result {
            CasResult::Swapped => write_txn.commit()?,
            CasResult::Conflict { .. } => write_txn.abort()?,
        }
        Ok(result)
    }

    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        let read_txn = self.db.begin_read()?;
        let entities = read_txn.open_table(ENTITIES)?;
        let pending = read_txn.open_table(PENDING)?;
        let meta = read_txn.open_table(META)?;

        let mut summary = StoreSummary {
            checkpoint: Checkpoint(meta.get(META_CHECKPOINT)?.map(|v| v.value()).unwrap_or(0)),
            latest_seq: meta.get(META_LAST_SEQ)?.map(|v| v.value()).unwrap_or(0),
            ..Default::default()
        };
        for entry in entities.iter()? {
            entry?;
            summary.entities += 1;
        }
        for entry in pending.iter()? {
            let (_, value) = entry?;
            summary.pending += 1;
            if decode::<PendingEntry>(value.value())?.rejected.is_some() {
                summary.rejected += 1;
            }
        }
        Ok(summary)
    }
}

fn read_stored(
    entities: &Table<&str, &[u8]>,
    id: &EntityId,
) -> Result<Option<StoredRecord>, StoreError> {
    match entities.get(id.as_str())? {
        Some(v) => Ok(Some(decode(v.value())?)),
        None => Ok(None),
    }
}

fn read_pending(
    pending: &Table<&str, &[u8]>,
    id: &EntityId,
) -> Result<Option<PendingEntry>, StoreError> {
    match pending.get(id.as_str())? {
        Some(v) => Ok(Some(decode(v.value())?)),
        None => Ok(None),
    }
}

/// Write `record` under a fresh store sequence and move its sequence index.
fn write_record(
    entities: &mut Table<&str, &[u8]>,
    sequence: &mut Table<u64, &str>,
    meta: &mut Table<&str, u64>,
    record: &EntityRecord,
    previous_seq: Option<u64>,
) -> Result<u64, StoreError> {
    let seq = meta.get(META_LAST_SEQ)?.map(|v| v.value()).unwrap_or(0) + 1;
    meta.insert(META_LAST_SEQ, seq)?;

    if let Some(previous) = previous_seq {
        sequence.remove(previous)?;
    }
    sequence.insert(seq, record.id.as_str())?;

    let stored = StoredRecord {
        seq,
        record: record.clone(),
    };
    entities.insert(record.id.as_str(), encode(&stored)?.as_slice())?;
    Ok(seq)
}

/// Remove the pending marker of `id` when `revision` supersedes it.
fn drop_superseded_pending(
    pending: &mut Table<&str, &[u8]>,
    id: &EntityId,
    revision: Revision,
) -> Result<bool, StoreError> {
    match read_pending(pending, id)? {
        Some(entry) if entry.revision <= revision => {
            pending.remove(id.as_str())?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
