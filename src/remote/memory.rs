//! In-process remote replica.
//!
//! Behaves like a simple document server with a change log: pushes are
//! accepted when they supersede the server copy or repeat it exactly, pulls
//! page through the log. Faults, per-call delays and per-entity rejections
//! can be scripted, and every call is recorded so callers can check what
//! the coordinator asked for and in which order.

use super::{PullBatch, PushAck, Rejection, RemoteError, RemoteStore};
use crate::entity::{Checkpoint, EntityId, EntityRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Pull,
    Push,
}

/// A call the remote received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Pull { since: Checkpoint },
    Push { ids: Vec<EntityId> },
}

#[derive(Default)]
struct ServerState {
    docs: HashMap<EntityId, EntityRecord>,
    /// seq → id of the write made at that seq (only the latest per id)
    log: BTreeMap<u64, EntityId>,
    doc_seq: HashMap<EntityId, u64>,
    last_seq: u64,
    rejections: HashMap<EntityId, String>,
    faults: HashMap<RemoteOp, VecDeque<RemoteError>>,
    delays: HashMap<RemoteOp, Duration>,
    calls: Vec<RemoteCall>,
}

impl ServerState {
    fn store(&mut self, record: EntityRecord) {
        self.last_seq += 1;
        if let Some(previous) = self.doc_seq.insert(record.id.clone(), self.last_seq) {
            self.log.remove(&previous);
        }
        self.log.insert(self.last_seq, record.id.clone());
        self.docs.insert(record.id.clone(), record);
    }

    fn next_fault(&mut self, op: RemoteOp) -> Option<RemoteError> {
        self.faults.get_mut(&op).and_then(|q| q.pop_front())
    }
}

pub struct MemoryRemote {
    state: Mutex<ServerState>,
    page_size: usize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Simulate an edit made by another device directly on the server.
    pub async fn insert(&self, record: EntityRecord) {
        self.state.lock().await.store(record);
    }

    pub async fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        self.state.lock().await.docs.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current end of the change log.
    pub async fn head(&self) -> Checkpoint {
        Checkpoint(self.state.lock().await.last_seq)
    }

    /// Refuse every push of `id` with `reason` until [`MemoryRemote::accept`].
    pub async fn reject(&self, id: impl Into<EntityId>, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejections
            .insert(id.into(), reason.into());
    }

    pub async fn accept(&self, id: &EntityId) {
        self.state.lock().await.rejections.remove(id);
    }

    /// Make the next call of `op` fail with `error`. Faults queue up.
    pub async fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Delay every call of `op` (zero clears it).
    pub async fn set_delay(&self, op: RemoteOp, delay: Duration) {
        let mut state = self.state.lock().await;
        if delay.is_zero() {
            state.delays.remove(&op);
        } else {
            state.delays.insert(op, delay);
        }
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of push calls received.
    pub async fn push_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::Push { .. }))
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    async fn delay_for(&self, op: RemoteOp) {
        let delay = self.state.lock().await.delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn pull(&self, since: Checkpoint) -> Result<PullBatch, RemoteError> {
        {
            let mut state = self.state.lock().await;
            state.calls.push(RemoteCall::Pull { since });
            if let Some(err) = state.next_fault(RemoteOp::Pull) {
                return Err(err);
            }
        }
        self.delay_for(RemoteOp::Pull).await;

        let state = self.state.lock().await;
        let mut batch = PullBatch {
            checkpoint: since,
            ..Default::default()
        };
        let mut entries = state.log.range(since.0.saturating_add(1)..);
        for (seq, id) in entries.by_ref().take(self.page_size) {
            if let Some(record) = state.docs.get(id) {
                batch.changes.push(record.clone());
            }
            batch.checkpoint = Checkpoint(*seq);
        }
        batch.has_more = entries.next().is_some();
        Ok(batch)
    }

    async fn push(&self, records: Vec<EntityRecord>) -> Result<PushAck, RemoteError> {
        {
            let mut state = self.state.lock().await;
            state.calls.push(RemoteCall::Push {
                ids: records.iter().map(|r| r.id.clone()).collect(),
            });
            if let Some(err) = state.next_fault(RemoteOp::Push) {
                return Err(err);
            }
        }
        self.delay_for(RemoteOp::Push).await;

        let mut state = self.state.lock().await;
        let mut ack = PushAck::default();
        for record in records {
            if let Some(reason) = state.rejections.get(&record.id) {
                ack.rejected.push(Rejection {
                    id: record.id.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            let current = state.docs.get(&record.id);
            if record.supersedes(current) {
                ack.accepted.push(record.id.clone());
                state.store(record);
                continue;
            }
            match current {
                // Idempotent re-delivery
                Some(current) if *current == record => ack.accepted.push(record.id),
                Some(current) if current.revision == record.revision => {
                    ack.rejected.push(Rejection {
                        id: record.id.clone(),
                        reason: format!("conflicting copy of {}", record.revision),
                    });
                }
                Some(current) => {
                    let reason = format!(
                        "stale revision {} (server has {})",
                        record.revision, current.revision
                    );
                    ack.rejected.push(Rejection {
                        id: record.id.clone(),
                        reason,
                    });
                }
                None => {}
            }
        }
        Ok(ack)
    }
}
