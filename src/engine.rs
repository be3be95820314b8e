//! Sync Engine: executes one pull → merge → push cycle.
//!
//! Pulling always comes first, so remote edits made by other devices are
//! merged before the engine decides what to push. Pushing a stale local
//! copy first would overwrite those edits on the remote and the next pull
//! would then "revert" them locally.
//!
//! Every failure is caught here and turned into a status update plus a
//! [`CycleOutcome`]; the Local Store and the Change Tracker stay valid
//! whatever the remote does.

use crate::broadcast::{Broadcaster, InstanceMessage};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::entity::{Checkpoint, EntityId, EntityRecord};
use crate::error::{FailureClass, SyncError};
use crate::leader::InstanceId;
use crate::remote::{PushAck, Rejection, RemoteError, RemoteStore};
use crate::status::StatusModel;
use crate::store::{LocalStore, StoreError};
use crate::tracker::ChangeTracker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleKind {
    /// Pull, then push pending local changes
    #[default]
    Full,
    /// Background refresh: pull only
    PullOnly,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Checkpoint stored when the cycle started
    pub checkpoint_before: Checkpoint,
    /// Checkpoint stored after the pull phase; `None` if the pull failed
    pub checkpoint_after_pull: Option<Checkpoint>,
    /// Entities replaced by remote records
    pub applied: Vec<EntityId>,
    /// Entities sent to the remote, in push order
    pub pushed: Vec<EntityId>,
    pub accepted: Vec<EntityId>,
    pub rejected: Vec<Rejection>,
    /// Entities put back into the change-set without a verdict
    pub requeued: Vec<EntityId>,
}

impl CycleReport {
    pub fn made_progress(&self) -> bool {
        !self.applied.is_empty() || !self.accepted.is_empty()
    }
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub report: CycleReport,
    pub error: Option<SyncError>,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        self.error.as_ref().map(|e| e.class())
    }
}

pub struct SyncEngine {
    instance: InstanceId,
    store: Arc<LocalStore>,
    tracker: Arc<ChangeTracker>,
    remote: Arc<dyn RemoteStore>,
    status: Arc<StatusModel>,
    broadcaster: Option<Broadcaster>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        instance: InstanceId,
        store: Arc<LocalStore>,
        tracker: Arc<ChangeTracker>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            instance,
            store,
            tracker,
            remote,
            status: Arc::new(StatusModel::new()),
            broadcaster: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_status(mut self, status: Arc<StatusModel>) -> Self {
        self.status = status;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn status(&self) -> &Arc<StatusModel> {
        &self.status
    }

    /// Run one cycle. Never fails: errors are reported in the outcome and in
    /// the sync status.
    pub async fn run_cycle(&self, kind: CycleKind) -> CycleOutcome {
        let mut report = CycleReport {
            kind,
            ..Default::default()
        };
        self.status.set_syncing();

        let result = self.execute(kind, &mut report).await;
        let failed_items = self.tracker.rejected_count().await;

        match &result {
            Ok(()) => {
                info!(
                    "[engine] {:?} cycle done: {} applied, {} accepted, {} rejected",
                    kind,
                    report.applied.len(),
                    report.accepted.len(),
                    report.rejected.len()
                );
                self.status.set_synced(self.clock.now(), failed_items);
            }
            Err(e) => match e.class() {
                FailureClass::Transient => {
                    warn!("[engine] cycle failed transiently, will retry: {}", e);
                    self.status.set_idle();
                }
                class => {
                    error!("[engine] cycle failed ({:?}): {}", class, e);
                    self.status.set_error(e.to_string(), failed_items);
                }
            },
        }

        if result.is_ok() || report.made_progress() {
            self.announce(&report);
        }

        CycleOutcome {
            report,
            error: result.err(),
        }
    }

    async fn execute(&self, kind: CycleKind, report: &mut CycleReport) -> Result<(), SyncError> {
        report.checkpoint_before = self.store.checkpoint()?;

        let checkpoint = self.pull_phase(report).await?;
        report.checkpoint_after_pull = Some(checkpoint);

        if kind == CycleKind::Full {
            self.push_phase(report).await?;
        }
        Ok(())
    }

    /// Fetch every page under one timeout, then apply them together with the
    /// final checkpoint in one store transaction. A timeout leaves the store
    /// exactly as it was.
    async fn pull_phase(&self, report: &mut CycleReport) -> Result<Checkpoint, SyncError> {
        let since = report.checkpoint_before;
        let limit = self.config.pull_timeout();
        let (changes, checkpoint) = timeout(limit, self.fetch_changes(since))
            .await
            .map_err(|_| SyncError::PullTimeout(limit))??;

        let applied = self.store.apply_remote(&changes, checkpoint)?;
        for (id, revision) in &applied.applied {
            self.tracker.discard_superseded(id, *revision).await;
        }
        debug!(
            "[engine] pulled {} changes since {} ({} applied, {} stale), checkpoint {}",
            changes.len(),
            since,
            applied.applied.len(),
            applied.stale,
            applied.checkpoint
        );

        report.applied = applied.applied.into_iter().map(|(id, _)| id).collect();
        self.status.remote_changes_applied(report.applied.clone());
        Ok(applied.checkpoint)
    }

    async fn fetch_changes(
        &self,
        since: Checkpoint,
    ) -> Result<(Vec<EntityRecord>, Checkpoint), RemoteError> {
        let mut cursor = since;
        let mut changes = Vec::new();
        for _ in 0..self.config.max_pull_pages {
            let batch = self.remote.pull(cursor).await?;
            changes.extend(batch.changes);
            let advanced = batch.checkpoint > cursor;
            if advanced {
                cursor = batch.checkpoint;
            }
            if !batch.has_more {
                break;
            }
            if !advanced {
                warn!("[engine] remote reported more changes without advancing the checkpoint");
                break;
            }
        }
        Ok((changes, cursor))
    }

    async fn push_phase(&self, report: &mut CycleReport) -> Result<(), SyncError> {
        // Edits from sibling instances and from a crashed leader live only
        // in the store's pending markers until absorbed here.
        self.tracker.absorb_pending(&self.store).await?;
        let drained = self.tracker.drain().await.into_records();
        if drained.is_empty() {
            return Ok(());
        }

        let outgoing = match self.current_versions(&drained) {
            Ok(records) => records,
            Err(e) => {
                self.tracker.reinsert(drained).await;
                return Err(e.into());
            }
        };

        let limit = self.config.push_timeout();
        let mut chunks = outgoing
            .chunks(self.config.push_batch_size)
            .map(|c| c.to_vec())
            .collect::<Vec<_>>()
            .into_iter();

        while let Some(chunk) = chunks.next() {
            report.pushed.extend(chunk.iter().map(|r| r.id.clone()));

            let result = match timeout(limit, self.remote.push(chunk.clone())).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(e)) => Err(SyncError::Remote(e)),
                Err(_) => Err(SyncError::PushTimeout(limit)),
            };

            let failure = match result {
                Ok(ack) => match self.settle(chunk, ack, report).await {
                    Ok(()) => continue,
                    Err(e) => (Vec::new(), e.into()),
                },
                Err(e) => (chunk, e),
            };

            // Nothing after the failure point was delivered
            let (mut unsent, err) = failure;
            unsent.extend(chunks.by_ref().flatten());
            report.requeued.extend(unsent.iter().map(|r| r.id.clone()));
            self.tracker.reinsert(unsent).await;
            return Err(err);
        }
        Ok(())
    }

    /// The records to push: the store's current copy of each drained entity
    /// that is still pending. Entities a pull or another leader settled in
    /// the meantime are dropped.
    fn current_versions(&self, drained: &[EntityRecord]) -> Result<Vec<EntityRecord>, StoreError> {
        let mut outgoing = Vec::with_capacity(drained.len());
        for record in drained {
            let Some(entry) = self.store.pending_entry(&record.id)? else {
                continue;
            };
            match self.store.get(&record.id)? {
                Some(current) if current.revision == entry.revision => outgoing.push(current),
                _ => {}
            }
        }
        Ok(outgoing)
    }

    /// Apply a push acknowledgement. Accepted entities leave the durable
    /// pending set; rejected and unacknowledged ones go back to the tracker.
    async fn settle(
        &self,
        chunk: Vec<EntityRecord>,
        ack: PushAck,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let accepted: HashSet<EntityId> = ack.accepted.into_iter().collect();
        let rejected: HashMap<EntityId, String> = ack
            .rejected
            .into_iter()
            .map(|r| (r.id, r.reason))
            .collect();

        let mut requeue = Vec::new();
        let mut records = chunk.into_iter();
        while let Some(record) = records.next() {
            let step = if accepted.contains(&record.id) {
                self.store
                    .clear_pending(&record.id, record.revision)
                    .map(|_| None)
            } else if let Some(reason) = rejected.get(&record.id) {
                self.store
                    .mark_rejected(&record.id, record.revision, reason)
                    .map(|_| Some(reason.clone()))
            } else {
                warn!("[engine] remote did not acknowledge {}, requeueing", record.id);
                report.requeued.push(record.id.clone());
                requeue.push(record);
                continue;
            };

            match step {
                Ok(None) => {
                    self.tracker.clear_rejected(&record.id).await;
                    report.accepted.push(record.id);
                }
                Ok(Some(reason)) => {
                    warn!("[engine] remote rejected {}: {}", record.id, reason);
                    self.tracker.mark_rejected(&record.id, reason.clone()).await;
                    report.rejected.push(Rejection {
                        id: record.id.clone(),
                        reason,
                    });
                    requeue.push(record);
                }
                Err(e) => {
                    requeue.push(record);
                    requeue.extend(records.by_ref());
                    report.requeued.extend(requeue.iter().map(|r| r.id.clone()));
                    self.tracker.reinsert(requeue).await;
                    return Err(e);
                }
            }
        }

        self.tracker.reinsert(requeue).await;
        Ok(())
    }

    fn announce(&self, report: &CycleReport) {
        let Some(broadcaster) = &self.broadcaster else {
            return;
        };
        let mut entity_ids = report.applied.clone();
        entity_ids.extend(report.accepted.iter().cloned());
        broadcaster.publish(
            &self.instance,
            InstanceMessage::SyncCompleted {
                checkpoint: report
                    .checkpoint_after_pull
                    .unwrap_or(report.checkpoint_before),
                entity_ids,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Revision;
    use crate::remote::{MemoryRemote, RemoteCall, RemoteOp};
    use crate::status::SyncState;
    use crate::store::WriteOrigin;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<LocalStore>,
        tracker: Arc<ChangeTracker>,
        remote: Arc<MemoryRemote>,
        engine: SyncEngine,
    }

    fn harness(config: SyncConfig) -> Harness {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let tracker = Arc::new(ChangeTracker::new());
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(
            InstanceId::new("leader"),
            store.clone(),
            tracker.clone(),
            remote.clone(),
            config,
        );
        Harness {
            store,
            tracker,
            remote,
            engine,
        }
    }

    fn record(id: &str, revision: u64) -> EntityRecord {
        EntityRecord::new(id, Revision(revision), json!({ "title": id }))
    }

    async fn local_edit(h: &Harness, record: EntityRecord) {
        h.store.put(&record, WriteOrigin::Local).unwrap();
        h.tracker.mark_dirty(record).await;
    }

    #[tokio::test]
    async fn test_cycle_pulls_before_pushing() {
        let h = harness(SyncConfig::default());
        h.remote.insert(record("remote-1", 3)).await;
        local_edit(&h, record("local-1", 1)).await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert!(outcome.is_success());
        assert_eq!(
            h.remote.calls().await,
            vec![
                RemoteCall::Pull {
                    since: Checkpoint::START
                },
                RemoteCall::Push {
                    ids: vec![EntityId::from("local-1")]
                },
            ]
        );
        assert_eq!(outcome.report.checkpoint_after_pull, Some(Checkpoint(1)));
        assert_eq!(outcome.report.applied, vec![EntityId::from("remote-1")]);
        assert!(h.store.pending().unwrap().is_empty());
        assert_eq!(h.engine.status().current().state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_pull_only_cycle_never_pushes() {
        let h = harness(SyncConfig::default());
        local_edit(&h, record("local-1", 1)).await;

        let outcome = h.engine.run_cycle(CycleKind::PullOnly).await;
        assert!(outcome.is_success());
        assert_eq!(h.remote.push_count().await, 0);
        assert!(h.tracker.contains(&EntityId::from("local-1")).await);
    }

    #[tokio::test]
    async fn test_failed_pull_skips_push() {
        let h = harness(SyncConfig::default());
        local_edit(&h, record("local-1", 1)).await;
        h.remote
            .fail_next(
                RemoteOp::Pull,
                RemoteError::Unavailable {
                    status: Some(502),
                    message: "bad gateway".into(),
                },
            )
            .await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert_eq!(outcome.failure_class(), Some(FailureClass::Transient));
        assert_eq!(h.remote.push_count().await, 0);
        assert!(h.tracker.contains(&EntityId::from("local-1")).await);
        // Transient failures stay invisible
        assert_eq!(h.engine.status().current().state, SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_timeout_leaves_checkpoint_untouched() {
        let config = SyncConfig {
            pull_timeout_ms: 100,
            ..Default::default()
        };
        let h = harness(config);
        h.remote.insert(record("remote-1", 1)).await;
        h.remote.set_delay(RemoteOp::Pull, Duration::from_secs(5)).await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert!(matches!(outcome.error, Some(SyncError::PullTimeout(_))));
        assert_eq!(outcome.report.checkpoint_after_pull, None);
        assert_eq!(h.store.checkpoint().unwrap(), Checkpoint::START);
        assert!(h.store.get(&EntityId::from("remote-1")).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_requeues_everything() {
        let config = SyncConfig {
            push_timeout_ms: 100,
            ..Default::default()
        };
        let h = harness(config);
        local_edit(&h, record("a", 1)).await;
        local_edit(&h, record("b", 1)).await;
        h.remote.set_delay(RemoteOp::Push, Duration::from_secs(5)).await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert!(matches!(outcome.error, Some(SyncError::PushTimeout(_))));
        assert_eq!(outcome.report.requeued.len(), 2);
        assert_eq!(h.tracker.len().await, 2);
        assert_eq!(h.store.pending().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_sets_error_status() {
        let h = harness(SyncConfig::default());
        h.remote
            .fail_next(RemoteOp::Pull, RemoteError::Unauthorized("token revoked".into()))
            .await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert_eq!(outcome.failure_class(), Some(FailureClass::Fatal));
        let status = h.engine.status().current();
        assert_eq!(status.state, SyncState::Error);
        assert!(status.last_error.unwrap().contains("token revoked"));
    }

    #[tokio::test]
    async fn test_pull_follows_pages() {
        let h = harness(SyncConfig::default());
        let remote = Arc::new(MemoryRemote::with_page_size(2));
        for i in 0..5 {
            remote.insert(record(&format!("r{}", i), 1)).await;
        }
        let engine = SyncEngine::new(
            InstanceId::new("leader"),
            h.store.clone(),
            h.tracker.clone(),
            remote.clone(),
            SyncConfig::default(),
        );

        let outcome = engine.run_cycle(CycleKind::PullOnly).await;
        assert_eq!(outcome.report.applied.len(), 5);
        assert_eq!(h.store.checkpoint().unwrap(), Checkpoint(5));
        assert_eq!(remote.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_push_is_split_into_batches() {
        let config = SyncConfig {
            push_batch_size: 2,
            ..Default::default()
        };
        let h = harness(config);
        for id in ["a", "b", "c", "d", "e"] {
            local_edit(&h, record(id, 1)).await;
        }

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert!(outcome.is_success());
        assert_eq!(h.remote.push_count().await, 3);
        assert_eq!(outcome.report.accepted.len(), 5);
        assert_eq!(h.remote.len().await, 5);
    }

    #[tokio::test]
    async fn test_failed_batch_requeues_remaining_batches() {
        let config = SyncConfig {
            push_batch_size: 1,
            ..Default::default()
        };
        let h = harness(config);
        for id in ["a", "b", "c"] {
            local_edit(&h, record(id, 1)).await;
        }
        h.remote
            .fail_next(RemoteOp::Push, RemoteError::PayloadTooLarge)
            .await;

        let outcome = h.engine.run_cycle(CycleKind::Full).await;
        assert_eq!(outcome.failure_class(), Some(FailureClass::Unrecoverable));
        assert_eq!(h.remote.push_count().await, 1);
        assert_eq!(outcome.report.accepted, Vec::<EntityId>::new());
        assert_eq!(outcome.report.requeued.len(), 3);
        assert_eq!(h.tracker.len().await, 3);
    }

    #[tokio::test]
    async fn test_sync_completed_is_broadcast() {
        let hub = Broadcaster::new();
        let mut sibling = hub.subscribe(&InstanceId::new("sibling"));
        let h = harness(SyncConfig::default());
        let engine = SyncEngine::new(
            InstanceId::new("leader"),
            h.store.clone(),
            h.tracker.clone(),
            h.remote.clone(),
            SyncConfig::default(),
        )
        .with_broadcaster(hub.clone());
        h.remote.insert(record("remote-1", 2)).await;

        engine.run_cycle(CycleKind::Full).await;
        match sibling.recv().await {
            Some(crate::broadcast::Notification::Message { origin, message }) => {
                assert_eq!(origin, InstanceId::new("leader"));
                assert_eq!(
                    message,
                    InstanceMessage::SyncCompleted {
                        checkpoint: Checkpoint(1),
                        entity_ids: vec![EntityId::from("remote-1")],
                    }
                );
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }
}
