//! One local instance (window, tab, embedded view) of the task app.
//!
//! Instances of the same storage scope share a [`SyncScope`]: one Local
//! Store, one broadcaster, one remote. Each instance runs three tasks:
//!
//! - the *lease keeper*, which acquires or renews the leader token;
//! - the *scheduler driver*, which feeds the [`SchedulerCore`] and runs
//!   engine cycles while this instance is leader;
//! - the *sibling listener*, which reacts to other instances' messages.

use crate::broadcast::{Broadcaster, InstanceMessage, Notification};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::engine::{CycleOutcome, SyncEngine};
use crate::entity::{EntityId, EntityRecord, Revision};
use crate::leader::{ElectionError, InstanceId, LeaderElection, Leadership};
use crate::remote::RemoteStore;
use crate::scheduler::SchedulerCore;
use crate::status::{StatusModel, StatusReader, SyncEvent, SyncStatus};
use crate::store::{LocalStore, PutOutcome, StoreError, WriteOrigin};
use crate::tracker::ChangeTracker;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Concurrent local writers are retried this many times.
const MAX_WRITE_ATTEMPTS: usize = 8;

type CycleFuture = Pin<Box<dyn Future<Output = CycleOutcome> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("concurrent writes to {0} kept conflicting")]
    Contended(EntityId),
}

/// Resources shared by every instance of one storage scope.
#[derive(Clone)]
pub struct SyncScope {
    pub store: Arc<LocalStore>,
    pub broadcaster: Broadcaster,
    pub remote: Arc<dyn RemoteStore>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

impl SyncScope {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            store,
            broadcaster: Broadcaster::new(),
            remote,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// The instance's read model: live (non-deleted) entities as of the last
/// refresh from the Local Store.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    entities: BTreeMap<EntityId, EntityRecord>,
    seq: u64,
}

impl Projection {
    pub fn get(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Store sequence the projection has caught up to.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Apply every store write after the last refresh.
    fn refresh(&mut self, store: &LocalStore) -> Result<usize, StoreError> {
        let changed = store.list_since(self.seq)?;
        let count = changed.len();
        for stored in changed {
            self.seq = self.seq.max(stored.seq);
            if stored.record.is_deleted() {
                self.entities.remove(&stored.record.id);
            } else {
                self.entities.insert(stored.record.id.clone(), stored.record);
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Changed,
    Requested,
    Visible(bool),
    Resume,
    SiblingSynced,
    LeadershipGained,
}

struct Inner {
    id: InstanceId,
    config: SyncConfig,
    store: Arc<LocalStore>,
    tracker: Arc<ChangeTracker>,
    status: Arc<StatusModel>,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    election: LeaderElection,
    leadership: watch::Sender<Leadership>,
    projection: RwLock<Projection>,
    signals: mpsc::UnboundedSender<Signal>,
    lease_wake: Notify,
}

impl Inner {
    fn is_leader(&self) -> bool {
        self.leadership.borrow().is_valid_at(self.clock.now())
    }

    fn signal(&self, signal: Signal) {
        // The driver is gone only during shutdown
        let _ = self.signals.send(signal);
    }

    async fn refresh_projection(&self) {
        let mut projection = self.projection.write().await;
        if let Err(e) = projection.refresh(&self.store) {
            warn!("[instance] {} failed to refresh projection: {}", self.id, e);
        }
    }

    /// Write a local edit derived from the current record.
    async fn write_local(
        &self,
        id: &EntityId,
        build: impl Fn(Option<&EntityRecord>, Revision) -> Option<EntityRecord>,
    ) -> Result<EntityRecord, InstanceError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.store.get(id)?;
            let revision =
                Revision::next_local(current.as_ref().map(|r| r.revision), self.clock.now_millis());
            let Some(record) = build(current.as_ref(), revision) else {
                return Err(InstanceError::NotFound(id.clone()));
            };

            match self.store.put(&record, WriteOrigin::Local)? {
                PutOutcome::Applied { .. } => {
                    self.tracker.mark_dirty(record.clone()).await;
                    self.signal(Signal::Changed);
                    self.broadcaster.publish(
                        &self.id,
                        InstanceMessage::DataChanged {
                            entity_ids: vec![record.id.clone()],
                        },
                    );
                    self.refresh_projection().await;
                    return Ok(record);
                }
                PutOutcome::Stale { current } => {
                    debug!("[instance] {} raced to {}, retrying", id, current);
                }
            }
        }
        Err(InstanceError::Contended(id.clone()))
    }
}

/// A running local instance.
pub struct SyncInstance {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncInstance {
    /// Start an instance and its background tasks. Must be called from
    /// within a tokio runtime.
    pub fn start(scope: &SyncScope, id: InstanceId) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (leadership, _) = watch::channel(Leadership::default());
        let (shutdown, _) = watch::channel(false);

        let tracker = Arc::new(ChangeTracker::new());
        let status = Arc::new(StatusModel::new());
        let election = LeaderElection::new(
            scope.store.clone(),
            scope.clock.clone(),
            scope.config.scope.clone(),
            scope.config.lease(),
        );
        let engine = Arc::new(
            SyncEngine::new(
                id.clone(),
                scope.store.clone(),
                tracker.clone(),
                scope.remote.clone(),
                scope.config.clone(),
            )
            .with_status(status.clone())
            .with_broadcaster(scope.broadcaster.clone())
            .with_clock(scope.clock.clone()),
        );

        let mut projection = Projection::default();
        if let Err(e) = projection.refresh(&scope.store) {
            warn!("[instance] {} initial projection failed: {}", id, e);
        }

        let inner = Arc::new(Inner {
            id: id.clone(),
            config: scope.config.clone(),
            store: scope.store.clone(),
            tracker,
            status,
            broadcaster: scope.broadcaster.clone(),
            clock: scope.clock.clone(),
            election,
            leadership,
            projection: RwLock::new(projection),
            signals: signals_tx,
            lease_wake: Notify::new(),
        });

        info!("[instance] starting {} in scope '{}'", id, scope.config.scope);
        let subscription = scope.broadcaster.subscribe(&id);
        let tasks = vec![
            tokio::spawn(lease_keeper(inner.clone(), shutdown.subscribe())),
            tokio::spawn(scheduler_driver(
                inner.clone(),
                engine,
                signals_rx,
                shutdown.subscribe(),
            )),
            tokio::spawn(sibling_listener(
                inner.clone(),
                subscription,
                shutdown.subscribe(),
            )),
        ];

        Self {
            inner,
            shutdown,
            tasks,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.inner.id
    }

    /// Create or replace an entity with a new local revision.
    pub async fn put(
        &self,
        id: impl Into<EntityId>,
        payload: serde_json::Value,
    ) -> Result<EntityRecord, InstanceError> {
        let id = id.into();
        self.inner
            .write_local(&id, |_, revision| {
                Some(EntityRecord::new(id.clone(), revision, payload.clone()))
            })
            .await
    }

    /// Tombstone an entity so the delete replicates like any other edit.
    /// Deleting a missing or already deleted entity is [`InstanceError::NotFound`].
    pub async fn delete(&self, id: impl Into<EntityId>) -> Result<EntityRecord, InstanceError> {
        let id = id.into();
        let now = self.inner.clock.now();
        self.inner
            .write_local(&id, |current, revision| {
                current
                    .filter(|record| !record.is_deleted())
                    .map(|record| record.tombstone(revision, now))
            })
            .await
    }

    /// Current record from the Local Store, tombstones included.
    pub fn get(&self, id: &EntityId) -> Result<Option<EntityRecord>, InstanceError> {
        Ok(self.inner.store.get(id)?)
    }

    /// Ask for a full cycle without waiting for the debounce.
    pub fn request_sync(&self) {
        self.inner.signal(Signal::Requested);
    }

    /// Hidden instances schedule no background pulls.
    pub fn set_visible(&self, visible: bool) {
        self.inner.signal(Signal::Visible(visible));
    }

    /// Restart automatic sync after a fatal failure.
    pub fn resume(&self) {
        self.inner.status.set_idle();
        self.inner.signal(Signal::Resume);
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self) -> StatusReader {
        self.inner.status.reader()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.status.subscribe_events()
    }

    pub async fn projection(&self) -> Projection {
        self.inner.projection.read().await.clone()
    }

    /// Number of entities in this instance's change-set.
    pub async fn pending_changes(&self) -> usize {
        self.inner.tracker.len().await
    }

    /// Entities the remote refused, with its reasons.
    pub async fn rejected(&self) -> Vec<(EntityId, String)> {
        self.inner.tracker.rejected().await
    }

    /// Stop gracefully: let an in-flight cycle finish, release leadership
    /// and tell the siblings.
    pub async fn shutdown(mut self) {
        info!("[instance] shutting down {}", self.inner.id);
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("[instance] task of {} ended abnormally: {}", self.inner.id, e);
            }
        }

        match self.inner.election.release(&self.inner.id) {
            Ok(true) => {
                self.inner.broadcaster.publish(
                    &self.inner.id,
                    InstanceMessage::LeadershipReleased,
                );
            }
            Ok(false) => {}
            Err(e) => warn!("[instance] {} failed to release leadership: {}", self.inner.id, e),
        }
        self.inner.leadership.send_modify(|l| {
            l.revoke();
        });
    }

    /// Stop immediately without releasing anything, as if the process
    /// crashed. The lease is left to expire.
    pub fn abort(mut self) {
        warn!("[instance] aborting {}", self.inner.id);
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
        }
    }
}

impl Drop for SyncInstance {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn lease_keeper(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.lease_poll_interval();
    loop {
        let held = inner.leadership.borrow().token().is_some();
        if held {
            match inner.election.renew(&inner.id) {
                Ok(token) => inner.leadership.send_modify(|l| l.granted(token)),
                Err(ElectionError::LostLeadership { holder }) => {
                    info!(
                        "[instance] {} lost leadership to {}",
                        inner.id,
                        holder.as_deref().unwrap_or("nobody")
                    );
                    inner.leadership.send_modify(|l| {
                        l.revoke();
                    });
                }
                // The granted lease keeps expiring on its own
                Err(e) => warn!("[instance] {} failed to renew lease: {}", inner.id, e),
            }
        } else {
            match inner.election.acquire(&inner.id, inner.config.lease()) {
                Ok(token) => {
                    inner.leadership.send_modify(|l| l.granted(token));
                    inner.signal(Signal::LeadershipGained);
                }
                Err(ElectionError::Held { .. }) => {}
                Err(e) => warn!("[instance] {} failed to acquire lease: {}", inner.id, e),
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.lease_wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn scheduler_driver(
    inner: Arc<Inner>,
    engine: Arc<SyncEngine>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut core = SchedulerCore::new(&inner.config, Instant::now());
    let mut leadership = inner.leadership.subscribe();
    let mut cycle: Option<CycleFuture> = None;

    loop {
        let is_leader = inner.is_leader();
        if cycle.is_none() {
            if let Some(kind) = core.poll(Instant::now(), is_leader) {
                debug!("[scheduler] {} starting {:?} cycle", inner.id, kind);
                let engine = engine.clone();
                cycle = Some(Box::pin(async move { engine.run_cycle(kind).await }));
            }
        }
        let wakeup = if cycle.is_some() {
            None
        } else {
            core.next_wakeup(is_leader)
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            outcome = run_cycle(&mut cycle) => {
                cycle = None;
                core.on_cycle_finished(Instant::now(), outcome.failure_class());
                inner.refresh_projection().await;
            }
            Some(signal) = signals.recv() => {
                apply_signal(&inner, &mut core, signal).await;
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until(wakeup) => {}
        }
    }

    // Never abandon a cycle half way through a graceful stop
    if let Some(cycle) = cycle {
        cycle.await;
        inner.refresh_projection().await;
    }
}

async fn apply_signal(inner: &Inner, core: &mut SchedulerCore, signal: Signal) {
    let now = Instant::now();
    match signal {
        Signal::Changed => core.on_change(now),
        Signal::Requested => core.request(now),
        Signal::Visible(visible) => core.set_visible(visible),
        Signal::Resume => core.resume(now),
        Signal::SiblingSynced => {
            let empty = inner.tracker.is_empty().await;
            core.on_sibling_synced(now, empty);
        }
        Signal::LeadershipGained => core.on_leadership_gained(now),
    }
}

async fn run_cycle(cycle: &mut Option<CycleFuture>) -> CycleOutcome {
    match cycle {
        Some(cycle) => cycle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn sibling_listener(
    inner: Arc<Inner>,
    mut subscription: crate::broadcast::InstanceSubscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.changed() => break,
            notification = subscription.recv() => match notification {
                Some(n) => n,
                None => break,
            },
        };

        match notification {
            Notification::Message { origin, message } => {
                debug!("[instance] {} got {:?} from {}", inner.id, message, origin);
                match message {
                    InstanceMessage::DataChanged { .. } => {
                        inner.refresh_projection().await;
                        if inner.is_leader() {
                            inner.signal(Signal::Changed);
                        }
                    }
                    InstanceMessage::SyncCompleted { .. } => {
                        settle_after_sibling_sync(&inner).await;
                    }
                    InstanceMessage::LeadershipReleased => inner.lease_wake.notify_one(),
                }
            }
            Notification::Resync => {
                inner.refresh_projection().await;
                settle_after_sibling_sync(&inner).await;
                inner.lease_wake.notify_one();
            }
        }
    }
}

/// Another instance synced: drop what it pushed from our tracker, pick up
/// what it pulled, and mirror the result in our status.
async fn settle_after_sibling_sync(inner: &Inner) {
    if let Err(e) = inner.tracker.retain_pending(&inner.store).await {
        warn!("[instance] {} failed to reconcile tracker: {}", inner.id, e);
    }
    inner.refresh_projection().await;
    if inner.is_leader() {
        return;
    }
    match inner.store.summary() {
        Ok(summary) => inner.status.set_synced(inner.clock.now(), summary.rejected),
        Err(e) => warn!("[instance] {} failed to read store summary: {}", inner.id, e),
    }
    inner.signal(Signal::SiblingSynced);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::MemoryRemote;
    use crate::status::SyncState;
    use serde_json::json;

    fn scope() -> (SyncScope, Arc<MemoryRemote>) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let scope = SyncScope::new(store, remote.clone(), SyncConfig::default())
            .with_clock(Arc::new(ManualClock::default()));
        (scope, remote)
    }

    #[test]
    fn test_projection_hides_tombstones() {
        let store = LocalStore::in_memory().unwrap();
        let live = EntityRecord::new("a", Revision(1), json!({}));
        let gone = EntityRecord::new("b", Revision(1), json!({}));
        store.put(&live, WriteOrigin::Local).unwrap();
        store.put(&gone, WriteOrigin::Local).unwrap();

        let mut projection = Projection::default();
        assert_eq!(projection.refresh(&store).unwrap(), 2);
        assert_eq!(projection.len(), 2);

        let tombstone = gone.tombstone(Revision(2), chrono::Utc::now());
        store.put(&tombstone, WriteOrigin::Local).unwrap();
        assert_eq!(projection.refresh(&store).unwrap(), 1);
        assert_eq!(projection.ids(), vec![EntityId::from("a")]);
        assert_eq!(projection.seq(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_assigns_increasing_revisions() {
        let (scope, _remote) = scope();
        let instance = SyncInstance::start(&scope, InstanceId::new("a"));

        let first = instance.put("task-1", json!({"title": "draft"})).await.unwrap();
        let second = instance.put("task-1", json!({"title": "final"})).await.unwrap();
        assert!(second.revision > first.revision);
        assert_eq!(
            instance.get(&EntityId::from("task-1")).unwrap(),
            Some(second.clone())
        );
        assert_eq!(
            instance.projection().await.get(&EntityId::from("task-1")),
            Some(&second)
        );
        instance.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_missing_entity() {
        let (scope, _remote) = scope();
        let instance = SyncInstance::start(&scope, InstanceId::new("a"));
        assert!(matches!(
            instance.delete("nope").await,
            Err(InstanceError::NotFound(_))
        ));
        instance.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_becomes_leader_and_syncs() {
        let (scope, remote) = scope();
        let instance = SyncInstance::start(&scope, InstanceId::new("a"));
        let mut status = instance.subscribe_status();

        instance.put("task-1", json!({"title": "buy milk"})).await.unwrap();
        status
            .wait_for(|s| s.state == SyncState::Synced)
            .await
            .unwrap();

        assert!(instance.is_leader());
        assert!(remote.get(&EntityId::from("task-1")).await.is_some());
        assert_eq!(instance.pending_changes().await, 0);
        instance.shutdown().await;
    }
}
