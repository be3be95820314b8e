//! Randomized and timing properties of the sync coordinator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskflow_sync::clock::{Clock, ManualClock};
use taskflow_sync::leader::Leadership;
use taskflow_sync::remote::{MemoryRemote, RemoteCall, RemoteError, RemoteOp};
use taskflow_sync::store::WriteOrigin;
use taskflow_sync::tracker::ChangeTracker;
use taskflow_sync::{
    Checkpoint, CycleKind, EntityId, EntityRecord, InstanceId, LeaderElection, LocalStore,
    Revision, SyncConfig, SyncEngine, SyncInstance, SyncScope, SyncState,
};

fn record(id: &str, revision: u64) -> EntityRecord {
    EntityRecord::new(id, Revision(revision), json!({ "rev": revision }))
}

/// The stored revision is always the maximum ever offered, whatever the
/// mix and order of local and remote writes.
#[test]
fn test_revision_monotonicity() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = LocalStore::in_memory().unwrap();
        let mut offered: HashMap<String, u64> = HashMap::new();
        let mut checkpoint = 0;

        for _ in 0..200 {
            let id = format!("task-{}", rng.gen_range(0..5));
            let revision = rng.gen_range(1..50);
            let r = record(&id, revision);
            if rng.gen_bool(0.5) {
                store.put(&r, WriteOrigin::Local).unwrap();
            } else {
                checkpoint += 1;
                store.apply_remote(&[r], Checkpoint(checkpoint)).unwrap();
            }
            let max = offered.entry(id).or_insert(0);
            *max = (*max).max(revision);
        }

        for (id, max) in offered {
            let stored = store.get(&EntityId::from(id.as_str())).unwrap().unwrap();
            assert_eq!(stored.revision, Revision(max), "seed {} id {}", seed, id);
        }
    }
}

/// Across candidates that acquire, renew, release and crash at random while
/// the clock jumps forward, at most one of them ever believes it holds an
/// unexpired lease, and that one is the holder of record.
#[test]
fn test_at_most_one_leader() {
    const CANDIDATES: usize = 5;
    let lease = Duration::from_secs(10);

    for seed in 0..25 {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::default());
        let election = LeaderElection::new(store.clone(), clock.clone(), "default", lease);

        let ids: Vec<InstanceId> = (0..CANDIDATES)
            .map(|i| InstanceId::new(format!("instance-{}", i)))
            .collect();
        let mut views = vec![Leadership::default(); CANDIDATES];
        let mut crashed = vec![false; CANDIDATES];

        for step in 0..500 {
            clock.advance(Duration::from_millis(rng.gen_range(0..4000)));
            let i = rng.gen_range(0..CANDIDATES);

            match rng.gen_range(0..10) {
                // Crash: stops acting, keeps its stale view
                0 => crashed[i] = true,
                // Restart with a clean view
                1 => {
                    crashed[i] = false;
                    views[i] = Leadership::default();
                }
                2 if !crashed[i] => {
                    if let Ok(true) = election.release(&ids[i]) {
                        views[i].revoke();
                    }
                }
                _ if !crashed[i] => {
                    let result = if views[i].token().is_some() {
                        election.renew(&ids[i])
                    } else {
                        election.acquire(&ids[i], lease)
                    };
                    match result {
                        Ok(token) => views[i].granted(token),
                        Err(_) => {
                            views[i].revoke();
                        }
                    }
                }
                _ => {}
            }

            let now = clock.now();
            let leaders: Vec<usize> = (0..CANDIDATES)
                .filter(|&c| views[c].is_valid_at(now))
                .collect();
            assert!(
                leaders.len() <= 1,
                "seed {} step {}: {:?} all believe they lead",
                seed,
                step,
                leaders
            );
            if let Some(&leader) = leaders.first() {
                let token = store.leader_token("default").unwrap().unwrap();
                assert!(token.is_held_by(&ids[leader]), "seed {} step {}", seed, step);
            }
        }
    }
}

fn engine_with(
    config: SyncConfig,
) -> (Arc<LocalStore>, Arc<ChangeTracker>, Arc<MemoryRemote>, SyncEngine) {
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
    (store, tracker, remote, engine)
}

/// Every push is preceded by a pull in the same cycle, and the push never
/// overwrites a newer remote edit with a stale local copy.
#[tokio::test]
async fn test_no_push_before_pull() {
    let (store, tracker, remote, engine) = engine_with(SyncConfig::default());

    for cycle in 0..5u64 {
        remote.insert(record(&format!("remote-{}", cycle), 1)).await;
        // Edited on another device after our last pull
        remote.insert(record("shared", 100 + cycle)).await;

        let local = record("shared", 50 + cycle);
        if store.put(&local, WriteOrigin::Local).unwrap().is_applied() {
            tracker.mark_dirty(local).await;
        }
        let mine = record(&format!("local-{}", cycle), 1);
        store.put(&mine, WriteOrigin::Local).unwrap();
        tracker.mark_dirty(mine).await;

        remote.clear_calls().await;
        let head = remote.head().await;
        let outcome = engine.run_cycle(CycleKind::Full).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.report.checkpoint_after_pull, Some(head));

        let calls = remote.calls().await;
        assert!(matches!(calls.first(), Some(RemoteCall::Pull { .. })));
        for call in &calls {
            if let RemoteCall::Push { ids } = call {
                assert!(!ids.contains(&EntityId::from("shared")));
            }
        }
        let shared = remote.get(&EntityId::from("shared")).await.unwrap();
        assert_eq!(shared.revision, Revision(100 + cycle));
    }
}

/// A partially failed push is retried for exactly the entities that did not
/// get through: no duplicates, no silent drops.
#[tokio::test]
async fn test_change_set_idempotent_under_partial_failure() {
    let config = SyncConfig {
        push_batch_size: 2,
        ..Default::default()
    };
    let (store, tracker, remote, engine) = engine_with(config);
    let ids = ["a", "b", "c", "d", "e"];
    for id in ids {
        let r = record(id, 1);
        store.put(&r, WriteOrigin::Local).unwrap();
        tracker.mark_dirty(r).await;
    }
    remote.reject("b", "title too long").await;
    remote.reject("e", "unknown project").await;

    let first = engine.run_cycle(CycleKind::Full).await;
    assert!(first.is_success());
    assert_eq!(first.report.accepted.len(), 3);

    remote.clear_calls().await;
    let second = engine.run_cycle(CycleKind::Full).await;
    assert_eq!(
        second.report.pushed,
        vec![EntityId::from("b"), EntityId::from("e")]
    );

    // Transport failure: nothing is lost, nothing is sent twice afterwards
    remote.accept(&EntityId::from("b")).await;
    remote.accept(&EntityId::from("e")).await;
    remote
        .fail_next(
            RemoteOp::Push,
            RemoteError::Unavailable {
                status: Some(503),
                message: "maintenance".into(),
            },
        )
        .await;
    let third = engine.run_cycle(CycleKind::Full).await;
    assert!(!third.is_success());
    assert_eq!(tracker.len().await, 2);

    remote.clear_calls().await;
    let fourth = engine.run_cycle(CycleKind::Full).await;
    assert!(fourth.is_success());
    let mut accepted = fourth.report.accepted.clone();
    accepted.sort();
    assert_eq!(accepted, vec![EntityId::from("b"), EntityId::from("e")]);

    remote.clear_calls().await;
    engine.run_cycle(CycleKind::Full).await;
    assert_eq!(remote.push_count().await, 0);
    assert_eq!(remote.len().await, ids.len());
    assert!(store.pending().unwrap().is_empty());
}

/// Twenty quick edits of one task inside the debounce window produce a
/// single change-set entry and a single push.
#[tokio::test(start_paused = true)]
async fn test_debounce_coalescing() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let remote = Arc::new(MemoryRemote::new());
    let config = SyncConfig {
        debounce_ms: 1000,
        ..Default::default()
    };
    let scope = SyncScope::new(store.clone(), remote.clone(), config)
        .with_clock(Arc::new(ManualClock::default()));
    let instance = SyncInstance::start(&scope, InstanceId::new("solo"));

    let mut status = instance.subscribe_status();
    status
        .wait_for(|s| s.state == SyncState::Synced)
        .await
        .unwrap();
    remote.clear_calls().await;

    let mut last = None;
    for i in 0..20 {
        last = Some(
            instance
                .put("task-1", json!({ "title": format!("draft {}", i) }))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(instance.pending_changes().await, 1);
    assert_eq!(remote.push_count().await, 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        remote.calls().await.iter().filter(|c| matches!(c, RemoteCall::Push { .. })).count(),
        1
    );
    assert_eq!(remote.get(&EntityId::from("task-1")).await, last);
    instance.shutdown().await;
}
