//! Distributed lock behaviour: mutual exclusion, quorum, release and expiry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::LockConfig;
use crate::error::{StoreError, ThredError};
use crate::keyed_store::{KeyedStore, LockNode, MemoryKeyedStore, Redlock, Resource, Storage};

fn fast_config() -> LockConfig {
    LockConfig {
        ttl_ms: 1_000,
        retry_count: 500,
        retry_delay_ms: 2,
        retry_jitter_ms: 3,
        drift_factor: 0.01,
    }
}

fn nodes(n: usize) -> Vec<Arc<MemoryKeyedStore>> {
    (0..n).map(|_| Arc::new(MemoryKeyedStore::new())).collect()
}

fn as_lock_nodes(nodes: &[Arc<MemoryKeyedStore>]) -> Vec<Arc<dyn LockNode>> {
    nodes
        .iter()
        .map(|n| {
            let node: Arc<dyn LockNode> = n.clone();
            node
        })
        .collect()
}

// ============================================================================
// Failing replica
// ============================================================================

struct UnreachableNode;

#[async_trait]
impl LockNode for UnreachableNode {
    async fn try_lock(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("replica down".into()))
    }

    async fn unlock(&self, _key: &str, _token: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("replica down".into()))
    }

    async fn extend(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("replica down".into()))
    }
}

// ============================================================================
// Mutual exclusion
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_sections_never_overlap() {
    let storage = Arc::new(Storage::in_memory(fast_config()));
    let intervals: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let intervals = Arc::clone(&intervals);
            tokio::spawn(async move {
                storage
                    .acquire(&[Resource::thred("shared")], || async move {
                        let entered = Instant::now();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        intervals.lock().unwrap().push((entered, Instant::now()));
                        Ok(())
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut intervals = intervals.lock().unwrap().clone();
    assert_eq!(intervals.len(), 8);
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "critical sections overlapped");
    }
}

#[tokio::test]
async fn multi_resource_claim_blocks_each_resource() {
    let config = LockConfig {
        retry_count: 1,
        ..fast_config()
    };
    let storage = Storage::in_memory(config);

    let both = storage
        .claim(&[Resource::thred("b"), Resource::pattern("p")])
        .await
        .unwrap();
    assert_eq!(both.lock().resources().len(), 2);

    let err = storage.claim(&[Resource::pattern("p")]).await.unwrap_err();
    assert!(matches!(err, ThredError::LockAcquisition { attempts: 2, .. }));
    assert!(err.is_retryable());

    // Different resource is unaffected.
    let other = storage.claim(&[Resource::thred("c")]).await.unwrap();
    other.release().await;
    both.release().await;

    storage.claim(&[Resource::pattern("p")]).await.unwrap().release().await;
}

// ============================================================================
// Quorum
// ============================================================================

#[tokio::test]
async fn lock_survives_minority_of_failed_replicas() {
    let healthy = nodes(2);
    let mut replicas = as_lock_nodes(&healthy);
    replicas.push(Arc::new(UnreachableNode));

    let redlock = Redlock::new(replicas, fast_config());
    assert_eq!(redlock.quorum(), 2);

    let lock = redlock
        .lock(&[Resource::thred("t")], Duration::from_millis(500))
        .await
        .unwrap();
    assert!(!lock.is_expired());
    assert!(healthy.iter().all(|n| n.held_locks() == 1));

    redlock.unlock(&lock).await;
    assert!(healthy.iter().all(|n| n.held_locks() == 0));
}

#[tokio::test]
async fn lock_fails_without_majority() {
    let healthy = nodes(1);
    let mut replicas = as_lock_nodes(&healthy);
    replicas.push(Arc::new(UnreachableNode));
    replicas.push(Arc::new(UnreachableNode));

    let config = LockConfig {
        retry_count: 2,
        ..fast_config()
    };
    let redlock = Redlock::new(replicas, config);

    let err = redlock
        .lock(&[Resource::thred("t")], Duration::from_millis(500))
        .await
        .unwrap_err();
    match err {
        ThredError::LockAcquisition { resources, attempts } => {
            assert_eq!(resources, vec![Resource::thred("t")]);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Partial acquisitions were rolled back.
    assert_eq!(healthy[0].held_locks(), 0);
}

#[tokio::test]
async fn lock_is_refused_when_ttl_is_within_drift() {
    let config = LockConfig {
        retry_count: 0,
        ..fast_config()
    };
    let redlock = Redlock::new(as_lock_nodes(&nodes(1)), config);

    // drift = 1ms * 0.01 rounded + 2ms, larger than the ttl itself
    let err = redlock
        .lock(&[Resource::thred("t")], Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ThredError::LockAcquisition { attempts: 1, .. }));
}

// ============================================================================
// Release, drop and expiry
// ============================================================================

#[tokio::test]
async fn release_is_idempotent() {
    let replicas = nodes(1);
    let storage = Storage::new(replicas[0].clone(), as_lock_nodes(&replicas), fast_config());

    let guard = storage.claim(&[Resource::thred("t")]).await.unwrap();
    storage.release(&guard).await;
    storage.release(&guard).await;
    assert!(guard.is_released());
    assert_eq!(replicas[0].held_locks(), 0);

    // A stale release must not free somebody else's lock.
    let second = storage.claim(&[Resource::thred("t")]).await.unwrap();
    guard.release().await;
    assert_eq!(replicas[0].held_locks(), 1);
    second.release().await;
}

#[tokio::test]
async fn dropped_guard_releases_in_background() {
    let replicas = nodes(1);
    let storage = Storage::new(replicas[0].clone(), as_lock_nodes(&replicas), fast_config());

    {
        let _guard = storage.claim(&[Resource::thred("t")]).await.unwrap();
        assert_eq!(replicas[0].held_locks(), 1);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(replicas[0].held_locks(), 0);
}

#[tokio::test]
async fn abandoned_lock_expires_after_ttl() {
    let config = LockConfig {
        retry_count: 100,
        ..fast_config()
    };
    let storage = Storage::in_memory(config);

    let abandoned = storage
        .claim_with_ttl(&[Resource::thred("t")], Duration::from_millis(50))
        .await
        .unwrap();
    // Simulate a crashed holder: never released, never dropped.
    std::mem::forget(abandoned);

    let started = Instant::now();
    let guard = storage.claim(&[Resource::thred("t")]).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
    guard.release().await;
}

#[tokio::test]
async fn renew_extends_a_held_lock() {
    let storage = Storage::in_memory(fast_config());
    let mut guard = storage
        .claim_with_ttl(&[Resource::thred("t")], Duration::from_millis(100))
        .await
        .unwrap();
    let before = guard.lock().remaining();

    storage
        .renew_claim(&mut guard, Some(Duration::from_millis(800)))
        .await
        .unwrap();
    assert!(guard.lock().remaining() > before);

    guard.release().await;
    assert!(storage.renew_claim(&mut guard, None).await.is_err());
}

#[tokio::test]
async fn save_and_claim_releases_when_save_fails() {
    let replicas = nodes(1);
    let storage = Storage::new(replicas[0].clone(), as_lock_nodes(&replicas), fast_config());
    replicas[0].close().await.unwrap();

    let err = storage
        .save_and_claim("thred", "t", &serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ThredError::Store(StoreError::Closed)));
    assert_eq!(replicas[0].held_locks(), 0);
}
