//! Redlock-style distributed locking.
//!
//! A lock is held when a majority of [`LockNode`] replicas accepted the same
//! random token for every requested key, and the time spent acquiring plus
//! the drift allowance is still below the ttl. Otherwise every replica is
//! unlocked and the attempt is retried after the configured delay plus
//! jitter, up to the retry budget.
//!
//! Locks are not reentrant. A lock that is never released expires after its
//! ttl on every replica.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Resource;
use crate::config::LockConfig;
use crate::error::{Result, StoreError, ThredError};

/// One lock replica.
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Set `key` to `token` unless a live entry exists. Returns whether the
    /// key is now held with `token`.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove `key` only if it still holds `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Push the expiry of `key` to now + ttl if it still holds `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Ownership of a set of resources until `expires_at`.
#[derive(Debug, Clone)]
pub struct Lock {
    resources: SmallVec<[Resource; 2]>,
    keys: SmallVec<[String; 2]>,
    token: String,
    expires_at: Instant,
}

impl Lock {
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

pub struct Redlock {
    nodes: Vec<Arc<dyn LockNode>>,
    config: LockConfig,
}

impl Redlock {
    pub fn new(nodes: Vec<Arc<dyn LockNode>>, config: LockConfig) -> Self {
        Self { nodes, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub async fn lock(&self, resources: &[Resource], ttl: Duration) -> Result<Lock> {
        let mut resources: SmallVec<[Resource; 2]> = resources.iter().cloned().collect();
        resources.sort();
        resources.dedup();
        let keys: SmallVec<[String; 2]> = resources.iter().map(Resource::lock_key).collect();
        let attempts = self.config.retry_count + 1;

        for attempt in 1..=attempts {
            let token = Uuid::new_v4().to_string();
            let started = Instant::now();

            let acquired = join_all(
                self.nodes
                    .iter()
                    .map(|node| lock_on_node(node.as_ref(), &keys, &token, ttl)),
            )
            .await
            .into_iter()
            .filter(|held| *held)
            .count();

            let drift = self.config.drift(ttl);
            let elapsed = started.elapsed();
            if acquired >= self.quorum() && elapsed + drift < ttl {
                debug!(?keys, attempt, "lock acquired");
                return Ok(Lock {
                    resources,
                    keys,
                    token,
                    expires_at: started + ttl - drift,
                });
            }

            self.unlock_keys(&keys, &token).await;
            if attempt < attempts {
                tokio::time::sleep(self.config.next_delay()).await;
            }
        }

        warn!(?keys, attempts, "lock acquisition failed");
        Err(ThredError::LockAcquisition {
            resources: resources.into_vec(),
            attempts,
        })
    }

    /// Release on every replica. Never fails; an expired or foreign entry is
    /// left untouched.
    pub async fn unlock(&self, lock: &Lock) {
        self.unlock_keys(&lock.keys, &lock.token).await;
        debug!(keys = ?lock.keys, "lock released");
    }

    /// Extend a held lock. Fails when a majority no longer holds the token.
    pub async fn extend(&self, lock: &mut Lock, ttl: Duration) -> Result<()> {
        let started = Instant::now();
        let keys = &lock.keys;
        let token = lock.token.as_str();
        let extended = join_all(self.nodes.iter().map(|node| async move {
            for key in keys {
                match node.extend(key, token, ttl).await {
                    Ok(true) => {}
                    _ => return false,
                }
            }
            true
        }))
        .await
        .into_iter()
        .filter(|held| *held)
        .count();

        if extended >= self.quorum() {
            lock.expires_at = started + ttl - self.config.drift(ttl);
            Ok(())
        } else {
            Err(ThredError::LockAcquisition {
                resources: lock.resources.to_vec(),
                attempts: 1,
            })
        }
    }

    async fn unlock_keys(&self, keys: &[String], token: &str) {
        join_all(self.nodes.iter().map(|node| async move {
            for key in keys {
                if let Err(err) = node.unlock(key, token).await {
                    debug!(key, error = %err, "unlock failed on replica");
                }
            }
        }))
        .await;
    }
}

/// Lock every key on one replica, or none of them.
async fn lock_on_node(node: &dyn LockNode, keys: &[String], token: &str, ttl: Duration) -> bool {
    for (i, key) in keys.iter().enumerate() {
        match node.try_lock(key, token, ttl).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                for held in &keys[..i] {
                    let _ = node.unlock(held, token).await;
                }
                return false;
            }
        }
    }
    true
}

/// Scoped lock ownership.
///
/// Call [`release`](Self::release) on every exit path you control. If the
/// guard is dropped unreleased (early return, error, panic) the release is
/// spawned onto the current runtime; without a runtime the ttl cleans up.
pub struct LockGuard {
    redlock: Arc<Redlock>,
    lock: Lock,
    released: AtomicBool,
}

impl LockGuard {
    pub(crate) fn new(redlock: Arc<Redlock>, lock: Lock) -> Self {
        Self {
            redlock,
            lock,
            released: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Idempotent; safe after expiry.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.redlock.unlock(&self.lock).await;
    }

    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        if self.is_released() {
            return Err(ThredError::LockAcquisition {
                resources: self.lock.resources.to_vec(),
                attempts: 0,
            });
        }
        self.redlock.extend(&mut self.lock, ttl).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let redlock = Arc::clone(&self.redlock);
            let lock = self.lock.clone();
            handle.spawn(async move { redlock.unlock(&lock).await });
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock)
            .field("released", &self.is_released())
            .finish()
    }
}
