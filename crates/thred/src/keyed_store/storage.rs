use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{KeyedStore, LockGuard, LockNode, MemoryKeyedStore, Meta, Redlock, Resource};
use crate::config::LockConfig;
use crate::error::Result;

/// Lock-aware facade over a [`KeyedStore`] and its lock replicas.
///
/// Constructed once per process and shared by reference (`Arc<Storage>`).
pub struct Storage {
    store: Arc<dyn KeyedStore>,
    redlock: Arc<Redlock>,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyedStore>, lock_nodes: Vec<Arc<dyn LockNode>>, config: LockConfig) -> Self {
        Self {
            store,
            redlock: Arc::new(Redlock::new(lock_nodes, config)),
        }
    }

    /// Single in-process store acting as its own lock replica.
    pub fn in_memory(config: LockConfig) -> Self {
        let memory = Arc::new(MemoryKeyedStore::new());
        let node: Arc<dyn LockNode> = memory.clone();
        Self::new(memory, vec![node], config)
    }

    pub fn store(&self) -> &dyn KeyedStore {
        self.store.as_ref()
    }

    pub fn lock_config(&self) -> &LockConfig {
        self.redlock.config()
    }

    /// Lock `resources` with the default ttl. The caller must release.
    pub async fn claim(&self, resources: &[Resource]) -> Result<LockGuard> {
        self.claim_with_ttl(resources, self.lock_config().ttl()).await
    }

    pub async fn claim_with_ttl(&self, resources: &[Resource], ttl: Duration) -> Result<LockGuard> {
        let lock = self.redlock.lock(resources, ttl).await?;
        Ok(LockGuard::new(Arc::clone(&self.redlock), lock))
    }

    /// Idempotent.
    pub async fn release(&self, guard: &LockGuard) {
        guard.release().await;
    }

    pub async fn renew_claim(&self, guard: &mut LockGuard, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or_else(|| self.lock_config().ttl());
        guard.renew(ttl).await
    }

    /// Run `op` while holding locks on `resources`; the locks are released
    /// on every exit path.
    pub async fn acquire<T, F, Fut>(&self, resources: &[Resource], op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.claim(resources).await?;
        let outcome = op().await;
        guard.release().await;
        outcome
    }

    /// Save, then release the claim whatever the save outcome.
    pub async fn save_and_release<T: Serialize>(
        &self,
        guard: LockGuard,
        kind: &str,
        id: &str,
        value: &T,
        meta: Option<Meta>,
    ) -> Result<()> {
        let saved = self.save(kind, id, value, meta).await;
        guard.release().await;
        saved
    }

    /// Claim `{kind, id}` and save under the claim. The claim is released
    /// if the save fails.
    pub async fn save_and_claim<T: Serialize>(
        &self,
        kind: &str,
        id: &str,
        value: &T,
        meta: Option<Meta>,
    ) -> Result<LockGuard> {
        let guard = self.claim(&[Resource::new(kind, id)]).await?;
        if let Err(err) = self.save(kind, id, value, meta).await {
            guard.release().await;
            return Err(err);
        }
        Ok(guard)
    }

    pub async fn save<T: Serialize>(&self, kind: &str, id: &str, value: &T, meta: Option<Meta>) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store.save(kind, id, value, meta).await?;
        debug!(kind, id, "saved");
        Ok(())
    }

    pub async fn retrieve<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        match self.store.retrieve(kind, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn retrieve_all<T: DeserializeOwned>(&self, kind: &str, ids: &[String]) -> Result<Vec<T>> {
        self.store
            .retrieve_all(kind, ids)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    pub async fn retrieve_raw(&self, kind: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.store.retrieve(kind, id).await?)
    }

    pub async fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        Ok(self.store.delete(kind, id).await?)
    }

    pub async fn exists(&self, kind: &str, id: &str) -> Result<bool> {
        Ok(self.store.exists(kind, id).await?)
    }

    pub async fn type_ids(&self, kind: &str) -> Result<Vec<String>> {
        Ok(self.store.type_ids(kind).await?)
    }

    pub async fn set_meta_value(&self, kind: &str, id: &str, key: &str, value: &str) -> Result<()> {
        Ok(self.store.set_meta_value(kind, id, key, value).await?)
    }

    pub async fn get_meta_value(&self, kind: &str, id: &str, key: &str) -> Result<Option<String>> {
        Ok(self.store.get_meta_value(kind, id, key).await?)
    }

    pub async fn add_to_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64> {
        Ok(self.store.add_to_set(kind, id, members).await?)
    }

    pub async fn remove_from_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64> {
        Ok(self.store.remove_from_set(kind, id, members).await?)
    }

    pub async fn retrieve_set(&self, kind: &str, id: &str) -> Result<Vec<String>> {
        Ok(self.store.retrieve_set(kind, id).await?)
    }

    pub async fn set_count(&self, kind: &str, id: &str) -> Result<u64> {
        Ok(self.store.set_count(kind, id).await?)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.store.close().await?)
    }
}
