//! Pattern cache.
//!
//! Compiled patterns live in process memory and are written through to the
//! keyed store together with a modification timestamp. Another process that
//! edits a pattern bumps that timestamp; [`PatternCache::stale_check`] notices
//! and reloads. Every load, store and unload of a pattern id runs under that
//! id's lock. Reads never lock.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::error::{Result, ThredError};
use crate::keyed_store::{kinds, Meta, Resource, Storage};
use crate::pattern::{Pattern, PatternModel};

/// Metadata key holding a pattern's modification time (epoch millis).
pub const TIMESTAMP_META: &str = "timestamp";

#[derive(Debug, Clone)]
struct CachedPattern {
    pattern: Arc<Pattern>,
    timestamp: i64,
}

pub struct PatternCache {
    storage: Arc<Storage>,
    entries: DashMap<String, CachedPattern>,
    order: RwLock<Vec<String>>,
}

impl PatternCache {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Pattern>> {
        self.entries.get(id).map(|e| Arc::clone(&e.pattern))
    }

    /// Cached modification timestamp of `id`.
    pub fn timestamp(&self, id: &str) -> Option<i64> {
        self.entries.get(id).map(|e| e.timestamp)
    }

    pub fn pattern_ids(&self) -> Vec<String> {
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cached patterns in insertion order.
    pub fn patterns(&self) -> Vec<Arc<Pattern>> {
        self.pattern_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load every pattern listed in the keyed store's pattern index.
    pub async fn load_patterns(&self) -> Result<usize> {
        let ids = self.storage.type_ids(kinds::PATTERN).await?;
        let mut loaded = 0;
        for id in &ids {
            if self.load_pattern(id).await?.is_some() {
                loaded += 1;
            }
        }
        info!(loaded, "patterns loaded");
        Ok(loaded)
    }

    /// (Re)load one pattern from the keyed store under its lock.
    pub async fn load_pattern(&self, id: &str) -> Result<Option<Arc<Pattern>>> {
        self.storage
            .acquire(&[Resource::pattern(id)], || async move { self.load_locked(id).await })
            .await
    }

    /// Compile and store a batch. Invalid models are logged and skipped;
    /// storage failures abort the batch.
    pub async fn add_patterns(&self, models: Vec<PatternModel>) -> Result<usize> {
        let mut stored = 0;
        for model in models {
            let id = model.id.clone();
            match self.store_pattern_model(model).await {
                Ok(_) => {
                    info!(pattern_id = %id, "pattern stored");
                    stored += 1;
                }
                Err(err @ (ThredError::ArgumentValidation(_) | ThredError::UnknownReaction { .. })) => {
                    error!(pattern_id = %id, error = %err, "invalid pattern skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(stored)
    }

    /// Reload `id` when the keyed store holds a newer version than the
    /// cache. Returns whether a reload happened.
    pub async fn stale_check(&self, id: &str) -> Result<bool> {
        let Some(stored) = self.stored_timestamp(id).await? else {
            return Ok(false);
        };
        if self.timestamp(id).is_some_and(|cached| cached >= stored) {
            return Ok(false);
        }
        debug!(pattern_id = %id, stored, "stale pattern, reloading");
        self.load_pattern(id).await?;
        Ok(true)
    }

    pub async fn store_pattern_model(&self, model: PatternModel) -> Result<Arc<Pattern>> {
        let pattern = Arc::new(Pattern::compile(model)?);
        self.store_pattern(Arc::clone(&pattern)).await?;
        Ok(pattern)
    }

    /// Write through to the keyed store with a fresh timestamp and cache.
    pub async fn store_pattern(&self, pattern: Arc<Pattern>) -> Result<()> {
        let id = pattern.id();
        let pattern = &pattern;
        self.storage
            .acquire(&[Resource::pattern(id)], || async move {
                let previous = self.stored_timestamp(id).await?.unwrap_or(0);
                let timestamp = Utc::now().timestamp_millis().max(previous + 1);
                let meta: Meta = [(TIMESTAMP_META.to_string(), timestamp.to_string())].into();
                self.storage
                    .save(kinds::PATTERN, id, pattern.model(), Some(meta))
                    .await?;
                self.insert(Arc::clone(pattern), timestamp);
                Ok(())
            })
            .await
    }

    /// Drop `id` from the cache and the keyed store.
    pub async fn unload_pattern_store(&self, id: &str) -> Result<bool> {
        self.storage
            .acquire(&[Resource::pattern(id)], || async move {
                let existed = self.storage.delete(kinds::PATTERN, id).await?;
                self.remove(id);
                info!(pattern_id = %id, "pattern unloaded");
                Ok(existed)
            })
            .await
    }

    async fn load_locked(&self, id: &str) -> Result<Option<Arc<Pattern>>> {
        let Some(model) = self.storage.retrieve::<PatternModel>(kinds::PATTERN, id).await? else {
            self.remove(id);
            return Ok(None);
        };
        let timestamp = self.stored_timestamp(id).await?.unwrap_or(0);
        let pattern = Arc::new(Pattern::compile(model)?);
        self.insert(Arc::clone(&pattern), timestamp);
        debug!(pattern_id = %id, timestamp, "pattern loaded");
        Ok(Some(pattern))
    }

    async fn stored_timestamp(&self, id: &str) -> Result<Option<i64>> {
        let raw = self
            .storage
            .get_meta_value(kinds::PATTERN, id, TIMESTAMP_META)
            .await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    fn insert(&self, pattern: Arc<Pattern>, timestamp: i64) {
        let id = pattern.id().to_string();
        let previous = self
            .entries
            .insert(id.clone(), CachedPattern { pattern, timestamp });
        if previous.is_none() {
            let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);
            if !order.contains(&id) {
                order.push(id);
            }
        }
    }

    fn remove(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.order
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|known| known != id);
        }
    }
}
