//! In-process keyed store and lock replica.
//!
//! Suitable for a single process and for tests. Object, set and index state
//! sit behind one mutex so index maintenance is atomic; lock entries live in
//! a `DashMap` and use its entry API for check-and-set.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use super::{KeyedStore, LockNode, Meta};
use crate::error::StoreError;

type Key = (String, String);

fn key(kind: &str, id: &str) -> Key {
    (kind.to_string(), id.to_string())
}

#[derive(Debug, Default)]
struct Object {
    value: Value,
    meta: Meta,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<Key, Object>,
    type_index: HashMap<String, BTreeSet<String>>,
    sets: HashMap<Key, BTreeSet<String>>,
    set_index: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryKeyedStore {
    state: Mutex<State>,
    locks: DashMap<String, LockEntry>,
    closed: AtomicBool,
}

impl MemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.state
            .lock()
            .map_err(|e| StoreError::backend(e.to_string()))
    }

    /// Number of live lock entries.
    pub fn held_locks(&self) -> usize {
        self.purge_expired_locks(Instant::now());
        self.locks.len()
    }

    /// Must not be called while holding a guard into `locks`.
    fn purge_expired_locks(&self, now: Instant) {
        self.locks.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn save(&self, kind: &str, id: &str, value: Value, meta: Option<Meta>) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let object = state.objects.entry(key(kind, id)).or_default();
        object.value = value;
        if let Some(meta) = meta {
            object.meta.extend(meta);
        }
        state
            .type_index
            .entry(kind.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    async fn retrieve(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state()?;
        Ok(state.objects.get(&key(kind, id)).map(|o| o.value.clone()))
    }

    async fn retrieve_all(&self, kind: &str, ids: &[String]) -> Result<Vec<Value>, StoreError> {
        let state = self.state()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.objects.get(&key(kind, id)).map(|o| o.value.clone()))
            .collect())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let existed = state.objects.remove(&key(kind, id)).is_some();
        if let Some(ids) = state.type_index.get_mut(kind) {
            ids.remove(id);
            if ids.is_empty() {
                state.type_index.remove(kind);
            }
        }
        Ok(existed)
    }

    async fn exists(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.objects.contains_key(&key(kind, id)))
    }

    async fn type_ids(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .type_index
            .get(kind)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_meta_value(&self, kind: &str, id: &str, meta_key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(object) = state.objects.get_mut(&key(kind, id)) {
            object.meta.insert(meta_key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn get_meta_value(&self, kind: &str, id: &str, meta_key: &str) -> Result<Option<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .objects
            .get(&key(kind, id))
            .and_then(|o| o.meta.get(meta_key).cloned()))
    }

    async fn add_to_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        if members.is_empty() {
            return Ok(0);
        }
        let set = state.sets.entry(key(kind, id)).or_default();
        let added = members.iter().filter(|m| set.insert((*m).clone())).count() as u64;
        let non_empty = !set.is_empty();
        if non_empty {
            state
                .set_index
                .entry(kind.to_string())
                .or_default()
                .insert(id.to_string());
        }
        Ok(added)
    }

    async fn remove_from_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let set_key = key(kind, id);
        let Some(set) = state.sets.get_mut(&set_key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count() as u64;
        if set.is_empty() {
            state.sets.remove(&set_key);
            if let Some(ids) = state.set_index.get_mut(kind) {
                ids.remove(id);
                if ids.is_empty() {
                    state.set_index.remove(kind);
                }
            }
        }
        Ok(removed)
    }

    async fn retrieve_set(&self, kind: &str, id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .sets
            .get(&key(kind, id))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_count(&self, kind: &str, id: &str) -> Result<u64, StoreError> {
        let state = self.state()?;
        Ok(state.sets.get(&key(kind, id)).map_or(0, |s| s.len() as u64))
    }

    async fn set_ids(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .set_index
            .get(kind)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl LockNode for MemoryKeyedStore {
    async fn try_lock(&self, lock_key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.purge_expired_locks(now);
        let fresh = LockEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        Ok(match self.locks.entry(lock_key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    held.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        })
    }

    async fn unlock(&self, lock_key: &str, token: &str) -> Result<bool, StoreError> {
        Ok(self
            .locks
            .remove_if(lock_key, |_, entry| entry.token == token)
            .is_some())
    }

    async fn extend(&self, lock_key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.locks.get_mut(lock_key) {
            Some(mut entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn save_and_delete_maintain_type_index() {
        let store = MemoryKeyedStore::new();
        store.save("thred", "a", json!({ "n": 1 }), None).await.unwrap();
        store.save("thred", "b", json!({ "n": 2 }), None).await.unwrap();

        assert_eq!(store.type_ids("thred").await.unwrap(), ids(&["a", "b"]));
        assert_eq!(
            store.retrieve_all("thred", &ids(&["b", "missing"])).await.unwrap(),
            vec![json!({ "n": 2 })]
        );

        assert!(store.delete("thred", "a").await.unwrap());
        assert!(!store.delete("thred", "a").await.unwrap());
        assert_eq!(store.type_ids("thred").await.unwrap(), ids(&["b"]));
    }

    #[tokio::test]
    async fn meta_is_merged_on_save() {
        let store = MemoryKeyedStore::new();
        let meta: Meta = [("timestamp".to_string(), "1".to_string())].into();
        store.save("pattern", "p", json!({}), Some(meta)).await.unwrap();
        store.save("pattern", "p", json!({ "v": 2 }), None).await.unwrap();

        assert_eq!(
            store.get_meta_value("pattern", "p", "timestamp").await.unwrap(),
            Some("1".to_string())
        );
        store.set_meta_value("pattern", "p", "timestamp", "2").await.unwrap();
        assert_eq!(
            store.get_meta_value("pattern", "p", "timestamp").await.unwrap(),
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn empty_set_is_removed_from_index() {
        let store = MemoryKeyedStore::new();
        assert_eq!(store.add_to_set("members", "t1", &ids(&["x", "y", "x"])).await.unwrap(), 2);
        assert_eq!(store.set_count("members", "t1").await.unwrap(), 2);
        assert_eq!(store.set_ids("members").await.unwrap(), ids(&["t1"]));

        assert_eq!(store.remove_from_set("members", "t1", &ids(&["x"])).await.unwrap(), 1);
        assert_eq!(store.set_ids("members").await.unwrap(), ids(&["t1"]));

        store.remove_from_set("members", "t1", &ids(&["y"])).await.unwrap();
        assert!(store.set_ids("members").await.unwrap().is_empty());
        assert!(store.retrieve_set("members", "t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_add_creates_no_set() {
        let store = MemoryKeyedStore::new();
        assert_eq!(store.add_to_set("members", "t1", &[]).await.unwrap(), 0);
        assert!(store.set_ids("members").await.unwrap().is_empty());
        assert!(store.state().unwrap().sets.is_empty());
    }

    #[tokio::test]
    async fn abandoned_lock_entries_are_purged() {
        let store = MemoryKeyedStore::new();
        assert!(store.try_lock("a", "one", Duration::from_millis(20)).await.unwrap());
        assert!(store.try_lock("b", "one", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.try_lock("c", "two", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.locks.len(), 1);
        assert!(store.locks.contains_key("c"));

        assert!(store.unlock("c", "two").await.unwrap());
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = MemoryKeyedStore::new();
        store.close().await.unwrap();
        assert!(matches!(store.exists("thred", "a").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn lock_entry_respects_token_and_expiry() {
        let store = MemoryKeyedStore::new();
        let ttl = Duration::from_millis(30);
        assert!(store.try_lock("k", "one", ttl).await.unwrap());
        assert!(!store.try_lock("k", "two", ttl).await.unwrap());
        assert!(!store.unlock("k", "two").await.unwrap());
        assert!(store.extend("k", "one", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.extend("k", "one", ttl).await.unwrap());
        assert!(store.try_lock("k", "two", ttl).await.unwrap());
        assert!(store.unlock("k", "two").await.unwrap());
        assert_eq!(store.held_locks(), 0);
    }
}
