//! Keyed store: objects, sets, metadata and distributed locks.
//!
//! Backends implement [`KeyedStore`] (data) and [`LockNode`] (one lock
//! replica). [`Storage`] puts them together: it is the only component that
//! requires strict consistency, and every mutation of thred or pattern state
//! goes through one of its lock-scoped entry points.
//!
//! ```text
//! Storage
//!   ├─ KeyedStore   objects {kind,id} + meta, type index, sets + set index
//!   └─ Redlock      N LockNode replicas, majority quorum, ttl + drift
//! ```
//!
//! Index maintenance: saving an object adds its id to the type index and
//! deleting it removes the id. Adding to a set registers the set id in the
//! set index; a set that becomes empty is deleted and unregistered. Both
//! indexes make "all ids of a kind" a lookup instead of a scan.

mod lock;
mod memory;
mod storage;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

pub use lock::{Lock, LockGuard, LockNode, Redlock};
pub use memory::MemoryKeyedStore;
pub use storage::Storage;

/// String metadata attached to an object.
pub type Meta = BTreeMap<String, String>;

/// Record kinds used by the engine.
pub mod kinds {
    pub const THRED: &str = "thred";
    pub const PATTERN: &str = "pattern";
}

/// A lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub kind: String,
    pub id: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn thred(id: impl Into<String>) -> Self {
        Self::new(kinds::THRED, id)
    }

    pub fn pattern(id: impl Into<String>) -> Self {
        Self::new(kinds::PATTERN, id)
    }

    /// Key of this resource's lock entry.
    pub fn lock_key(&self) -> String {
        format!("lock:{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Data side of the keyed store, keyed by `{kind, id}`.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Create or overwrite an object; meta keys given here replace existing ones.
    async fn save(&self, kind: &str, id: &str, value: Value, meta: Option<Meta>) -> Result<(), StoreError>;

    async fn retrieve(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Objects for `ids`, skipping ids that do not exist.
    async fn retrieve_all(&self, kind: &str, ids: &[String]) -> Result<Vec<Value>, StoreError>;

    /// Returns true if the object existed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;

    async fn exists(&self, kind: &str, id: &str) -> Result<bool, StoreError>;

    /// Ids of every stored object of `kind`.
    async fn type_ids(&self, kind: &str) -> Result<Vec<String>, StoreError>;

    /// No-op when the object does not exist.
    async fn set_meta_value(&self, kind: &str, id: &str, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get_meta_value(&self, kind: &str, id: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns how many members were newly added.
    async fn add_to_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError>;

    /// Returns how many members were removed.
    async fn remove_from_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn retrieve_set(&self, kind: &str, id: &str) -> Result<Vec<String>, StoreError>;

    async fn set_count(&self, kind: &str, id: &str) -> Result<u64, StoreError>;

    /// Ids of every non-empty set of `kind`.
    async fn set_ids(&self, kind: &str) -> Result<Vec<String>, StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
