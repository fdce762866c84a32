//! Durable record store seam and the audit log on top of it.
//!
//! The record store is an external collaborator: archival of finished
//! threds, the active-pattern catalogue, and audit records. Matchers are JSON
//! objects; a record matches when every top-level matcher field is equal.
//!
//! Audit writes are best-effort: [`AuditLog`] logs failures and never
//! returns them, so a record-store hiccup cannot stall event processing.
//! Archival of threds, on the other hand, goes through the record store
//! directly and propagates errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::StoreError;
use crate::event::Event;

pub mod kinds {
    pub const PATTERN: &str = "pattern";
    pub const THRED: &str = "thred";
    pub const EVENT: &str = "event";
    pub const THRED_LOG: &str = "thred_log";
}

/// Audit record types written under [`kinds::THRED_LOG`].
pub mod log_types {
    pub const NO_THRED: &str = "no_thred";
    pub const NO_PATTERN_MATCH: &str = "no_pattern_match";
    pub const PATTERN_ERROR: &str = "pattern_error";
    pub const THRED_ARCHIVED: &str = "thred_archived";
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, kind: &str, matcher: &Value) -> Result<Vec<Value>, StoreError>;

    async fn get_one(&self, kind: &str, matcher: &Value) -> Result<Option<Value>, StoreError> {
        Ok(self.get(kind, matcher).await?.into_iter().next())
    }

    async fn put(&self, kind: &str, values: Value) -> Result<(), StoreError>;

    /// Merge `values` into every matching record, or insert them.
    async fn upsert(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError>;

    /// Overwrite every matching record with `values`, or insert them.
    async fn replace(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError>;

    async fn count(&self, kind: &str, matcher: &Value) -> Result<u64, StoreError>;
}

/// True when every field of `matcher` equals the same field of `record`.
pub fn matches(record: &Value, matcher: &Value) -> bool {
    match matcher.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| record.get(k) == Some(v)),
        None => matcher.is_null(),
    }
}

fn merge(target: &mut Value, values: Value) {
    match (target, values) {
        (Value::Object(fields), Value::Object(update)) => fields.extend(update),
        (target, values) => *target = values,
    }
}

/// Record store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Value>>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::backend(e.to_string()))
    }

    fn write(&self, kind: &str, matcher: &Value, values: Value, merge_fields: bool) -> Result<(), StoreError> {
        let mut records = self.records()?;
        let rows = records.entry(kind.to_string()).or_default();
        let mut hit = false;
        for row in rows.iter_mut().filter(|r| matches(r, matcher)) {
            hit = true;
            if merge_fields {
                merge(row, values.clone());
            } else {
                *row = values.clone();
            }
        }
        if !hit {
            rows.push(values);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, kind: &str, matcher: &Value) -> Result<Vec<Value>, StoreError> {
        let records = self.records()?;
        Ok(records
            .get(kind)
            .map(|rows| rows.iter().filter(|r| matches(r, matcher)).cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, kind: &str, values: Value) -> Result<(), StoreError> {
        self.records()?.entry(kind.to_string()).or_default().push(values);
        Ok(())
    }

    async fn upsert(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.write(kind, matcher, values, true)
    }

    async fn replace(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.write(kind, matcher, values, false)
    }

    async fn count(&self, kind: &str, matcher: &Value) -> Result<u64, StoreError> {
        Ok(self.get(kind, matcher).await?.len() as u64)
    }
}

/// Best-effort audit writer.
#[derive(Clone)]
pub struct AuditLog {
    records: Arc<dyn RecordStore>,
}

impl AuditLog {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub async fn event(&self, event: &Event, thred_id: Option<&str>) {
        let record = json!({
            "id": event.id,
            "thredId": thred_id.or(event.thred_id.as_deref()),
            "timestamp": Utc::now(),
            "event": event,
        });
        if let Err(err) = self.records.upsert(kinds::EVENT, &json!({ "id": event.id }), record).await {
            warn!(event_id = %event.id, error = %err, "failed to record event");
        }
    }

    pub async fn no_thred(&self, event: &Event) {
        self.log(log_types::NO_THRED, event, None, None).await;
    }

    pub async fn no_pattern_match(&self, event: &Event) {
        self.log(log_types::NO_PATTERN_MATCH, event, None, None).await;
    }

    pub async fn pattern_error(&self, event: &Event, pattern_id: &str, message: &str) {
        self.log(log_types::PATTERN_ERROR, event, Some(pattern_id), Some(message))
            .await;
    }

    pub async fn thred_archived(&self, thred_id: &str, pattern_id: &str) {
        let record = json!({
            "type": log_types::THRED_ARCHIVED,
            "thredId": thred_id,
            "patternId": pattern_id,
            "timestamp": Utc::now(),
        });
        self.write(record).await;
    }

    async fn log(&self, log_type: &str, event: &Event, pattern_id: Option<&str>, message: Option<&str>) {
        let record = json!({
            "type": log_type,
            "eventId": event.id,
            "eventType": event.event_type,
            "sourceId": event.source.id,
            "thredId": event.thred_id,
            "patternId": pattern_id,
            "message": message,
            "timestamp": Utc::now(),
        });
        self.write(record).await;
    }

    async fn write(&self, record: Value) {
        if let Err(err) = self.records.put(kinds::THRED_LOG, record).await {
            warn!(error = %err, "failed to write audit record");
        }
    }
}
