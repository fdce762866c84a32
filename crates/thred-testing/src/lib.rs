//! Testing utilities for the thred engine.
//!
//! - [`RecordingSink`]: a [`MessageSink`] that keeps every outbound message
//! - [`IntervalRecorder`]: records enter/exit intervals of critical sections
//!   and reports overlaps
//! - [`FailingRecordStore`]: an in-memory record store whose writes to
//!   selected kinds fail
//! - [`fixtures`]: sample patterns and event builders
//! - [`memory_engine`]: an in-memory engine with a fast-retrying lock

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use thred::{
    Engine, EngineBuilder, EngineConfig, LockConfig, MemoryRecordStore, MessageSink, OutboundMessage,
    RecordStore, Storage, StoreError,
};
use tokio::time::Instant;

// ============================================================================
// Recording sink
// ============================================================================

/// Keeps every published message. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.lock().clone()
    }

    /// Drain the buffer.
    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Messages addressed to `participant_id`.
    pub fn sent_to(&self, participant_id: &str) -> Vec<OutboundMessage> {
        self.lock()
            .iter()
            .filter(|m| m.to.iter().any(|to| to == participant_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboundMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.lock().push(message);
        Ok(())
    }
}

// ============================================================================
// Interval recorder
// ============================================================================

/// Records `[enter, exit)` intervals of guarded sections.
#[derive(Debug, Clone, Default)]
pub struct IntervalRecorder {
    intervals: Arc<Mutex<Vec<(Instant, Instant)>>>,
}

/// An open interval; closed by [`RecordedSpan::exit`].
#[derive(Debug)]
pub struct RecordedSpan {
    recorder: IntervalRecorder,
    entered: Instant,
}

impl IntervalRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> RecordedSpan {
        RecordedSpan {
            recorder: self.clone(),
            entered: Instant::now(),
        }
    }

    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of adjacent interval pairs that overlap in time.
    pub fn overlaps(&self) -> usize {
        let mut intervals = self.intervals();
        intervals.sort_by_key(|(entered, _)| *entered);
        intervals
            .windows(2)
            .filter(|pair| pair[1].0 < pair[0].1)
            .count()
    }
}

impl RecordedSpan {
    pub fn exit(self) {
        let exited = Instant::now();
        self.recorder
            .intervals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.entered, exited));
    }
}

// ============================================================================
// Failing record store
// ============================================================================

/// Record store whose writes to the configured kinds fail with
/// [`StoreError::Unavailable`]. Reads and other kinds pass through.
#[derive(Debug, Default)]
pub struct FailingRecordStore {
    inner: MemoryRecordStore,
    failing: Mutex<HashSet<String>>,
}

impl FailingRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, kind: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string());
    }

    pub fn heal(&self, kind: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind);
    }

    fn check(&self, kind: &str) -> Result<(), StoreError> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(kind) {
            return Err(StoreError::Unavailable(format!("writes to {kind} are failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingRecordStore {
    async fn get(&self, kind: &str, matcher: &Value) -> Result<Vec<Value>, StoreError> {
        self.inner.get(kind, matcher).await
    }

    async fn put(&self, kind: &str, values: Value) -> Result<(), StoreError> {
        self.check(kind)?;
        self.inner.put(kind, values).await
    }

    async fn upsert(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.check(kind)?;
        self.inner.upsert(kind, matcher, values).await
    }

    async fn replace(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.check(kind)?;
        self.inner.replace(kind, matcher, values).await
    }

    async fn count(&self, kind: &str, matcher: &Value) -> Result<u64, StoreError> {
        self.inner.count(kind, matcher).await
    }
}

// ============================================================================
// Engines
// ============================================================================

/// Engine config whose lock retries quickly and often.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        lock: LockConfig {
            retry_count: 500,
            retry_delay_ms: 1,
            retry_jitter_ms: 3,
            ..LockConfig::default()
        },
        sweep_interval_ms: 20,
        ..EngineConfig::default()
    }
}

/// Unstarted in-memory engine publishing to `sink`.
pub fn memory_engine(sink: RecordingSink) -> Engine {
    EngineBuilder::in_memory(fast_config()).with_sink(sink).build()
}

/// Unstarted engine over in-memory storage and the given record store.
pub fn engine_with_records(sink: RecordingSink, records: Arc<dyn RecordStore>) -> Engine {
    let config = fast_config();
    let storage = Arc::new(Storage::in_memory(config.lock.clone()));
    EngineBuilder::new(storage, records)
        .with_config(config)
        .with_sink(sink)
        .build()
}

// ============================================================================
// Fixtures
// ============================================================================

pub mod fixtures {
    use std::time::Duration;

    use serde_json::json;
    use thred::{Condition, Event, EventSource, PatternModel, Reaction, Transition};

    pub fn participant(id: &str) -> EventSource {
        EventSource::new(id, id)
    }

    /// Unbound event of `event_type` from `source`.
    pub fn event(event_type: &str, source: &str) -> Event {
        Event::new(event_type, participant(source))
    }

    /// Event of `event_type` from `source` bound to `thred_id`.
    pub fn reply(event_type: &str, source: &str, thred_id: &str) -> Event {
        event(event_type, source).with_thred(thred_id)
    }

    /// `ping` from anyone starts a thred and answers `pong` to every
    /// participant; the next `ping` answers again and ends the thred.
    pub fn ping_pong() -> PatternModel {
        let pong = || {
            Condition::filter(r#"event.type == "ping""#)
                .with_transform(json!({
                    "title": "pong",
                    "content": { "values": { "to": "$xpr(event.source.id)" } }
                }))
                .publish_to(["$thred"])
        };
        PatternModel::new(
            "ping-pong",
            "Ping Pong",
            vec![
                Reaction::new("serve", pong().with_transition(Transition::next())),
                Reaction::new("return", pong().with_transition(Transition::terminate())),
            ],
        )
    }

    /// A single reaction that accepts `keepalive` events without moving.
    /// The reaction expires `interval` after the thred started, however many
    /// keepalives arrive, and the expiry terminates the thred.
    pub fn keepalive(interval: Duration) -> PatternModel {
        PatternModel::new(
            "keepalive",
            "Keepalive",
            vec![Reaction::new("alive", Condition::filter(r#"event.type == "keepalive""#))
                .expires_after(interval, None)],
        )
    }
}
