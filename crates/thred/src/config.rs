//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ThredError;
use crate::event::EventSource;

/// Distributed lock tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock time-to-live. A lock that is never released expires after this.
    pub ttl_ms: u64,
    /// Acquisition attempts before giving up with a lock-acquisition error.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub retry_jitter_ms: u64,
    /// Fraction of the ttl reserved for clock drift between lock replicas.
    pub drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 200,
            drift_factor: 0.01,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay before the next attempt: the fixed delay plus `[0, jitter]`.
    pub fn next_delay(&self) -> Duration {
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=self.retry_jitter_ms)
        };
        Duration::from_millis(self.retry_delay_ms + jitter)
    }

    /// Drift allowance for a given ttl (redlock: `ttl * factor + 2ms`).
    pub fn drift(&self, ttl: Duration) -> Duration {
        let drift_ms = (ttl.as_millis() as f64 * self.drift_factor).round() as u64 + 2;
        Duration::from_millis(drift_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockConfig,
    /// Source stamped on every outbound event.
    pub source: EventSource,
    pub sweep_interval_ms: u64,
    /// Attempts to delete a finished thred from the keyed store after archival.
    pub cleanup_retries: u32,
    /// Bound on `forward` transition chains for a single event.
    pub max_forward_hops: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            source: EventSource::new("thred-engine", "Thred Engine"),
            sweep_interval_ms: 10_000,
            cleanup_retries: 2,
            max_forward_hops: 16,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject settings the engine cannot run with. Called by `Engine::start`.
    pub fn validate(&self) -> Result<(), ThredError> {
        if self.sweep_interval_ms == 0 {
            return Err(ThredError::ArgumentValidation(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.lock.ttl_ms == 0 {
            return Err(ThredError::ArgumentValidation("lock.ttl_ms must be greater than zero".into()));
        }
        Ok(())
    }
}
