//! Thred directory: lock-scoped access to thred state.
//!
//! Every read-modify-write of a thred goes through [`ThredDirectory::with_thred`]
//! or [`ThredDirectory::with_new_thred`]:
//!
//! ```text
//! claim lock(thred:id)
//!   load state from keyed store ──► Thred (or None)
//!   op(thred) ──► (Option<Thred>, T)
//!   Active   ──► save state to keyed store
//!   ended    ──► archive to record store, delete from keyed store
//! release lock
//! ```
//!
//! Locks are not reentrant: an `op` must never call back into the directory
//! for the same id.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keyed_store::{kinds, Resource, Storage};
use crate::pattern::Pattern;
use crate::patterns::PatternCache;
use crate::records::{self, AuditLog, RecordStore};
use crate::thred::{Thred, ThredState};

pub struct ThredDirectory {
    storage: Arc<Storage>,
    patterns: Arc<PatternCache>,
    records: Arc<dyn RecordStore>,
    audit: AuditLog,
    cleanup_retries: u32,
}

impl ThredDirectory {
    pub fn new(
        storage: Arc<Storage>,
        patterns: Arc<PatternCache>,
        records: Arc<dyn RecordStore>,
        cleanup_retries: u32,
    ) -> Self {
        Self {
            audit: AuditLog::new(Arc::clone(&records)),
            storage,
            patterns,
            records,
            cleanup_retries,
        }
    }

    /// Lock `id`, load it, run `op`, then persist or archive whatever thred
    /// `op` hands back. `op` receives `None` when the thred does not exist.
    /// The lock is released on every path; if `op` fails nothing is written.
    pub async fn with_thred<T, F, Fut>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce(Option<Thred>) -> Fut,
        Fut: Future<Output = Result<(Option<Thred>, T)>>,
    {
        let guard = self.storage.claim(&[Resource::thred(id)]).await?;
        let outcome: Result<T> = async {
            let thred = self.load(id).await?;
            let (thred, value) = op(thred).await?;
            if let Some(thred) = thred {
                self.persist_or_archive(&thred).await?;
            }
            Ok(value)
        }
        .await;
        guard.release().await;
        outcome
    }

    /// Mint an id for a new thred of `pattern`, lock it, write the initial
    /// snapshot, then proceed as [`with_thred`](Self::with_thred). The
    /// snapshot is visible in the keyed store even if `op` fails.
    pub async fn with_new_thred<T, F, Fut>(&self, pattern: Arc<Pattern>, op: F) -> Result<T>
    where
        F: FnOnce(Thred) -> Fut,
        Fut: Future<Output = Result<(Option<Thred>, T)>>,
    {
        let id = Thred::new_id(pattern.id());
        let thred = Thred::new(id.clone(), pattern, Utc::now());
        let guard = self
            .storage
            .save_and_claim(kinds::THRED, &id, &thred.state(), None)
            .await?;
        info!(thred_id = %id, pattern_id = %thred.pattern().id(), "thred started");

        let outcome: Result<T> = async {
            let (thred, value) = op(thred).await?;
            if let Some(thred) = thred {
                self.persist_or_archive(&thred).await?;
            }
            Ok(value)
        }
        .await;
        guard.release().await;
        outcome
    }

    /// Terminate and archive every known thred. Each id is handled
    /// independently; failures are logged and skipped. Returns how many
    /// threds were terminated.
    pub async fn terminate_all_threds(&self) -> Result<usize> {
        let ids = self.thred_ids().await?;
        let results = join_all(ids.iter().map(|id| self.terminate_thred(id))).await;

        let mut terminated = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(true) => terminated += 1,
                Ok(false) => {}
                Err(err) => warn!(thred_id = %id, error = %err, "failed to terminate thred"),
            }
        }
        info!(terminated, total = ids.len(), "terminated all threds");
        Ok(terminated)
    }

    /// Returns false when the thred did not exist.
    pub async fn terminate_thred(&self, id: &str) -> Result<bool> {
        self.with_thred(id, |thred| async move {
            Ok(match thred {
                Some(mut thred) => {
                    thred.terminate(Utc::now());
                    (Some(thred), true)
                }
                None => (None, false),
            })
        })
        .await
    }

    /// Apply due reaction expiries to every thred. Per-id failures are
    /// logged. Returns how many threds had an expiry applied.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids = self.thred_ids().await?;
        let mut expired = 0;
        for id in &ids {
            let applied = self
                .with_thred(id, |thred| async move {
                    let Some(mut thred) = thred else {
                        return Ok((None, false));
                    };
                    if thred.expire(now)? {
                        Ok((Some(thred), true))
                    } else {
                        Ok((None, false))
                    }
                })
                .await;
            match applied {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => warn!(thred_id = %id, error = %err, "expiry sweep failed"),
            }
        }
        if expired > 0 {
            info!(expired, "expired reactions applied");
        }
        Ok(expired)
    }

    pub async fn thred_ids(&self) -> Result<Vec<String>> {
        self.storage.type_ids(kinds::THRED).await
    }

    /// Unlocked read of a stored thred, for inspection only.
    pub async fn snapshot(&self, id: &str) -> Result<Option<ThredState>> {
        self.storage.retrieve(kinds::THRED, id).await
    }

    async fn load(&self, id: &str) -> Result<Option<Thred>> {
        let Some(state) = self.storage.retrieve::<ThredState>(kinds::THRED, id).await? else {
            return Ok(None);
        };

        if !state.status.is_active() {
            // Archived already; a previous cleanup delete did not go through.
            debug!(thred_id = %id, "removing ended thred left in keyed store");
            self.storage.delete(kinds::THRED, id).await?;
            return Ok(None);
        }

        if self.patterns.get(&state.pattern_id).is_none() {
            self.patterns.load_pattern(&state.pattern_id).await?;
        } else if let Err(err) = self.patterns.stale_check(&state.pattern_id).await {
            warn!(pattern_id = %state.pattern_id, error = %err, "stale check failed, using cached pattern");
        }

        Thred::from_state(state, |pattern_id| self.patterns.get(pattern_id)).map(Some)
    }

    async fn persist_or_archive(&self, thred: &Thred) -> Result<()> {
        let state = thred.state();
        if state.status.is_active() {
            return self.storage.save(kinds::THRED, &state.id, &state, None).await;
        }

        self.records
            .upsert(
                records::kinds::THRED,
                &json!({ "id": state.id }),
                serde_json::to_value(&state)?,
            )
            .await?;
        self.audit.thred_archived(&state.id, &state.pattern_id).await;
        info!(thred_id = %state.id, status = ?state.status, "thred archived");

        for attempt in 0..=self.cleanup_retries {
            match self.storage.delete(kinds::THRED, &state.id).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(thred_id = %state.id, attempt, error = %err, "failed to remove archived thred")
                }
            }
        }
        warn!(thred_id = %state.id, "archived thred left in keyed store until next load");
        Ok(())
    }
}
