//! Event dispatcher: the single entry point for inbound events.
//!
//! ```text
//!                    ┌─────────────┐
//!   Event ─────────► │ Dispatcher  │
//!                    └──────┬──────┘
//!             thredId? ─────┴───── none
//!                │                   │
//!     with_thred(id)        patterns in cache order
//!                │          first match ─► with_new_thred
//!                ▼                   ▼
//!        Thred::consider ──► publications ──► AddressResolver ──► MessageSink
//! ```
//!
//! Publications are handed to the sink while the thred lock is still held,
//! so outbound messages of one thred leave in the order its events were
//! processed. A failed hand-off fails the whole consideration and nothing
//! about the thred is persisted.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::delivery::{AddressResolver, MessageSink, OutboundMessage};
use crate::directory::ThredDirectory;
use crate::error::{Result, ThredError};
use crate::event::{Event, EventSource};
use crate::expression::ExpressionEvaluator;
use crate::pattern::Pattern;
use crate::patterns::PatternCache;
use crate::records::AuditLog;
use crate::thred::{Publication, Thred, ThredStatus};

/// What happened to a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Routed to an existing thred.
    Bound {
        thred_id: String,
        status: ThredStatus,
        matched: bool,
    },
    /// Matched a pattern and started a new thred.
    Started {
        thred_id: String,
        pattern_id: String,
        status: ThredStatus,
    },
    /// Unbound and no pattern matched.
    Unmatched,
}

impl Dispatch {
    pub fn thred_id(&self) -> Option<&str> {
        match self {
            Self::Bound { thred_id, .. } | Self::Started { thred_id, .. } => Some(thred_id),
            Self::Unmatched => None,
        }
    }
}

pub struct Dispatcher {
    directory: Arc<ThredDirectory>,
    patterns: Arc<PatternCache>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    resolver: Arc<dyn AddressResolver>,
    sink: Arc<dyn MessageSink>,
    audit: AuditLog,
    source: EventSource,
    max_forward_hops: u32,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<ThredDirectory>,
        patterns: Arc<PatternCache>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        resolver: Arc<dyn AddressResolver>,
        sink: Arc<dyn MessageSink>,
        audit: AuditLog,
        source: EventSource,
        max_forward_hops: u32,
    ) -> Self {
        Self {
            directory,
            patterns,
            evaluator,
            resolver,
            sink,
            audit,
            source,
            max_forward_hops,
        }
    }

    /// Route one event.
    pub async fn consider(&self, event: &Event) -> Result<Dispatch> {
        debug!(event_id = %event.id, event_type = %event.event_type, source = %event.source.id, "considering event");
        self.audit.event(event, None).await;

        match event.thred_id.as_deref() {
            Some(thred_id) => self.consider_bound(thred_id, event).await,
            None => self.consider_unbound(event).await,
        }
    }

    async fn consider_bound(&self, thred_id: &str, event: &Event) -> Result<Dispatch> {
        let outcome = self
            .directory
            .with_thred(thred_id, |thred| async move {
                let Some(mut thred) = thred else {
                    return Ok((None, None));
                };
                let matched = self.handle_bound(&mut thred, event).await?;
                let status = thred.status();
                Ok((Some(thred), Some((status, matched))))
            })
            .await?;

        match outcome {
            Some((status, matched)) => Ok(Dispatch::Bound {
                thred_id: thred_id.to_string(),
                status,
                matched,
            }),
            None => {
                warn!(event_id = %event.id, thred_id, "event for unknown thred");
                self.audit.no_thred(event).await;
                Err(ThredError::ThredNotFound {
                    thred_id: thred_id.to_string(),
                })
            }
        }
    }

    async fn handle_bound(&self, thred: &mut Thred, event: &Event) -> Result<bool> {
        if event.is_error() && !thred.context().is_participant(&event.source.id) {
            return Err(ThredError::Unauthorized(format!(
                "{} may not send errors to thred {}",
                event.source.id,
                thred.id()
            )));
        }

        if event.is_broadcast() {
            let publication = thred.broadcast(event, &self.source)?;
            self.deliver(thred, vec![publication]).await?;
            return Ok(true);
        }

        self.react(thred, event).await
    }

    async fn react(&self, thred: &mut Thred, event: &Event) -> Result<bool> {
        let now = Utc::now();
        if thred.expire(now)? {
            info!(thred_id = %thred.id(), "reaction expired before event");
        }

        let consideration = thred
            .consider(event, self.evaluator.as_ref(), &self.source, self.max_forward_hops, now)
            .await?;
        self.deliver(thred, consideration.publications).await?;

        debug!(
            thred_id = %thred.id(),
            matched = consideration.matched,
            reaction = ?thred.current_reaction_name(),
            status = ?thred.status(),
            "event considered"
        );
        Ok(consideration.matched)
    }

    async fn consider_unbound(&self, event: &Event) -> Result<Dispatch> {
        let mut first_error = None;

        for pattern in self.patterns.patterns() {
            match pattern.matches(event, self.evaluator.as_ref()).await {
                Ok(false) => {}
                Ok(true) => return self.start(pattern, event).await,
                Err(err) => {
                    error!(pattern_id = %pattern.id(), event_id = %event.id, error = %err, "pattern failed to apply");
                    let message = err.to_string();
                    self.audit.pattern_error(event, pattern.id(), &message).await;
                    first_error.get_or_insert(ThredError::PatternApplication {
                        pattern_id: pattern.id().to_string(),
                        event_id: event.id.clone(),
                        message,
                    });
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        warn!(event_id = %event.id, event_type = %event.event_type, "no pattern matched event");
        self.audit.no_pattern_match(event).await;
        Ok(Dispatch::Unmatched)
    }

    async fn start(&self, pattern: Arc<Pattern>, event: &Event) -> Result<Dispatch> {
        let pattern_id = pattern.id().to_string();
        let (thred_id, status) = self
            .directory
            .with_new_thred(pattern, |mut thred| async move {
                self.react(&mut thred, event).await?;
                let started = (thred.id().to_string(), thred.status());
                Ok((Some(thred), started))
            })
            .await?;

        Ok(Dispatch::Started {
            thred_id,
            pattern_id,
            status,
        })
    }

    async fn deliver(&self, thred: &Thred, publications: Vec<Publication>) -> Result<()> {
        for publication in publications {
            let to = self
                .resolver
                .participant_ids_for(&publication.to, thred.context())
                .await
                .map_err(ThredError::Delivery)?;
            if to.is_empty() {
                debug!(thred_id = %thred.id(), event_id = %publication.event.id, "publication has no recipients");
                continue;
            }
            debug!(thred_id = %thred.id(), event_id = %publication.event.id, recipients = to.len(), "publishing");
            self.sink
                .publish(OutboundMessage {
                    event: publication.event,
                    to,
                })
                .await
                .map_err(ThredError::Delivery)?;
        }
        Ok(())
    }
}
