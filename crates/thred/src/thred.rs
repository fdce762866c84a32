//! The thred state machine.
//!
//! A [`Thred`] is the live state of one conversation started by a pattern
//! match. Everything here is pure: no storage, no delivery. The directory
//! loads and persists it under the thred's lock; the dispatcher feeds it
//! events and delivers what it asks to publish.
//!
//! ```text
//! Active ──transition_to(Some(r))──► Active
//! Active ──transition_to(None)─────► Finished    (pattern allows broadcast)
//!                                  └► Terminated (otherwise)
//! any    ──terminate()─────────────► Terminated
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ThredContext;
use crate::error::{Result, ThredError};
use crate::event::{Event, EventData, EventSource, BROADCAST_EVENT_TYPE, REACTION_EVENT_TYPE};
use crate::expression::{ExpressionEvaluator, ExpressionScope};
use crate::pattern::Pattern;
use crate::reaction::{Reaction, Transition, TransitionInput, TransitionTarget, THRED_SCOPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThredStatus {
    Active,
    Finished,
    Terminated,
}

impl ThredStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThredMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Current reaction and when it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionStore {
    pub reaction_name: Option<String>,
    pub entered_at: DateTime<Utc>,
}

/// Plain, storable form of a [`Thred`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThredState {
    pub id: String,
    pub pattern_id: String,
    pub context: ThredContext,
    pub reaction: ReactionStore,
    pub status: ThredStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub meta: ThredMeta,
}

/// A message a reaction wants delivered. `to` holds participant ids and
/// unresolved address tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub event: Event,
    pub to: Vec<String>,
}

/// Result of considering one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consideration {
    /// Some reaction's condition fired.
    pub matched: bool,
    pub publications: Vec<Publication>,
}

#[derive(Debug, Clone)]
pub struct Thred {
    id: String,
    pattern: Arc<Pattern>,
    context: ThredContext,
    current: Option<String>,
    entered_at: DateTime<Utc>,
    status: ThredStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    meta: ThredMeta,
}

impl Thred {
    /// Mint an id for a new thred of `pattern_id`.
    pub fn new_id(pattern_id: &str) -> String {
        format!("{pattern_id}_{}", Uuid::new_v4().simple())
    }

    /// A fresh thred positioned at the pattern's initial reaction.
    pub fn new(id: impl Into<String>, pattern: Arc<Pattern>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        let meta = ThredMeta {
            label: Some(pattern.name().to_string()),
            description: pattern.model().description.clone(),
            uri: None,
        };
        Self {
            context: ThredContext::new(id.clone()),
            current: Some(pattern.initial_reaction().name.clone()),
            entered_at: now,
            status: ThredStatus::Active,
            started_at: now,
            ended_at: None,
            last_updated: now,
            id,
            pattern,
            meta,
        }
    }

    /// Rebuild from storage. `lookup` resolves the pattern id against the
    /// pattern cache.
    pub fn from_state<F>(state: ThredState, lookup: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Option<Arc<Pattern>>,
    {
        let pattern = lookup(&state.pattern_id).ok_or_else(|| ThredError::PatternNotLoaded {
            pattern_id: state.pattern_id.clone(),
        })?;

        if let Some(name) = &state.reaction.reaction_name {
            if pattern.reaction(name).is_none() {
                return Err(ThredError::UnknownReaction {
                    pattern_id: state.pattern_id,
                    reaction: name.clone(),
                });
            }
        }

        Ok(Self {
            id: state.id,
            pattern,
            context: state.context,
            current: state.reaction.reaction_name,
            entered_at: state.reaction.entered_at,
            status: state.status,
            started_at: state.started_at,
            ended_at: state.ended_at,
            last_updated: state.last_updated,
            meta: state.meta,
        })
    }

    pub fn state(&self) -> ThredState {
        ThredState {
            id: self.id.clone(),
            pattern_id: self.pattern.id().to_string(),
            context: self.context.clone(),
            reaction: ReactionStore {
                reaction_name: self.current.clone(),
                entered_at: self.entered_at,
            },
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_updated: self.last_updated,
            meta: self.meta.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn status(&self) -> ThredStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn current_reaction_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_reaction(&self) -> Option<&Reaction> {
        self.current.as_deref().and_then(|name| self.pattern.reaction(name))
    }

    pub fn context(&self) -> &ThredContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ThredContext {
        &mut self.context
    }

    pub fn meta(&self) -> &ThredMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ThredMeta {
        &mut self.meta
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn reaction_entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Move to `next`. A no-op when `next` is the current reaction. `None`
    /// ends the thred: `Finished` when the pattern allows broadcast (so
    /// broadcasts can still reach participants), `Terminated` otherwise.
    pub fn transition_to(&mut self, next: Option<String>, now: DateTime<Utc>) {
        if next == self.current {
            return;
        }
        debug!(thred_id = %self.id, from = ?self.current, to = ?next, "transition");
        self.entered_at = now;
        self.last_updated = now;
        if next.is_none() {
            self.status = if self.pattern.broadcast_allowed() {
                ThredStatus::Finished
            } else {
                ThredStatus::Terminated
            };
            self.ended_at = Some(now);
        }
        self.current = next;
    }

    /// End normally (see [`transition_to`](Self::transition_to)).
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.transition_to(None, now);
    }

    /// End and force `Terminated` regardless of the pattern's flags.
    pub fn terminate(&mut self, now: DateTime<Utc>) {
        self.finish(now);
        self.status = ThredStatus::Terminated;
        self.last_updated = now;
    }

    /// True when the current reaction declares an expiry and it has elapsed.
    pub fn reaction_timed_out(&self, now: DateTime<Utc>) -> bool {
        let Some(expiry) = self.current_reaction().and_then(|r| r.expiry.as_ref()) else {
            return false;
        };
        chrono::Duration::from_std(expiry.interval())
            .map(|limit| now - self.entered_at > limit)
            .unwrap_or(false)
    }

    /// Apply the current reaction's expiry transition if it is due.
    /// Returns whether it was applied.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.is_active() || !self.reaction_timed_out(now) {
            return Ok(false);
        }
        let transition = match self.current_reaction().and_then(|r| r.expiry.as_ref()) {
            Some(expiry) => expiry.transition(),
            None => return Ok(false),
        };
        let next = self.resolve(&transition)?;
        debug!(thred_id = %self.id, reaction = ?self.current, "reaction expired");
        self.transition_to(next, now);
        Ok(true)
    }

    fn resolve(&self, transition: &Transition) -> Result<Option<String>> {
        Ok(match &transition.name {
            TransitionTarget::Terminate => None,
            TransitionTarget::Next => self
                .current
                .as_deref()
                .and_then(|name| self.pattern.reaction_after(name))
                .map(|r| r.name.clone()),
            TransitionTarget::Reaction(name) => {
                if self.pattern.reaction(name).is_none() {
                    return Err(ThredError::UnknownReaction {
                        pattern_id: self.pattern.id().to_string(),
                        reaction: name.clone(),
                    });
                }
                Some(name.clone())
            }
        })
    }

    /// Run `event` through the current reaction.
    ///
    /// On a match: queue a publication if the condition publishes, then
    /// apply its transition. A `forward` transition re-considers the same
    /// event in the next reaction, up to `max_hops` times.
    pub async fn consider(
        &mut self,
        event: &Event,
        evaluator: &dyn ExpressionEvaluator,
        engine: &EventSource,
        max_hops: u32,
        now: DateTime<Utc>,
    ) -> Result<Consideration> {
        let mut outcome = Consideration::default();
        if !self.is_active() {
            debug!(thred_id = %self.id, status = ?self.status, "ignoring event for ended thred");
            return Ok(outcome);
        }

        if event.source.id != engine.id {
            self.context.add_participant(event.source.id.clone());
        }
        self.last_updated = now;

        let pattern = Arc::clone(&self.pattern);
        for hop in 0..=max_hops {
            let Some(reaction) = self.current.as_deref().and_then(|name| pattern.reaction(name)) else {
                break;
            };
            let scope = ExpressionScope::new(event, &self.context);
            let Some(matched) = reaction.condition.apply(scope, evaluator).await? else {
                break;
            };
            outcome.matched = true;

            if let Some(publish) = matched.publish {
                let data = match matched.data {
                    Some(rendered) => Some(serde_json::from_value::<EventData>(rendered).map_err(|e| {
                        ThredError::ArgumentValidation(format!(
                            "reaction {} produced invalid event data: {e}",
                            reaction.name
                        ))
                    })?),
                    None => event.data.clone(),
                };
                outcome
                    .publications
                    .push(self.publication(REACTION_EVENT_TYPE, event, data, publish.to, engine));
            }

            let Some(transition) = matched.transition else {
                break;
            };
            let next = self.resolve(&transition)?;
            if transition.input == TransitionInput::Local {
                let name = transition.local_name.clone().ok_or_else(|| {
                    ThredError::MissingArgument(format!(
                        "local transition from {} has no local name",
                        reaction.name
                    ))
                })?;
                self.context.set_local(name, serde_json::to_value(event)?);
            }
            self.transition_to(next, now);

            if transition.input != TransitionInput::Forward || !self.is_active() {
                break;
            }
            if hop == max_hops {
                warn!(thred_id = %self.id, max_hops, "forward chain cut short");
            }
        }

        if outcome.matched && self.pattern.echo_responses() && event.source.id != engine.id {
            let others: Vec<String> = self
                .context
                .participants()
                .filter(|p| *p != event.source.id)
                .map(str::to_string)
                .collect();
            if !others.is_empty() {
                let echo = self.publication(&event.event_type, event, event.data.clone(), others, engine);
                outcome.publications.push(echo);
            }
        }

        Ok(outcome)
    }

    /// Relay a participant's broadcast to every participant.
    pub fn broadcast(&self, event: &Event, engine: &EventSource) -> Result<Publication> {
        if !self.pattern.broadcast_allowed() {
            return Err(ThredError::Unauthorized(format!(
                "pattern {} does not allow broadcast",
                self.pattern.id()
            )));
        }
        if !self.context.is_participant(&event.source.id) {
            return Err(ThredError::Unauthorized(format!(
                "{} is not a participant of thred {}",
                event.source.id, self.id
            )));
        }
        let message = event
            .value("message")
            .cloned()
            .ok_or_else(|| ThredError::MissingArgument("broadcast requires a `message` value".into()))?;

        let data = EventData {
            content: Some(crate::event::Content {
                values: Some(json!({ "message": message, "from": event.source.id })),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(self.publication(BROADCAST_EVENT_TYPE, event, Some(data), vec![THRED_SCOPE.to_string()], engine))
    }

    fn publication(
        &self,
        event_type: &str,
        cause: &Event,
        data: Option<EventData>,
        to: Vec<String>,
        engine: &EventSource,
    ) -> Publication {
        let mut event = Event::new(event_type, engine.clone())
            .with_thred(self.id.clone())
            .with_re(cause.id.clone());
        event.data = data;
        Publication { event, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::BasicEvaluator;
    use crate::pattern::PatternModel;
    use crate::reaction::Condition;
    use chrono::Duration;
    use serde_json::json;

    fn engine() -> EventSource {
        EventSource::new("engine", "Engine")
    }

    fn pattern(broadcast_allowed: bool) -> Arc<Pattern> {
        let model = PatternModel::new(
            "p",
            "Ping",
            vec![
                Reaction::new(
                    "start",
                    Condition::filter(r#"event.type == "ping""#)
                        .publish_to(["$thred"])
                        .with_transition(Transition::to("ack")),
                ),
                Reaction::new(
                    "ack",
                    Condition::filter(r#"event.type == "ack""#).with_transition(Transition::next()),
                )
                .expires_after(std::time::Duration::from_secs(60), None),
            ],
        )
        .broadcast_allowed(broadcast_allowed);
        Arc::new(Pattern::compile(model).unwrap())
    }

    fn from(kind: &str, who: &str) -> Event {
        Event::new(kind, EventSource::new(who, who))
    }

    #[tokio::test]
    async fn walks_reactions_and_terminates_without_broadcast() {
        let now = Utc::now();
        let mut thred = Thred::new("p_1", pattern(false), now);
        assert_eq!(thred.current_reaction_name(), Some("start"));

        let out = thred
            .consider(&from("ping", "alice"), &BasicEvaluator::new(), &engine(), 4, now)
            .await
            .unwrap();
        assert!(out.matched);
        assert_eq!(out.publications.len(), 1);
        assert_eq!(out.publications[0].to, vec!["$thred".to_string()]);
        assert_eq!(out.publications[0].event.thred_id.as_deref(), Some("p_1"));
        assert_eq!(thred.current_reaction_name(), Some("ack"));
        assert!(thred.context().is_participant("alice"));

        thred
            .consider(&from("ack", "bob"), &BasicEvaluator::new(), &engine(), 4, now)
            .await
            .unwrap();
        assert_eq!(thred.status(), ThredStatus::Terminated);
        assert!(thred.current_reaction_name().is_none());
        assert_eq!(thred.ended_at(), Some(now));
    }

    #[test]
    fn ends_finished_when_broadcast_allowed() {
        let now = Utc::now();
        let mut open = Thred::new("p_1", pattern(true), now);
        open.transition_to(None, now);
        assert_eq!(open.status(), ThredStatus::Finished);

        let mut closed = Thred::new("p_2", pattern(false), now);
        closed.transition_to(None, now);
        assert_eq!(closed.status(), ThredStatus::Terminated);
    }

    #[test]
    fn terminate_overrides_broadcast_flag() {
        let now = Utc::now();
        let mut thred = Thred::new("p_1", pattern(true), now);
        thred.terminate(now);
        assert_eq!(thred.status(), ThredStatus::Terminated);
    }

    #[test]
    fn same_reaction_transition_is_noop() {
        let start = Utc::now();
        let later = start + Duration::seconds(5);
        let mut thred = Thred::new("p_1", pattern(false), start);
        thred.transition_to(Some("start".into()), later);
        assert_eq!(thred.reaction_entered_at(), start);
        assert_eq!(thred.last_updated(), start);
    }

    #[tokio::test]
    async fn non_matching_event_changes_nothing_but_membership() {
        let now = Utc::now();
        let mut thred = Thred::new("p_1", pattern(false), now);
        let out = thred
            .consider(&from("other", "carol"), &BasicEvaluator::new(), &engine(), 4, now)
            .await
            .unwrap();
        assert!(!out.matched);
        assert!(out.publications.is_empty());
        assert_eq!(thred.current_reaction_name(), Some("start"));
        assert!(thred.context().is_participant("carol"));
    }

    #[test]
    fn expiry_applies_after_interval() {
        let start = Utc::now();
        let mut thred = Thred::new("p_1", pattern(false), start);
        thred.transition_to(Some("ack".into()), start);

        assert!(!thred.reaction_timed_out(start + Duration::seconds(30)));
        assert!(!thred.expire(start + Duration::seconds(30)).unwrap());

        let late = start + Duration::seconds(61);
        assert!(thred.reaction_timed_out(late));
        assert!(thred.expire(late).unwrap());
        assert_eq!(thred.status(), ThredStatus::Terminated);
    }

    #[test]
    fn state_round_trips_through_json() {
        let now = Utc::now();
        let pattern = pattern(false);
        let mut thred = Thred::new("p_1", Arc::clone(&pattern), now);
        thred.context_mut().add_participant("alice");
        thred.transition_to(Some("ack".into()), now + Duration::seconds(1));

        let json = serde_json::to_value(thred.state()).unwrap();
        let state: ThredState = serde_json::from_value(json).unwrap();
        let restored = Thred::from_state(state, |_| Some(Arc::clone(&pattern))).unwrap();

        assert_eq!(restored.state(), thred.state());
        assert_eq!(restored.current_reaction_name(), Some("ack"));
    }

    #[test]
    fn reconstruction_requires_loaded_pattern() {
        let thred = Thred::new("p_1", pattern(false), Utc::now());
        let err = Thred::from_state(thred.state(), |_| None).unwrap_err();
        assert!(matches!(err, ThredError::PatternNotLoaded { pattern_id } if pattern_id == "p"));
    }

    #[tokio::test]
    async fn forward_reconsiders_same_event() {
        let model = PatternModel::new(
            "f",
            "Forward",
            vec![
                Reaction::new("a", Condition::filter("true").with_transition(Transition::next().forward())),
                Reaction::new(
                    "b",
                    Condition::filter("values.n == 1")
                        .publish_to(["alice"])
                        .with_transition(Transition::to("c").into_local("seen")),
                ),
                Reaction::new("c", Condition::filter("false")),
            ],
        );
        let mut thred = Thred::new("f_1", Arc::new(Pattern::compile(model).unwrap()), Utc::now());
        let event = from("x", "alice").with_values(json!({ "n": 1 }));

        let out = thred
            .consider(&event, &BasicEvaluator::new(), &engine(), 4, Utc::now())
            .await
            .unwrap();
        assert_eq!(out.publications.len(), 1);
        assert_eq!(thred.current_reaction_name(), Some("c"));
        assert_eq!(thred.context().local("seen").unwrap()["id"], json!(event.id));
    }

    #[test]
    fn broadcast_requires_flag_membership_and_message() {
        let now = Utc::now();
        let mut thred = Thred::new("p_1", pattern(true), now);
        thred.context_mut().add_participant("alice");

        let stranger = from(BROADCAST_EVENT_TYPE, "mallory").with_values(json!({ "message": "hi" }));
        assert!(matches!(thred.broadcast(&stranger, &engine()), Err(ThredError::Unauthorized(_))));

        let empty = from(BROADCAST_EVENT_TYPE, "alice");
        assert!(matches!(thred.broadcast(&empty, &engine()), Err(ThredError::MissingArgument(_))));

        let ok = from(BROADCAST_EVENT_TYPE, "alice").with_values(json!({ "message": "hi" }));
        let publication = thred.broadcast(&ok, &engine()).unwrap();
        assert_eq!(publication.to, vec![THRED_SCOPE.to_string()]);
        assert_eq!(publication.event.value("message"), Some(&json!("hi")));

        let closed = Thred::new("p_2", pattern(false), now);
        assert!(matches!(closed.broadcast(&ok, &engine()), Err(ThredError::Unauthorized(_))));
    }
}
