//! Patterns: immutable, named rule sets that start and drive threds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::context::ThredContext;
use crate::error::{Result, ThredError};
use crate::event::Event;
use crate::expression::{ExpressionEvaluator, ExpressionScope};
use crate::reaction::{Reaction, TransitionTarget};

/// Authoring form of a pattern, as stored in the keyed and durable stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allow participant broadcasts; a pattern that allows them ends in
    /// `Finished` rather than `Terminated`.
    #[serde(default)]
    pub broadcast_allowed: bool,
    /// Echo matched participant events to the other participants.
    #[serde(default)]
    pub echo_responses: bool,
    #[serde(default = "enabled")]
    pub is_enabled: bool,
    pub reactions: Vec<Reaction>,
}

fn enabled() -> bool {
    true
}

impl PatternModel {
    pub fn new(id: impl Into<String>, name: impl Into<String>, reactions: Vec<Reaction>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            broadcast_allowed: false,
            echo_responses: false,
            is_enabled: true,
            reactions,
        }
    }

    pub fn broadcast_allowed(mut self, allowed: bool) -> Self {
        self.broadcast_allowed = allowed;
        self
    }

    pub fn echo_responses(mut self, echo: bool) -> Self {
        self.echo_responses = echo;
        self
    }
}

/// A validated pattern. The first reaction is the initial one and its
/// condition is the pattern's match predicate for unbound events.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    model: PatternModel,
    index: HashMap<String, usize>,
}

impl Pattern {
    /// Validate a model: a non-empty id, at least one reaction, unique
    /// reaction names and no transition to an unknown reaction.
    pub fn compile(model: PatternModel) -> Result<Self> {
        if model.id.trim().is_empty() {
            return Err(ThredError::ArgumentValidation("pattern id is empty".into()));
        }
        if model.reactions.is_empty() {
            return Err(ThredError::ArgumentValidation(format!(
                "pattern {} has no reactions",
                model.id
            )));
        }

        let mut index = HashMap::with_capacity(model.reactions.len());
        for (position, reaction) in model.reactions.iter().enumerate() {
            if index.insert(reaction.name.clone(), position).is_some() {
                return Err(ThredError::ArgumentValidation(format!(
                    "pattern {} declares reaction {} twice",
                    model.id, reaction.name
                )));
            }
        }

        for reaction in &model.reactions {
            let expiry = reaction.expiry.iter().filter_map(|e| e.transition.as_ref());
            for transition in reaction.condition.transitions().into_iter().chain(expiry) {
                if let TransitionTarget::Reaction(target) = &transition.name {
                    if !index.contains_key(target) {
                        return Err(ThredError::UnknownReaction {
                            pattern_id: model.id.clone(),
                            reaction: target.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self { model, index })
    }

    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }

    pub fn broadcast_allowed(&self) -> bool {
        self.model.broadcast_allowed
    }

    pub fn echo_responses(&self) -> bool {
        self.model.echo_responses
    }

    pub fn model(&self) -> &PatternModel {
        &self.model
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.model.reactions
    }

    pub fn initial_reaction(&self) -> &Reaction {
        &self.model.reactions[0]
    }

    pub fn reaction(&self, name: &str) -> Option<&Reaction> {
        self.index.get(name).map(|&i| &self.model.reactions[i])
    }

    /// The reaction following `name` in declaration order.
    pub fn reaction_after(&self, name: &str) -> Option<&Reaction> {
        self.index
            .get(name)
            .and_then(|&i| self.model.reactions.get(i + 1))
    }

    /// Evaluate the match predicate against an unbound event.
    ///
    /// Side-effect free: runs against a throwaway context.
    pub async fn matches(&self, event: &Event, evaluator: &dyn ExpressionEvaluator) -> Result<bool> {
        let scratch = ThredContext::default();
        let matched = self
            .initial_reaction()
            .condition
            .apply(ExpressionScope::new(event, &scratch), evaluator)
            .await?;
        Ok(matched.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use crate::expression::BasicEvaluator;
    use crate::reaction::{Condition, Transition};

    fn model() -> PatternModel {
        PatternModel::new(
            "greeting",
            "Greeting",
            vec![
                Reaction::new(
                    "start",
                    Condition::filter(r#"event.type == "hello""#).with_transition(Transition::next()),
                ),
                Reaction::new("ack", Condition::filter("true").with_transition(Transition::to("start"))),
            ],
        )
    }

    #[test]
    fn compiles_and_indexes_reactions() {
        let pattern = Pattern::compile(model()).unwrap();
        assert_eq!(pattern.initial_reaction().name, "start");
        assert_eq!(pattern.reaction_after("start").unwrap().name, "ack");
        assert!(pattern.reaction_after("ack").is_none());
        assert!(pattern.reaction("nope").is_none());
    }

    #[test]
    fn rejects_duplicates_and_dangling_targets() {
        let mut dup = model();
        dup.reactions.push(dup.reactions[0].clone());
        assert!(matches!(Pattern::compile(dup), Err(ThredError::ArgumentValidation(_))));

        let mut dangling = model();
        dangling.reactions[1].condition.transition = Some(Transition::to("elsewhere"));
        assert!(matches!(
            Pattern::compile(dangling),
            Err(ThredError::UnknownReaction { reaction, .. }) if reaction == "elsewhere"
        ));

        let empty = PatternModel::new("p", "P", vec![]);
        assert!(Pattern::compile(empty).is_err());
    }

    #[tokio::test]
    async fn matches_uses_initial_reaction() {
        let pattern = Pattern::compile(model()).unwrap();
        let alice = EventSource::new("alice", "Alice");
        assert!(pattern.matches(&Event::new("hello", alice.clone()), &BasicEvaluator::new()).await.unwrap());
        assert!(!pattern.matches(&Event::new("bye", alice), &BasicEvaluator::new()).await.unwrap());
    }

    #[test]
    fn model_defaults_when_deserialized() {
        let model: PatternModel = serde_json::from_value(serde_json::json!({
            "id": "p", "name": "P",
            "reactions": [{ "name": "r", "condition": { "type": "filter", "xpr": "true" } }]
        }))
        .unwrap();
        assert!(model.is_enabled);
        assert!(!model.broadcast_allowed);
    }
}
