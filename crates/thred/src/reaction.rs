//! Reactions, conditions and transitions.
//!
//! A [`Reaction`] is one named state of a pattern. Its [`Condition`] decides,
//! per event, whether the reaction fires; when it does, the resulting
//! [`ConditionMatch`] says what to publish and where to go next.
//!
//! Condition kinds are a closed set ([`ConditionKind`]): `filter`, `and`, `or`.
//! Each kind may carry its own transform/publish/transition; a composite's own
//! settings take precedence over those of the operand that matched.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::expression::{ExpressionEvaluator, ExpressionScope};

/// Address token that resolves to every participant of the thred.
pub const THRED_SCOPE: &str = "$thred";

const NEXT_SENTINEL: &str = "$next";
const TERMINATE_SENTINEL: &str = "$terminate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransitionTarget {
    /// A named reaction in the same pattern.
    Reaction(String),
    /// The reaction after the current one in pattern order; ends the thred
    /// when the current reaction is the last.
    Next,
    /// End the thred immediately.
    Terminate,
}

impl From<String> for TransitionTarget {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            NEXT_SENTINEL => Self::Next,
            TERMINATE_SENTINEL => Self::Terminate,
            _ => Self::Reaction(raw),
        }
    }
}

impl From<TransitionTarget> for String {
    fn from(target: TransitionTarget) -> Self {
        match target {
            TransitionTarget::Reaction(name) => name,
            TransitionTarget::Next => NEXT_SENTINEL.to_string(),
            TransitionTarget::Terminate => TERMINATE_SENTINEL.to_string(),
        }
    }
}

/// How the triggering event is handed to the next reaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionInput {
    /// The next reaction waits for the next event.
    #[default]
    Default,
    /// The same event is considered again by the next reaction.
    Forward,
    /// The event is stored in the thred context under `local_name`.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub name: TransitionTarget,
    #[serde(default)]
    pub input: TransitionInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
}

impl Transition {
    pub fn to(reaction: impl Into<String>) -> Self {
        Self {
            name: TransitionTarget::Reaction(reaction.into()),
            input: TransitionInput::Default,
            local_name: None,
        }
    }

    pub fn next() -> Self {
        Self {
            name: TransitionTarget::Next,
            input: TransitionInput::Default,
            local_name: None,
        }
    }

    pub fn terminate() -> Self {
        Self {
            name: TransitionTarget::Terminate,
            input: TransitionInput::Default,
            local_name: None,
        }
    }

    pub fn forward(mut self) -> Self {
        self.input = TransitionInput::Forward;
        self
    }

    pub fn into_local(mut self, name: impl Into<String>) -> Self {
        self.input = TransitionInput::Local;
        self.local_name = Some(name.into());
        self
    }
}

/// Template for the data of the published event.
///
/// Any string of the form `$xpr(<expression>)` is replaced by the value of
/// the expression; everything else is copied verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub event_data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    /// Participant ids or address tokens such as [`THRED_SCOPE`].
    pub to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConditionKind {
    Filter { xpr: String },
    And { operands: Vec<Condition> },
    Or { operands: Vec<Condition> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(flatten)]
    pub kind: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Publish>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
}

/// Outcome of a condition that fired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionMatch {
    /// Transformed event data, if a transform applied.
    pub data: Option<Value>,
    pub publish: Option<Publish>,
    pub transition: Option<Transition>,
}

impl Condition {
    pub fn filter(xpr: impl Into<String>) -> Self {
        Self::of(ConditionKind::Filter { xpr: xpr.into() })
    }

    pub fn all(operands: Vec<Condition>) -> Self {
        Self::of(ConditionKind::And { operands })
    }

    pub fn any(operands: Vec<Condition>) -> Self {
        Self::of(ConditionKind::Or { operands })
    }

    fn of(kind: ConditionKind) -> Self {
        Self {
            kind,
            transform: None,
            publish: None,
            transition: None,
        }
    }

    pub fn with_transform(mut self, event_data: Value) -> Self {
        self.transform = Some(Transform { event_data });
        self
    }

    pub fn publish_to<I, S>(mut self, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publish = Some(Publish {
            to: to.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Every transition target named anywhere in this condition tree.
    pub fn transitions(&self) -> Vec<&Transition> {
        let mut found: Vec<&Transition> = self.transition.iter().collect();
        if let ConditionKind::And { operands } | ConditionKind::Or { operands } = &self.kind {
            for operand in operands {
                found.extend(operand.transitions());
            }
        }
        found
    }

    /// Test the event; `None` means the condition did not fire.
    pub fn apply<'a>(
        &'a self,
        scope: ExpressionScope<'a>,
        evaluator: &'a dyn ExpressionEvaluator,
    ) -> BoxFuture<'a, Result<Option<ConditionMatch>>> {
        async move {
            let inner = match &self.kind {
                ConditionKind::Filter { xpr } => {
                    if !evaluator.test(xpr, &scope).await? {
                        return Ok(None);
                    }
                    ConditionMatch::default()
                }
                ConditionKind::And { operands } => {
                    let mut last = ConditionMatch::default();
                    for operand in operands {
                        match operand.apply(scope, evaluator).await? {
                            Some(matched) => last = matched,
                            None => return Ok(None),
                        }
                    }
                    last
                }
                ConditionKind::Or { operands } => {
                    let mut first = None;
                    for operand in operands {
                        if let Some(matched) = operand.apply(scope, evaluator).await? {
                            first = Some(matched);
                            break;
                        }
                    }
                    match first {
                        Some(matched) => matched,
                        None => return Ok(None),
                    }
                }
            };

            let data = match &self.transform {
                Some(transform) => Some(render(&transform.event_data, scope, evaluator).await?),
                None => inner.data,
            };

            Ok(Some(ConditionMatch {
                data,
                publish: self.publish.clone().or(inner.publish),
                transition: self.transition.clone().or(inner.transition),
            }))
        }
        .boxed()
    }
}

fn render<'a>(
    template: &'a Value,
    scope: ExpressionScope<'a>,
    evaluator: &'a dyn ExpressionEvaluator,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        Ok(match template {
            Value::String(s) => match s.strip_prefix("$xpr(").and_then(|r| r.strip_suffix(')')) {
                Some(expression) => evaluator.evaluate(expression, &scope).await?,
                None => template.clone(),
            },
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(render(item, scope, evaluator).await?);
                }
                Value::Array(rendered)
            }
            Value::Object(fields) => {
                let mut rendered = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    rendered.insert(key.clone(), render(value, scope, evaluator).await?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
    .boxed()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expiry {
    pub interval_ms: u64,
    /// Where to go once expired; ends the thred when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
}

impl Expiry {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn transition(&self) -> Transition {
        self.transition.clone().unwrap_or_else(Transition::terminate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Expiry>,
}

impl Reaction {
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            condition,
            expiry: None,
        }
    }

    pub fn expires_after(mut self, interval: Duration, transition: Option<Transition>) -> Self {
        self.expiry = Some(Expiry {
            interval_ms: interval.as_millis() as u64,
            transition,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThredContext;
    use crate::event::{Event, EventSource};
    use crate::expression::BasicEvaluator;
    use serde_json::json;

    fn ping(answer: i64) -> Event {
        Event::new("ping", EventSource::new("alice", "Alice")).with_values(json!({ "answer": answer }))
    }

    async fn apply(condition: &Condition, event: &Event) -> Option<ConditionMatch> {
        let ctx = ThredContext::new("t1");
        condition
            .apply(ExpressionScope::new(event, &ctx), &BasicEvaluator::new())
            .await
            .unwrap()
    }

    #[test]
    fn condition_parses_from_authoring_json() {
        let condition: Condition = serde_json::from_value(json!({
            "type": "and",
            "operands": [
                { "type": "filter", "xpr": "event.type == \"ping\"" },
                { "type": "filter", "xpr": "values.answer == 42", "transition": { "name": "$next" } }
            ],
            "publish": { "to": ["$thred"] }
        }))
        .unwrap();

        assert!(matches!(condition.kind, ConditionKind::And { ref operands } if operands.len() == 2));
        assert_eq!(condition.transitions(), vec![&Transition::next()]);
    }

    #[test]
    fn transition_sentinels_round_trip_as_strings() {
        let raw = json!({ "name": "$terminate", "input": "local", "localName": "last" });
        let transition: Transition = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(transition.name, TransitionTarget::Terminate);
        assert_eq!(transition.input, TransitionInput::Local);
        assert_eq!(serde_json::to_value(&transition).unwrap(), raw);
    }

    #[tokio::test]
    async fn and_requires_every_operand() {
        let condition = Condition::all(vec![
            Condition::filter(r#"event.type == "ping""#),
            Condition::filter("values.answer == 42").with_transition(Transition::to("done")),
        ]);

        assert!(apply(&condition, &ping(1)).await.is_none());
        let matched = apply(&condition, &ping(42)).await.unwrap();
        assert_eq!(matched.transition, Some(Transition::to("done")));
    }

    #[tokio::test]
    async fn or_takes_first_match_and_own_settings_win() {
        let condition = Condition::any(vec![
            Condition::filter("values.answer == 1").with_transition(Transition::to("one")),
            Condition::filter("values.answer == 42").with_transition(Transition::to("many")),
        ])
        .publish_to([THRED_SCOPE]);

        let matched = apply(&condition, &ping(42)).await.unwrap();
        assert_eq!(matched.transition, Some(Transition::to("many")));
        assert_eq!(matched.publish.unwrap().to, vec!["$thred".to_string()]);

        let overridden = condition.clone().with_transition(Transition::terminate());
        let matched = apply(&overridden, &ping(1)).await.unwrap();
        assert_eq!(matched.transition, Some(Transition::terminate()));
    }

    #[tokio::test]
    async fn transform_renders_expressions_in_template() {
        let condition = Condition::filter("true").with_transform(json!({
            "content": { "values": { "echo": "$xpr(values.answer)", "fixed": "$xpr-not", "n": [1, "$xpr(thredId)"] } }
        }));

        let matched = apply(&condition, &ping(7)).await.unwrap();
        assert_eq!(
            matched.data.unwrap(),
            json!({ "content": { "values": { "echo": 7, "fixed": "$xpr-not", "n": [1, "t1"] } } })
        );
    }

    #[test]
    fn expiry_defaults_to_terminate() {
        let reaction =
            Reaction::new("wait", Condition::filter("true")).expires_after(Duration::from_secs(1), None);
        let expiry = reaction.expiry.unwrap();
        assert_eq!(expiry.interval(), Duration::from_secs(1));
        assert_eq!(expiry.transition(), Transition::terminate());
    }
}
