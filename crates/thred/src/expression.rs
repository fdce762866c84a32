//! Expression evaluation seam.
//!
//! Reactions carry expressions as opaque strings. The engine hands them to an
//! [`ExpressionEvaluator`] together with the event being considered and the
//! thred's context. Plug in another language by implementing the trait;
//! [`BasicEvaluator`] runs them as Rhai expressions.
//!
//! ```text
//! event.type == "org.example.ping" && values.answer != ()
//! !(local.reply.source.id == event.source.id)
//! ```

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{json, Value};

use crate::context::ThredContext;
use crate::error::{Result, ThredError};
use crate::event::Event;

/// What an expression can see.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionScope<'a> {
    pub event: &'a Event,
    pub context: &'a ThredContext,
}

impl<'a> ExpressionScope<'a> {
    pub fn new(event: &'a Event, context: &'a ThredContext) -> Self {
        Self { event, context }
    }
}

#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str, scope: &ExpressionScope<'_>) -> Result<Value>;

    /// Evaluate and coerce to a boolean.
    async fn test(&self, expression: &str, scope: &ExpressionScope<'_>) -> Result<bool> {
        Ok(truthy(&self.evaluate(expression, scope).await?))
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Built-in evaluator on a sandboxed Rhai engine.
///
/// Variables in scope: `event` (the event in wire form), `values` (shorthand
/// for `event.data.content.values`, an empty map when absent), `local` (the
/// thred's local variables) and `thredId`. Missing map properties read as
/// `()`.
pub struct BasicEvaluator {
    engine: Engine,
}

const MAX_OPERATIONS: u64 = 10_000;
const MAX_EXPR_DEPTH: usize = 64;

impl BasicEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
        Self { engine }
    }

    fn scope(event: Value, context: &ThredContext) -> std::result::Result<Scope<'static>, Box<EvalAltResult>> {
        let values = event
            .pointer("/data/content/values")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let mut vars = Scope::new();
        vars.push_constant_dynamic("values", rhai::serde::to_dynamic(&values)?);
        vars.push_constant_dynamic("event", rhai::serde::to_dynamic(&event)?);
        vars.push_constant_dynamic("local", rhai::serde::to_dynamic(context.locals())?);
        vars.push_constant("thredId", context.thred_id.clone());
        Ok(vars)
    }

    fn run(&self, expression: &str, event: Value, context: &ThredContext) -> std::result::Result<Value, Box<EvalAltResult>> {
        let mut vars = Self::scope(event, context)?;
        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut vars, expression)?;
        rhai::serde::from_dynamic(&result)
    }
}

impl Default for BasicEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BasicEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicEvaluator").finish_non_exhaustive()
    }
}

#[async_trait]
impl ExpressionEvaluator for BasicEvaluator {
    async fn evaluate(&self, expression: &str, scope: &ExpressionScope<'_>) -> Result<Value> {
        if expression.trim().is_empty() {
            return Err(ThredError::expression(expression, "empty expression"));
        }
        let event = serde_json::to_value(scope.event)?;
        self.run(expression, event, scope.context)
            .map_err(|err| ThredError::expression(expression, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use serde_json::json;

    fn event() -> Event {
        Event::new("org.example.ping", EventSource::new("alice", "Alice"))
            .with_thred("p_1")
            .with_values(json!({ "answer": 42, "name": "deep thought" }))
    }

    async fn eval(expression: &str) -> Result<Value> {
        let event = event();
        let mut context = ThredContext::new("p_1");
        context.set_local("prior", json!({ "status": "ok" }));
        BasicEvaluator::new()
            .evaluate(expression, &ExpressionScope::new(&event, &context))
            .await
    }

    #[tokio::test]
    async fn compares_event_fields() {
        assert_eq!(eval(r#"event.type == "org.example.ping""#).await.unwrap(), json!(true));
        assert_eq!(eval(r#"event.source.id != "alice""#).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn values_shorthand_and_numbers() {
        assert_eq!(eval("values.answer == 42").await.unwrap(), json!(true));
        assert_eq!(eval("values.answer == 42.0").await.unwrap(), json!(true));
        assert_eq!(eval("values.missing == ()").await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn boolean_logic_and_grouping() {
        let v = eval(r#"!(values.answer == 1) && (local.prior.status == "ok" || false)"#)
            .await
            .unwrap();
        assert_eq!(v, json!(true));
    }

    #[tokio::test]
    async fn bare_path_returns_value() {
        assert_eq!(eval("values.name").await.unwrap(), json!("deep thought"));
        assert_eq!(eval("thredId").await.unwrap(), json!("p_1"));
        assert_eq!(eval("values.answer + 1").await.unwrap(), json!(43));
    }

    #[tokio::test]
    async fn malformed_expressions_fail() {
        for bad in ["", "values.answer ==", "(true", "banana", "nowhere.x", "\"open", "let x = 1"] {
            let err = eval(bad).await.unwrap_err();
            assert!(matches!(err, ThredError::Expression { .. }), "{bad}: {err}");
        }
    }
}
