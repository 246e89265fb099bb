//! JEXL evaluation for connection filters and group-by field expressions.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of pre-registered
//! transforms. Event payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use serde_json::{Value, json};
use skein_types::event::Event;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during filter/field evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression '{expression}' produced no value")]
    NullResult { expression: String },
}

// ---------------------------------------------------------------------------
// EventEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Used for:
/// - Connection filter expressions (e.g. `event.branch == 'main'`)
/// - Group-by field expressions (e.g. `event.release.version`)
pub struct EventEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl EventEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// The context object filter and field expressions evaluate against.
    ///
    /// Shape: `{ "event": <payload>, "channel": "...", "type": "..." }`
    pub fn event_context(event: &Event) -> Value {
        json!({
            "event": event.payload,
            "channel": event.channel,
            "type": event.event_type,
        })
    }

    /// Evaluate a filter expression to a boolean (JS-like truthiness).
    pub fn evaluate_filter(&self, expression: &str, event: &Event) -> Result<bool, EvalError> {
        let context = Self::event_context(event);
        let result = self
            .evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| EvalError::EvalFailed(e.to_string()))?;
        Ok(truthy(&result))
    }

    /// Evaluate a group-by field expression to its value.
    ///
    /// A null result means the event lacks the field; the caller rejects the
    /// event from the group.
    pub fn evaluate_field(&self, expression: &str, event: &Event) -> Result<Value, EvalError> {
        let context = Self::event_context(event);
        let result = self
            .evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| EvalError::EvalFailed(e.to_string()))?;
        if result.is_null() {
            return Err(EvalError::NullResult {
                expression: expression.to_string(),
            });
        }
        Ok(result)
    }
}

impl Default for EventEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
