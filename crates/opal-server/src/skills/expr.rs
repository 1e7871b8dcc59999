// crates/opal-server/src/skills/expr.rs
// Sandboxed expression evaluation for conditions, templates, and compute steps

use crate::error::{OpalError, Result};
use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Default wall-clock budget for compute steps.
pub const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Operation budget for one-shot expressions (conditions, templates).
const EXPR_MAX_OPERATIONS: u64 = 50_000;

/// Operation budget for compute snippets.
const COMPUTE_MAX_OPERATIONS: u64 = 500_000;

/// Build a locked-down engine: no modules, no I/O, bounded sizes, and an
/// optional wall-clock deadline enforced via the progress hook.
fn build_engine(known: HashSet<String>, max_ops: u64, deadline: Option<Instant>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_ops);
    engine.set_max_call_levels(32);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    // An undefined reference is the nullish value, not an error
    engine.on_var(move |name, _index, _context| {
        if known.contains(name) {
            Ok(None) // fall through to the scope
        } else {
            Ok(Some(Dynamic::UNIT))
        }
    });

    if let Some(deadline) = deadline {
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some("wall-clock timeout".into())
            } else {
                None
            }
        });
    }

    // Small builtin set beyond the operators rhai ships with
    engine.register_fn("str", |v: Dynamic| v.to_string());
    engine.register_fn("len", |s: &str| s.chars().count() as i64);
    engine.register_fn("len", |a: rhai::Array| a.len() as i64);
    engine.register_fn("len", |m: rhai::Map| m.len() as i64);

    engine
}

fn fill_scope(scope_values: &Map<String, Value>) -> Result<(Scope<'static>, HashSet<String>)> {
    let mut scope = Scope::new();
    let mut known = HashSet::new();
    for (name, value) in scope_values {
        let dynamic = rhai::serde::to_dynamic(value)
            .map_err(|e| OpalError::Validation(format!("cannot expose '{name}': {e}")))?;
        scope.push_dynamic(name.clone(), dynamic);
        known.insert(name.clone());
    }
    Ok((scope, known))
}

fn dynamic_to_value(dynamic: Dynamic) -> Value {
    rhai::serde::from_dynamic(&dynamic).unwrap_or(Value::Null)
}

fn eval_error(kind: &str, expr: &str, err: &rhai::EvalAltResult) -> OpalError {
    if matches!(err, rhai::EvalAltResult::ErrorTerminated(..)) {
        OpalError::Timeout(format!("{kind} exceeded its time budget"))
    } else {
        OpalError::Validation(format!("{kind} error in `{expr}`: {err}"))
    }
}

/// Evaluate a side-effect-free expression against the scope. Undefined
/// references yield `null`.
pub fn eval_expr(expr: &str, scope_values: &Map<String, Value>) -> Result<Value> {
    let (mut scope, known) = fill_scope(scope_values)?;
    let engine = build_engine(known, EXPR_MAX_OPERATIONS, None);
    let result = engine
        .eval_expression_with_scope::<Dynamic>(&mut scope, expr)
        .map_err(|e| eval_error("expression", expr, &e))?;
    Ok(dynamic_to_value(result))
}

/// JSON truthiness: null/false/0/""/[]/{} are false, everything else true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a step condition. An absent condition is the caller's concern;
/// this only maps the expression value through [`truthy`].
pub fn eval_condition(expr: &str, scope_values: &Map<String, Value>) -> Result<bool> {
    Ok(truthy(&eval_expr(expr, scope_values)?))
}

/// Execute a compute snippet on a blocking thread with a wall-clock budget.
/// Assignments are allowed; the final `result` binding becomes the value (or
/// the last expression when `result` is never assigned).
pub async fn eval_compute(
    code: String,
    scope_values: Map<String, Value>,
    timeout: Duration,
) -> Result<Value> {
    let handle = tokio::task::spawn_blocking(move || -> Result<Value> {
        let (mut scope, mut known) = fill_scope(&scope_values)?;
        // Pre-declared so `result = ...` is plain assignment, not a new `let`
        scope.push_dynamic("result".to_string(), Dynamic::UNIT);
        known.insert("result".to_string());

        let deadline = Instant::now() + timeout;
        let engine = build_engine(known, COMPUTE_MAX_OPERATIONS, Some(deadline));

        let last = engine
            .eval_with_scope::<Dynamic>(&mut scope, &code)
            .map_err(|e| eval_error("compute", &code, &e))?;

        let result = scope
            .get_value::<Dynamic>("result")
            .unwrap_or(Dynamic::UNIT);
        if result.is_unit() {
            Ok(dynamic_to_value(last))
        } else {
            Ok(dynamic_to_value(result))
        }
    });

    // The progress hook enforces the budget; this is the backstop for
    // anything stuck outside script execution
    match tokio::time::timeout(timeout + Duration::from_secs(1), handle).await {
        Ok(joined) => joined?,
        Err(_) => Err(OpalError::Timeout("compute step exceeded its time budget".to_string())),
    }
}
