// crates/opal-server/src/skills/template.rs
// Restricted `{{ expr }}` templating with a small filter set

use super::expr::eval_expr;
use crate::error::{OpalError, Result};
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};

/// Parsed templates are cached process-wide (LRU, bounded).
const PARSE_CACHE_CAP: u64 = 1000;

/// Names that appear in expressions without being scope references.
const BUILTIN_NAMES: &[&str] = &["true", "false", "len", "str", "in", "if", "else", "switch"];

#[derive(Debug, Clone, PartialEq)]
struct FilterCall {
    name: String,
    args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr { expr: String, filters: Vec<FilterCall> },
}

/// A parsed template: literal chunks interleaved with filtered expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `{{ expr | filter | filter(arg) }}` interpolations.
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(open) = rest.find("{{") {
            let (literal, after_open) = rest.split_at(open);
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
            let body_and_rest = &after_open[2..];
            let close = body_and_rest.find("}}").ok_or_else(|| {
                OpalError::Validation(format!("unclosed '{{{{' in template: {text}"))
            })?;
            let body = &body_and_rest[..close];
            segments.push(parse_expr_segment(body)?);
            rest = &body_and_rest[close + 2..];
        }
        if rest.contains("}}") {
            return Err(OpalError::Validation(format!("stray '}}}}' in template: {text}")));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render against a scope. A template that is exactly one interpolation
    /// keeps the expression's type; anything else renders to a string.
    pub fn render(&self, scope: &Map<String, Value>) -> Result<Value> {
        if let [Segment::Expr { expr, filters }] = self.segments.as_slice() {
            let mut value = eval_expr(expr, scope)?;
            for filter in filters {
                value = apply_filter(value, filter)?;
            }
            return Ok(value);
        }

        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Expr { expr, filters } => {
                    let mut value = eval_expr(expr, scope)?;
                    for filter in filters {
                        value = apply_filter(value, filter)?;
                    }
                    rendered.push_str(&value_to_string(&value));
                }
            }
        }
        Ok(Value::String(rendered))
    }

    /// Root identifiers referenced by the interpolations, for load-time
    /// validation against known names.
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for segment in &self.segments {
            if let Segment::Expr { expr, .. } = segment {
                collect_roots(expr, &mut refs);
            }
        }
        refs
    }
}

fn parse_expr_segment(body: &str) -> Result<Segment> {
    let parts = split_top_level(body, '|');
    let mut iter = parts.into_iter();
    let expr = iter
        .next()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| OpalError::Validation("empty template expression".to_string()))?;

    let mut filters = Vec::new();
    for raw in iter {
        filters.push(parse_filter(raw.trim())?);
    }
    Ok(Segment::Expr { expr, filters })
}

fn parse_filter(raw: &str) -> Result<FilterCall> {
    let (name, args) = match raw.find('(') {
        Some(open) => {
            let close = raw
                .rfind(')')
                .ok_or_else(|| OpalError::Validation(format!("unclosed filter call: {raw}")))?;
            let name = raw[..open].trim().to_string();
            let args = split_top_level(&raw[open + 1..close], ',')
                .into_iter()
                .map(|a| parse_literal(a.trim()))
                .collect::<Result<Vec<Value>>>()?;
            (name, args)
        }
        None => (raw.to_string(), Vec::new()),
    };

    match name.as_str() {
        "default" | "json" | "lower" | "upper" | "replace" => Ok(FilterCall { name, args }),
        other => Err(OpalError::Validation(format!("unknown filter: {other}"))),
    }
}

/// Split on a separator, ignoring separators inside quotes or parentheses.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '[' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c == sep && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                c => current.push(c),
            },
        }
    }
    parts.push(current);
    parts
}

/// Parse a filter argument literal: quoted string, number, bool, or null.
fn parse_literal(raw: &str) -> Result<Value> {
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
        {
            return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
        }
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Ok(Value::Number(n));
        }
    }
    Err(OpalError::Validation(format!("bad filter argument: {raw}")))
}

fn apply_filter(value: Value, filter: &FilterCall) -> Result<Value> {
    match filter.name.as_str() {
        "default" => {
            let fallback = filter.args.first().cloned().unwrap_or(Value::Null);
            let empty = match &value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            Ok(if empty { fallback } else { value })
        }
        "json" => Ok(Value::String(serde_json::to_string(&value)?)),
        "lower" => Ok(Value::String(value_to_string(&value).to_lowercase())),
        "upper" => Ok(Value::String(value_to_string(&value).to_uppercase())),
        "replace" => {
            let from = filter.args.first().and_then(|v| v.as_str()).unwrap_or("");
            let to = filter.args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(Value::String(value_to_string(&value).replace(from, to)))
        }
        other => Err(OpalError::Validation(format!("unknown filter: {other}"))),
    }
}

/// How values appear when interpolated into literal text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn collect_roots(expr: &str, out: &mut Vec<String>) {
    let mut chars = expr.char_indices().peekable();
    let mut prev_significant: Option<char> = None;

    while let Some((start, c)) = chars.next() {
        if c == '"' || c == '\'' {
            // skip the quoted run
            for (_, inner) in chars.by_ref() {
                if inner == c {
                    break;
                }
            }
            prev_significant = Some(c);
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let mut end = start + c.len_utf8();
            while let Some((i, n)) = chars.peek().copied() {
                if n.is_alphanumeric() || n == '_' {
                    end = i + n.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let ident = &expr[start..end];
            // A name after '.' is an attribute, not a root; a name followed
            // by '(' is a call
            let is_attr = prev_significant == Some('.');
            let is_call = expr[end..].trim_start().starts_with('(');
            if !is_attr && !is_call && !BUILTIN_NAMES.contains(&ident) {
                out.push(ident.to_string());
            }
            prev_significant = Some('i');
            continue;
        }
        if !c.is_whitespace() {
            prev_significant = Some(c);
        }
    }
}

/// Root identifiers referenced by a bare (non-template) expression, e.g. a
/// step condition. Used to detect conditions that inspect a dependency.
pub fn expr_roots(expr: &str) -> Vec<String> {
    let mut refs = Vec::new();
    collect_roots(expr, &mut refs);
    refs
}

fn parse_cache() -> &'static moka::sync::Cache<String, Arc<Template>> {
    static CACHE: OnceLock<moka::sync::Cache<String, Arc<Template>>> = OnceLock::new();
    CACHE.get_or_init(|| moka::sync::Cache::builder().max_capacity(PARSE_CACHE_CAP).build())
}

/// Parse (through the cache) and render one template string.
pub fn render_template(text: &str, scope: &Map<String, Value>) -> Result<Value> {
    let parsed = match parse_cache().get(text) {
        Some(parsed) => parsed,
        None => {
            let parsed = Arc::new(Template::parse(text)?);
            parse_cache().insert(text.to_string(), parsed.clone());
            parsed
        }
    };
    parsed.render(scope)
}

/// Recursively render every string inside a value (used for step args).
pub fn render_value(value: &Value, scope: &Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(text) => render_template(text, scope),
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|v| render_value(v, scope)).collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (k, v) in map {
                rendered.insert(k.clone(), render_value(v, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}
