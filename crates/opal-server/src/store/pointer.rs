// crates/opal-server/src/store/pointer.rs
// Dotted-path access into JSON/YAML document values

use crate::error::{OpalError, Result};
use serde_json::Value;

/// Split a dotted pointer into segments. Empty pointer addresses the root.
fn segments(pointer: &str) -> Vec<&str> {
    if pointer.is_empty() {
        Vec::new()
    } else {
        pointer.split('.').collect()
    }
}

/// Read the value at a dotted pointer, if present.
pub fn get<'a>(doc: &'a Value, pointer: &str) -> Option<&'a Value> {
    let mut current = doc;
    for seg in segments(pointer) {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set the value at a dotted pointer, creating intermediate objects as needed.
/// Numeric segments index into arrays and must already be in bounds.
pub fn set(doc: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    let segs = segments(pointer);
    if segs.is_empty() {
        *doc = new_value;
        return Ok(());
    }

    let mut current = doc;
    for (i, seg) in segs.iter().enumerate() {
        let last = i == segs.len() - 1;
        match current {
            Value::Object(map) => {
                if last {
                    map.insert((*seg).to_string(), new_value);
                    return Ok(());
                }
                current = map
                    .entry((*seg).to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            Value::Array(items) => {
                let idx = seg.parse::<usize>().map_err(|_| {
                    OpalError::Validation(format!("'{seg}' is not an array index in '{pointer}'"))
                })?;
                let slot = items.get_mut(idx).ok_or_else(|| {
                    OpalError::NotFound(format!("index {idx} out of bounds in '{pointer}'"))
                })?;
                if last {
                    *slot = new_value;
                    return Ok(());
                }
                current = slot;
            }
            Value::Null => {
                // Materialize the missing intermediate as an object
                *current = Value::Object(serde_json::Map::new());
                continue;
            }
            other => {
                return Err(OpalError::Validation(format!(
                    "cannot descend into {} at '{seg}' in '{pointer}'",
                    type_name(other)
                )));
            }
        }
    }
    unreachable!("set() returns from the last segment")
}

/// Append an item to the list at a dotted pointer, creating the list when the
/// slot is absent or null.
pub fn append(doc: &mut Value, pointer: &str, item: Value) -> Result<()> {
    let existing = get(doc, pointer).cloned();
    match existing {
        Some(Value::Array(mut items)) => {
            items.push(item);
            set(doc, pointer, Value::Array(items))
        }
        None | Some(Value::Null) => set(doc, pointer, Value::Array(vec![item])),
        Some(other) => Err(OpalError::Validation(format!(
            "'{pointer}' holds {}, not a list",
            type_name(&other)
        ))),
    }
}

/// Evaluate a read-only query path. Like `get`, but a `*` segment fans out
/// across every element of an array or every value of an object.
pub fn query(doc: &Value, path: &str) -> Vec<Value> {
    let mut current = vec![doc];
    for seg in segments(path) {
        let mut next = Vec::new();
        for value in current {
            match (value, seg) {
                (Value::Object(map), "*") => next.extend(map.values()),
                (Value::Array(items), "*") => next.extend(items.iter()),
                (Value::Object(map), key) => {
                    if let Some(v) = map.get(key) {
                        next.push(v);
                    }
                }
                (Value::Array(items), idx) => {
                    if let Some(v) = idx.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        next.push(v);
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current.into_iter().cloned().collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested() {
        let doc = json!({"a": {"b": [{"c": 42}]}});
        assert_eq!(get(&doc, "a.b.0.c"), Some(&json!(42)));
        assert_eq!(get(&doc, "a.missing"), None);
        assert_eq!(get(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({});
        set(&mut doc, "sprint.active_issue", json!("PROJ-17")).unwrap();
        assert_eq!(doc, json!({"sprint": {"active_issue": "PROJ-17"}}));
    }

    #[test]
    fn test_set_array_index_bounds() {
        let mut doc = json!({"items": [1, 2]});
        set(&mut doc, "items.1", json!(99)).unwrap();
        assert_eq!(doc["items"][1], json!(99));
        assert!(set(&mut doc, "items.5", json!(0)).is_err());
    }

    #[test]
    fn test_set_refuses_descending_into_scalar() {
        let mut doc = json!({"a": 1});
        let err = set(&mut doc, "a.b", json!(2)).unwrap_err();
        assert!(err.to_string().contains("cannot descend"));
    }

    #[test]
    fn test_append_creates_and_extends() {
        let mut doc = json!({});
        append(&mut doc, "log", json!("first")).unwrap();
        append(&mut doc, "log", json!("second")).unwrap();
        assert_eq!(doc["log"], json!(["first", "second"]));
        assert!(append(&mut doc, "log.0", json!("nope")).is_err());
    }

    #[test]
    fn test_query_wildcard() {
        let doc = json!({"jobs": [{"name": "a"}, {"name": "b"}]});
        let names = query(&doc, "jobs.*.name");
        assert_eq!(names, vec![json!("a"), json!("b")]);
        assert!(query(&doc, "jobs.9.name").is_empty());
    }
}
