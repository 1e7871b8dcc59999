// crates/opal-server/src/registry/schema.rs
// Argument validation against the JSON-schema subset tool manifests declare

use opal_types::{ErrorKind, ToolError};
use serde_json::{Map, Value};

/// Validate `args` against a tool's parameter schema.
///
/// The enforced subset is `required`, primitive `type`, `enum`, and `pattern`
/// on properties, the same subset MCP clients see in `list_tools`. Unknown
/// schema keywords are ignored rather than guessed at.
pub fn validate_args(tool_name: &str, schema: &Value, args: &Map<String, Value>) -> Result<(), ToolError> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            let missing = match args.get(name) {
                None | Some(Value::Null) => true,
                Some(_) => false,
            };
            if missing {
                return Err(validation_error(
                    tool_name,
                    format!("missing required parameter '{name}'"),
                ));
            }
        }
    }

    let Some(props) = schema_obj.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (name, prop_schema) in props {
        let Some(value) = args.get(name) else { continue };
        if value.is_null() {
            continue;
        }
        let Some(prop) = prop_schema.as_object() else { continue };

        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            if !type_matches(expected, value) {
                return Err(validation_error(
                    tool_name,
                    format!("parameter '{name}' must be of type {expected}, got {}", json_type(value)),
                ));
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(render_enum_option).collect();
                return Err(validation_error(
                    tool_name,
                    format!("parameter '{name}' must be one of: {}", options.join(", ")),
                ));
            }
        }

        if let (Some(pattern), Some(text)) = (prop.get("pattern").and_then(|p| p.as_str()), value.as_str()) {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(text) {
                        return Err(validation_error(
                            tool_name,
                            format!("parameter '{name}' does not match pattern {pattern}"),
                        ));
                    }
                }
                // A broken pattern in a manifest must not block the call
                Err(e) => tracing::warn!(tool = tool_name, pattern, error = %e, "Invalid schema pattern"),
            }
        }
    }

    Ok(())
}

fn validation_error(tool_name: &str, message: String) -> ToolError {
    ToolError::new(ErrorKind::Validation, format!("{tool_name}: {message}"))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_enum_option(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
