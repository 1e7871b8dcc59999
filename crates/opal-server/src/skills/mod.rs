// crates/opal-server/src/skills/mod.rs
// Skill definitions: YAML parsing and load-time validation

pub mod context;
pub mod engine;
pub mod expr;
pub mod template;

pub use context::{CancelToken, ExecutionContext, StepResult, StepStatus};
pub use engine::{SkillEngine, SkillOutcome};

use crate::error::{OpalError, Result};
use opal_types::ConfirmOption;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::warn;

/// Directory of skill definitions under the config root.
pub const SKILLS_DIR: &str = "skills";

/// Declared input types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
    List,
    Object,
    #[default]
    Any,
}

impl InputType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::List => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::List => "list",
            InputType::Object => "object",
            InputType::Any => "any",
        }
    }
}

/// One declared skill input.
#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum")]
    pub allowed: Vec<Value>,
}

/// Per-step failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry(u32),
}

impl<'de> Deserialize<'de> for OnError {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "fail" => Ok(OnError::Fail),
            "continue" => Ok(OnError::Continue),
            other => match other.strip_prefix("retry:").and_then(|n| n.parse::<u32>().ok()) {
                Some(n) => Ok(OnError::Retry(n)),
                None => Err(serde::de::Error::custom(format!(
                    "on_error must be fail, continue, or retry:N, got '{raw}'"
                ))),
            },
        }
    }
}

/// Confirmation option: shorthand string or `{value, label}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfirmOptionDef {
    Short(String),
    Full { value: String, label: String },
}

impl ConfirmOptionDef {
    pub fn to_option(&self) -> ConfirmOption {
        match self {
            ConfirmOptionDef::Short(value) => ConfirmOption::new(value.clone(), value.clone()),
            ConfirmOptionDef::Full { value, label } => {
                ConfirmOption::new(value.clone(), label.clone())
            }
        }
    }
}

fn default_confirm_timeout() -> u64 {
    60
}

/// In-flight confirmation declared on a step (or skill-wide, bound by id).
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmDef {
    pub message: String,
    pub options: Vec<ConfirmOptionDef>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default = "default_confirm_timeout")]
    pub timeout_s: u64,
}

/// Skill-level confirmation bound to a step id.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmSpec {
    pub step: String,
    #[serde(flatten)]
    pub confirm: ConfirmDef,
}

/// One unit of a skill: a tool call or a compute block, optionally looped.
#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub compute: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub output_binding: Option<String>,
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub parallel_group: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, rename = "loop")]
    pub loop_expr: Option<String>,
    #[serde(default)]
    pub loop_var: Option<String>,
    #[serde(default)]
    pub confirm: Option<ConfirmDef>,
}

impl StepDef {
    /// The name this step's result binds to.
    pub fn binding(&self) -> &str {
        self.output_binding.as_deref().unwrap_or(&self.id)
    }

    /// Wire name of the step kind.
    pub fn kind(&self) -> &'static str {
        if self.loop_expr.is_some() {
            "loop"
        } else if self.compute.is_some() {
            "compute"
        } else {
            "tool"
        }
    }
}

/// A parsed skill. Immutable once loaded; re-read from disk per invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillDef {
    pub name: String,
    /// Free-form (`1`, `"2.1"`, ...), informational only
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub confirmations: Vec<ConfirmSpec>,
}

impl SkillDef {
    /// Parse and validate a skill document.
    pub fn parse(text: &str) -> Result<Self> {
        let skill: SkillDef = serde_yaml::from_str(text)?;
        skill.validate()?;
        Ok(skill)
    }

    /// The confirmation applying to a step: step-level wins over skill-level.
    pub fn confirmation_for(&self, step: &StepDef) -> Option<ConfirmDef> {
        step.confirm.clone().or_else(|| {
            self.confirmations
                .iter()
                .find(|c| c.step == step.id)
                .map(|c| c.confirm.clone())
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(OpalError::Validation("skill has no name".to_string()));
        }
        if self.steps.is_empty() {
            return Err(OpalError::Validation(format!("skill '{}' has no steps", self.name)));
        }

        // Unique ids, exactly one body per step, loop coherence
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(OpalError::Validation(format!(
                    "duplicate step id '{}' in skill '{}'",
                    step.id, self.name
                )));
            }
            match (&step.tool, &step.compute) {
                (Some(_), Some(_)) => {
                    return Err(OpalError::Validation(format!(
                        "step '{}' declares both tool and compute",
                        step.id
                    )));
                }
                (None, None) => {
                    return Err(OpalError::Validation(format!(
                        "step '{}' declares neither tool nor compute",
                        step.id
                    )));
                }
                _ => {}
            }
            if step.loop_expr.is_some() != step.loop_var.is_some() {
                return Err(OpalError::Validation(format!(
                    "step '{}' must declare loop and loop_var together",
                    step.id
                )));
            }
            if let Some(confirm) = &step.confirm {
                validate_confirm(&step.id, confirm)?;
            }
        }

        // depends_on must reference earlier steps, and never a member of the
        // same parallel group: those run concurrently, so the dependency
        // could not be awaited
        let groups: std::collections::HashMap<&str, Option<u32>> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.parallel_group))
            .collect();
        let mut earlier: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !earlier.contains(dep.as_str()) {
                    return Err(OpalError::Validation(format!(
                        "step '{}' depends on '{}', which is not an earlier step",
                        step.id, dep
                    )));
                }
                if let Some(group) = step.parallel_group {
                    if groups.get(dep.as_str()).copied().flatten() == Some(group) {
                        return Err(OpalError::Validation(format!(
                            "step '{}' depends on '{}' in the same parallel group {group}",
                            step.id, dep
                        )));
                    }
                }
            }
            earlier.insert(&step.id);
        }

        // Skill-level confirmations bind to real steps
        for spec in &self.confirmations {
            if !self.steps.iter().any(|s| s.id == spec.step) {
                return Err(OpalError::Validation(format!(
                    "confirmation bound to unknown step '{}'",
                    spec.step
                )));
            }
            validate_confirm(&spec.step, &spec.confirm)?;
        }

        // Input patterns compile
        for input in &self.inputs {
            if let Some(pattern) = &input.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    OpalError::Validation(format!(
                        "input '{}' has a bad pattern: {e}",
                        input.name
                    ))
                })?;
            }
        }

        self.validate_references()
    }

    /// Every `{{ reference }}` must resolve to a known name: an input scope,
    /// a step binding declared earlier, or the step's own loop variable.
    fn validate_references(&self) -> Result<()> {
        let mut known: HashSet<String> =
            ["inputs", "config", "session", "confirm_answer"].iter().map(|s| s.to_string()).collect();

        for step in &self.steps {
            let mut local = known.clone();
            if let Some(loop_var) = &step.loop_var {
                local.insert(loop_var.clone());
            }
            for value in step.args.values() {
                check_value_refs(&step.id, value, &local)?;
            }
            known.insert(step.id.clone());
            known.insert(step.binding().to_string());
        }

        for (key, template) in &self.outputs {
            let parsed = template::Template::parse(template)?;
            for reference in parsed.references() {
                if !known.contains(&reference) {
                    return Err(OpalError::Validation(format!(
                        "output '{key}' references unknown name '{reference}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate provided inputs, fill defaults, and reject constraint
    /// violations.
    pub fn resolve_inputs(&self, provided: &Value) -> Result<serde_json::Map<String, Value>> {
        let provided = match provided {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(OpalError::Validation("skill inputs must be an object".to_string()));
            }
        };

        let mut resolved = serde_json::Map::new();
        for spec in &self.inputs {
            let value = provided.get(&spec.name).cloned().or_else(|| spec.default.clone());
            let Some(value) = value else {
                if spec.required {
                    return Err(OpalError::Validation(format!(
                        "missing required input '{}'",
                        spec.name
                    )));
                }
                continue;
            };

            if !spec.input_type.accepts(&value) {
                return Err(OpalError::Validation(format!(
                    "input '{}' must be of type {}",
                    spec.name,
                    spec.input_type.name()
                )));
            }
            if !spec.allowed.is_empty() && !spec.allowed.contains(&value) {
                return Err(OpalError::Validation(format!(
                    "input '{}' is not one of the allowed values",
                    spec.name
                )));
            }
            if let (Some(pattern), Some(text)) = (&spec.pattern, value.as_str()) {
                // Compiles: checked at validate()
                if let Ok(re) = regex::Regex::new(pattern) {
                    if !re.is_match(text) {
                        return Err(OpalError::Validation(format!(
                            "input '{}' does not match pattern {pattern}",
                            spec.name
                        )));
                    }
                }
            }
            resolved.insert(spec.name.clone(), value);
        }

        // Unknown extras pass through so tools can take ad-hoc arguments
        for (name, value) in provided {
            resolved.entry(name).or_insert(value);
        }
        Ok(resolved)
    }
}

fn validate_confirm(step_id: &str, confirm: &ConfirmDef) -> Result<()> {
    if confirm.options.is_empty() {
        return Err(OpalError::Validation(format!(
            "confirmation on step '{step_id}' has no options"
        )));
    }
    if let Some(default) = &confirm.default {
        let valid = confirm.options.iter().any(|o| &o.to_option().value == default);
        if !valid {
            return Err(OpalError::Validation(format!(
                "confirmation default '{default}' on step '{step_id}' is not an option"
            )));
        }
    }
    Ok(())
}

fn check_value_refs(step_id: &str, value: &Value, known: &HashSet<String>) -> Result<()> {
    match value {
        Value::String(text) => {
            let parsed = template::Template::parse(text)?;
            for reference in parsed.references() {
                if !known.contains(&reference) {
                    return Err(OpalError::Validation(format!(
                        "step '{step_id}' references unknown name '{reference}'"
                    )));
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value_refs(step_id, item, known)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                check_value_refs(step_id, item, known)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Read a skill from disk. Re-read on every invocation so edits land without
/// a restart.
pub fn load_skill(root: &Path, name: &str) -> Result<SkillDef> {
    let path = root.join(SKILLS_DIR).join(format!("{name}.yaml"));
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            OpalError::NotFound(format!("unknown skill: {name}"))
        } else {
            e.into()
        }
    })?;
    SkillDef::parse(&contents)
}

/// Names of every skill on disk, sorted.
pub fn list_skills(root: &Path) -> Vec<String> {
    let dir = root.join(SKILLS_DIR);
    let mut names = Vec::new();
    for entry in walkdir::WalkDir::new(&dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => names.push(stem.to_string()),
            None => warn!(file = %path.display(), "Skipping skill with unusable file name"),
        }
    }
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GREET: &str = r#"
name: greet
description: Echo and decorate a message
inputs:
  - name: msg
    type: string
    required: true
steps:
  - id: a
    tool: t_echo
    args:
      msg: "{{ inputs.msg }}"
    output_binding: m
  - id: b
    compute: |
      result = m + "!";
outputs:
  text: "{{ b }}"
"#;

    #[test]
    fn test_parse_valid_skill() {
        let skill = SkillDef::parse(GREET).unwrap();
        assert_eq!(skill.name, "greet");
        assert_eq!(skill.steps.len(), 2);
        assert_eq!(skill.steps[0].kind(), "tool");
        assert_eq!(skill.steps[0].binding(), "m");
        assert_eq!(skill.steps[1].kind(), "compute");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
name: dup
steps:
  - id: a
    tool: x
  - id: a
    tool: y
"#;
        let err = SkillDef::parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_step_needs_exactly_one_body() {
        let both = r#"
name: s
steps:
  - id: a
    tool: x
    compute: "1"
"#;
        assert!(SkillDef::parse(both).is_err());
        let neither = r#"
name: s
steps:
  - id: a
"#;
        assert!(SkillDef::parse(neither).is_err());
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    args:
      v: "{{ ghost }}"
"#;
        let err = SkillDef::parse(text).unwrap_err();
        assert!(err.to_string().contains("unknown name 'ghost'"));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    args:
      v: "{{ b }}"
  - id: b
    tool: y
"#;
        assert!(SkillDef::parse(text).is_err());
    }

    #[test]
    fn test_depends_on_must_be_earlier() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    depends_on: [b]
  - id: b
    tool: y
"#;
        let err = SkillDef::parse(text).unwrap_err();
        assert!(err.to_string().contains("not an earlier step"));
    }

    #[test]
    fn test_depends_on_within_same_parallel_group_rejected() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    parallel_group: 1
  - id: b
    tool: y
    parallel_group: 1
    depends_on: [a]
"#;
        let err = SkillDef::parse(text).unwrap_err();
        assert!(err.to_string().contains("same parallel group"), "{err}");

        // The same edge across groups is fine
        let across = r#"
name: s
steps:
  - id: a
    tool: x
    parallel_group: 1
  - id: b
    tool: y
    parallel_group: 2
    depends_on: [a]
"#;
        assert!(SkillDef::parse(across).is_ok());
    }

    #[test]
    fn test_on_error_parsing() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    on_error: "retry:3"
  - id: b
    tool: y
    on_error: "continue"
"#;
        let skill = SkillDef::parse(text).unwrap();
        assert_eq!(skill.steps[0].on_error, OnError::Retry(3));
        assert_eq!(skill.steps[1].on_error, OnError::Continue);

        let bad = r#"
name: s
steps:
  - id: a
    tool: x
    on_error: "retry:soon"
"#;
        assert!(SkillDef::parse(bad).is_err());
    }

    #[test]
    fn test_confirm_default_must_be_option() {
        let text = r#"
name: s
steps:
  - id: danger
    tool: x
    confirm:
      message: "delete?"
      options: ["yes", "no"]
      default: "maybe"
"#;
        assert!(SkillDef::parse(text).is_err());
    }

    #[test]
    fn test_skill_level_confirmation_lookup() {
        let text = r#"
name: s
steps:
  - id: danger
    tool: x
confirmations:
  - step: danger
    message: "proceed?"
    options:
      - value: "yes"
        label: "Yes, run it"
      - value: "no"
        label: "Stop"
    default: "no"
    timeout_s: 5
"#;
        let skill = SkillDef::parse(text).unwrap();
        let confirm = skill.confirmation_for(&skill.steps[0]).unwrap();
        assert_eq!(confirm.timeout_s, 5);
        assert_eq!(confirm.options[0].to_option().label, "Yes, run it");
    }

    #[test]
    fn test_resolve_inputs() {
        let skill = SkillDef::parse(GREET).unwrap();
        let inputs = skill.resolve_inputs(&json!({"msg": "hi"})).unwrap();
        assert_eq!(inputs["msg"], json!("hi"));

        assert!(skill.resolve_inputs(&json!({})).is_err(), "required input missing");
        assert!(skill.resolve_inputs(&json!({"msg": 42})).is_err(), "type mismatch");
    }

    #[test]
    fn test_resolve_inputs_defaults_and_constraints() {
        let text = r#"
name: s
inputs:
  - name: env
    type: string
    default: "dev"
    enum: ["dev", "prod"]
  - name: sha
    type: string
    pattern: "^[0-9a-f]+$"
steps:
  - id: a
    tool: x
"#;
        let skill = SkillDef::parse(text).unwrap();
        let inputs = skill.resolve_inputs(&json!({"sha": "abc123"})).unwrap();
        assert_eq!(inputs["env"], json!("dev"));
        assert!(skill.resolve_inputs(&json!({"env": "staging"})).is_err());
        assert!(skill.resolve_inputs(&json!({"sha": "XYZ"})).is_err());
    }

    #[test]
    fn test_loop_requires_var() {
        let text = r#"
name: s
steps:
  - id: a
    tool: x
    loop: "inputs.items"
"#;
        assert!(SkillDef::parse(text).is_err());
    }

    #[test]
    fn test_load_and_list_from_disk(){
        let dir = tempfile::tempdir().unwrap();
        let skills = dir.path().join(SKILLS_DIR);
        std::fs::create_dir_all(&skills).unwrap();
        std::fs::write(skills.join("greet.yaml"), GREET).unwrap();

        let skill = load_skill(dir.path(), "greet").unwrap();
        assert_eq!(skill.name, "greet");
        assert!(matches!(
            load_skill(dir.path(), "ghost").unwrap_err(),
            OpalError::NotFound(_)
        ));
        assert_eq!(list_skills(dir.path()), vec!["greet".to_string()]);
    }
}
