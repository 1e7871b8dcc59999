// crates/opal-types/src/lib.rs

//! Shared data contracts between the Opal server and its clients.
//!
//! This crate provides:
//! - **Error contracts**: the `ErrorKind` taxonomy and the structured
//!   [`ToolError`] every tool failure is reported as
//! - **Event frames**: the WebSocket envelope and payloads streamed by the
//!   live execution bus
//!
//! These types cross the process boundary (MCP results and WebSocket frames),
//! so they carry no native-only dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ===================================================
// ERROR CONTRACTS
// ===================================================

/// Stable failure taxonomy. `kind` is the contract with callers; hints are
/// informational only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Protected,
    Usage,
    Auth,
    Network,
    Timeout,
    Cancelled,
    Io,
    Parse,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Where a remediation hint came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HintSource {
    FixMemory,
    UsagePattern,
    DebugTool,
}

/// A single remediation hint attached to a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixHint {
    pub text: String,
    pub source: HintSource,
}

impl FixHint {
    pub fn new(text: impl Into<String>, source: HintSource) -> Self {
        Self { text: text.into(), source }
    }
}

/// Structured failure returned by every tool invocation.
///
/// The auto-heal pipeline only ever *adds* hints; it never rewrites `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    /// Raw underlying error text, preserved verbatim for classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<FixHint>,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), raw: None, hints: Vec::new() }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_hint(mut self, hint: FixHint) -> Self {
        self.hints.push(hint);
        self
    }

    /// The text the classifier should look at: raw output when present,
    /// otherwise the message.
    pub fn error_text(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.message)
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolError {}

// ===================================================
// EVENT FRAMES
// ===================================================

/// One option presented to the user by a confirmation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmOption {
    pub value: String,
    pub label: String,
}

impl ConfirmOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self { value: value.into(), label: label.into() }
    }
}

/// Event payloads streamed over the bus. Serialized adjacently tagged so a
/// frame reads `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    SkillStarted {
        skill_name: String,
        inputs: Value,
        steps: Vec<StepSummary>,
    },
    StepStarted {
        step_id: String,
        step_index: usize,
        step_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    StepCompleted {
        step_id: String,
        success: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    AutoHealTriggered {
        step_id: String,
        failure_type: String,
        action: String,
        retry_count: u32,
        max_retries: u32,
    },
    ConfirmationRequired {
        confirmation_id: String,
        step_id: String,
        message: String,
        options: Vec<ConfirmOption>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
        timeout_seconds: u64,
    },
    /// Client → server: resolve a pending confirmation.
    ConfirmationAnswer {
        confirmation_id: String,
        answer: String,
    },
    SkillCompleted {
        skill_name: String,
        success: bool,
        duration_ms: u64,
        outputs: Value,
        steps_completed: usize,
        steps_skipped: usize,
        steps_failed: usize,
    },
    SkillFailed {
        skill_name: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_step_id: Option<String>,
        duration_ms: u64,
        partial_outputs: Value,
    },
    ToolsChanged {
        persona: String,
        tool_count: usize,
    },
    Heartbeat {
        server_status: String,
        active_executions: usize,
        connected_clients: usize,
    },
}

/// Step summary included in `skill_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Subscription topics. `All` receives everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    All,
    Skills,
    Steps,
    Confirmations,
    Status,
}

impl BusEvent {
    /// Which subscription topic this event belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::SkillStarted { .. }
            | BusEvent::SkillCompleted { .. }
            | BusEvent::SkillFailed { .. } => Topic::Skills,
            BusEvent::StepStarted { .. }
            | BusEvent::StepCompleted { .. }
            | BusEvent::StepSkipped { .. }
            | BusEvent::AutoHealTriggered { .. } => Topic::Steps,
            BusEvent::ConfirmationRequired { .. } | BusEvent::ConfirmationAnswer { .. } => {
                Topic::Confirmations
            }
            BusEvent::ToolsChanged { .. } | BusEvent::Heartbeat { .. } => Topic::Status,
        }
    }

    /// The frame `type` string, as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            BusEvent::SkillStarted { .. } => "skill_started",
            BusEvent::StepStarted { .. } => "step_started",
            BusEvent::StepCompleted { .. } => "step_completed",
            BusEvent::StepSkipped { .. } => "step_skipped",
            BusEvent::AutoHealTriggered { .. } => "auto_heal_triggered",
            BusEvent::ConfirmationRequired { .. } => "confirmation_required",
            BusEvent::ConfirmationAnswer { .. } => "confirmation_answer",
            BusEvent::SkillCompleted { .. } => "skill_completed",
            BusEvent::SkillFailed { .. } => "skill_failed",
            BusEvent::ToolsChanged { .. } => "tools_changed",
            BusEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Wire envelope: `{type, timestamp, execution_id?, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(flatten)]
    pub event: BusEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl EventFrame {
    pub fn new(event: BusEvent, execution_id: Option<String>) -> Self {
        Self { event, timestamp: Utc::now(), execution_id }
    }
}
