// crates/opal-server/src/heal/classifier.rs
// Ordered failure classification: infrastructure first, then usage rules

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Infrastructure failure categories.
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
pub enum InfraCategory {
    Network,
    Auth,
    Timeout,
}

impl InfraCategory {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Usage failure categories, persisted verbatim in learned patterns.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageCategory {
    IncorrectParameter,
    ParameterFormat,
    MissingPrerequisite,
    WorkflowSequence,
    WrongTool,
}

impl UsageCategory {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Classifier verdict. Never an error: anything unrecognized is `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureClass {
    Infrastructure {
        category: InfraCategory,
    },
    Usage {
        category: UsageCategory,
        /// Offending parameter name, when the error names one
        parameter: Option<String>,
        /// Expected format, for PARAMETER_FORMAT failures
        expected_format: Option<String>,
        /// Missing prerequisite, for MISSING_PREREQUISITE failures
        prerequisite: Option<String>,
    },
    Unknown,
}

impl FailureClass {
    /// Short label used in events and reports.
    pub fn label(&self) -> String {
        match self {
            FailureClass::Infrastructure { category } => category.as_str().to_string(),
            FailureClass::Usage { category, .. } => category.as_str().to_string(),
            FailureClass::Unknown => "unknown".to_string(),
        }
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "no route to host",
    "connection refused",
    "timeout",
    "dial",
    "network unreachable",
    "connection reset",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "deadline exceeded"];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "401",
    "403",
    "forbidden",
    "token expired",
    "permission denied",
];

struct UsageRule {
    category: UsageCategory,
    pattern: Regex,
}

fn usage_rules() -> &'static Vec<UsageRule> {
    static RULES: OnceLock<Vec<UsageRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let mut rules = Vec::new();
        let mut add = |category: UsageCategory, pattern: &str| {
            // Rule patterns are compile-time constants; a typo is a programmer error
            if let Ok(re) = Regex::new(pattern) {
                rules.push(UsageRule { category, pattern: re });
            }
        };

        add(
            UsageCategory::IncorrectParameter,
            r"(?i)invalid (?:value for )?(?:parameter|field|argument) '?(?P<param>[\w.]+)'?",
        );
        add(
            UsageCategory::IncorrectParameter,
            r"(?i)unknown (?:parameter|field|argument|option) '?(?P<param>[\w.]+)'?",
        );
        add(
            UsageCategory::ParameterFormat,
            r"(?i)(?:parameter |field )?'?(?P<param>[\w.]+)'? must be (?:a |an )?(?P<format>[\w\- ]+)",
        );
        add(
            UsageCategory::ParameterFormat,
            r"(?i)expected format[: ]+(?P<format>\S+)",
        );
        add(UsageCategory::ParameterFormat, r"(?i)malformed|invalid format");
        add(
            UsageCategory::MissingPrerequisite,
            r"(?i)no active (?P<prereq>[\w\- ]+)",
        );
        add(
            UsageCategory::MissingPrerequisite,
            r"(?i)requires (?P<prereq>[\w\- ]+?) (?:to be )?(?:set|active|configured|loaded)",
        );
        add(
            UsageCategory::MissingPrerequisite,
            r"(?i)missing prerequisite[: ]+(?P<prereq>.+)",
        );
        add(UsageCategory::MissingPrerequisite, r"(?i)not (?:yet )?initiali[sz]ed");
        add(
            UsageCategory::WorkflowSequence,
            r"(?i)must (?:be )?call(?:ed)? .* (?:before|after|first)",
        );
        add(UsageCategory::WorkflowSequence, r"(?i)already in progress|wrong state");
        add(
            UsageCategory::WrongTool,
            r"(?i)use (?:the )?'?(?P<tool>[\w.]+)'? (?:tool )?instead",
        );
        add(UsageCategory::WrongTool, r"(?i)not supported by this tool");
        rules
    })
}

/// Classify a failure from its error text. Infrastructure patterns are tested
/// first; the usage rule set is consulted only when none match.
pub fn classify(_tool_name: &str, error_text: &str) -> FailureClass {
    let lowered = error_text.to_lowercase();

    if NETWORK_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return FailureClass::Infrastructure { category: InfraCategory::Network };
    }
    if TIMEOUT_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return FailureClass::Infrastructure { category: InfraCategory::Timeout };
    }
    if AUTH_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return FailureClass::Infrastructure { category: InfraCategory::Auth };
    }

    for rule in usage_rules() {
        if let Some(caps) = rule.pattern.captures(error_text) {
            let field = |name: &str| caps.name(name).map(|m| m.as_str().trim().to_string());
            return FailureClass::Usage {
                category: rule.category,
                parameter: field("param"),
                expected_format: field("format"),
                prerequisite: field("prereq"),
            };
        }
    }

    FailureClass::Unknown
}
