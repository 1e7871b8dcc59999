// crates/opal-server/src/heal/mod.rs
// Auto-heal core: the decorator-chain interpreter around every tool call

pub mod classifier;
mod fix_memory;
mod optimizer;
mod remediation;
mod usage;

pub use classifier::{FailureClass, InfraCategory, UsageCategory, classify};
pub use fix_memory::{FixMemory, FixRecord, TOOL_FIXES_PATH};
pub use optimizer::OptimizeReport;
pub use remediation::{RemediationActions, RemediationOutcome};
pub use usage::{
    Precheck, PreventionStats, USAGE_PATTERNS_PATH, UsagePattern, UsagePatternStore,
    ValidationRule,
};

use crate::config::file::HealConfig;
use crate::registry::{DecoratorSpec, Tool, ToolResult};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use opal_types::{ErrorKind, FixHint, ToolError};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// One remediation attempt surfaced to the skill engine for event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationAttempt {
    pub failure_type: String,
    pub action: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// What the chain did around one invocation.
#[derive(Debug, Clone, Default)]
pub struct HealReport {
    pub attempts: Vec<RemediationAttempt>,
    /// The pre-check refused the call before the tool ran
    pub blocked: bool,
}

/// Source reference captured by the `debuggable` decorator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DebugCapture {
    pub tool_name: String,
    pub origin: String,
    pub decorators: Vec<String>,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// The auto-heal core: classifier + remediation actions + fix memory +
/// usage-pattern store, composed as a pipeline around every tool invocation.
pub struct AutoHealCore {
    pub fix_memory: FixMemory,
    pub patterns: UsagePatternStore,
    pub remediation: RemediationActions,
    config: HealConfig,
    captures: RwLock<HashMap<String, DebugCapture>>,
}

impl AutoHealCore {
    pub fn new(store: Store, config: HealConfig) -> Self {
        Self {
            fix_memory: FixMemory::new(store.clone()),
            patterns: UsagePatternStore::new(store),
            remediation: RemediationActions::new(),
            config,
            captures: RwLock::new(HashMap::new()),
        }
    }

    /// The source reference `debug_tool` reports for a tool, if it has run.
    pub fn debug_capture(&self, tool_name: &str) -> Option<DebugCapture> {
        self.captures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool_name)
            .cloned()
    }

    /// Run a tool's full decorator chain, outside-in:
    /// `usage_precheck` → `auto_heal` → `debuggable` → fn.
    pub async fn run_chain(&self, tool: &Tool, args: Map<String, Value>) -> (ToolResult, HealReport) {
        let mut report = HealReport::default();

        let has_precheck = tool.decorators.iter().any(|d| *d == DecoratorSpec::UsagePrecheck);
        let auto_heal = tool.decorators.iter().find_map(|d| match d {
            DecoratorSpec::AutoHeal { cluster } => Some(cluster.clone()),
            _ => None,
        });
        let has_debuggable = tool.decorators.iter().any(|d| *d == DecoratorSpec::Debuggable);

        // Outermost layer: the learned-pattern gate
        let mut warned_ids: Vec<String> = Vec::new();
        let mut pending_hints: Vec<FixHint> = Vec::new();
        if has_precheck {
            match self.patterns.precheck(&tool.name, &args).await {
                Precheck::Block { pattern_id, hints } => {
                    debug!(tool = %tool.name, pattern = %pattern_id, "Call blocked by usage pattern");
                    report.blocked = true;
                    let mut err = ToolError::new(
                        ErrorKind::Usage,
                        format!("call to '{}' blocked by a learned usage pattern", tool.name),
                    );
                    err.hints = hints;
                    return (Err(err), report);
                }
                Precheck::Warn { pattern_ids, hints } => {
                    warned_ids = pattern_ids;
                    pending_hints = hints;
                }
                Precheck::Info { hints, .. } => {
                    pending_hints = hints;
                }
                Precheck::Clear => {}
            }
        }

        // Inner layers
        let result = match auto_heal {
            Some(cluster) => {
                self.run_auto_heal(tool, args, cluster.as_deref(), has_debuggable, &mut report)
                    .await
            }
            None => self.base_call(tool, args, has_debuggable).await,
        };

        // Close the prevention feedback loop for warned calls
        if !warned_ids.is_empty() {
            let failed_with_usage = matches!(&result, Err(e) if e.kind == ErrorKind::Usage);
            self.patterns.record_outcome(&warned_ids, failed_with_usage).await;
        }

        let result = match result {
            Ok(value) => Ok(value),
            Err(mut err) => {
                for hint in pending_hints {
                    if !err.hints.contains(&hint) {
                        err.hints.push(hint);
                    }
                }
                Err(err)
            }
        };

        (result, report)
    }

    /// The `auto_heal` layer: classify failures, run a remediation action,
    /// retry once per category, and learn from what happened.
    async fn run_auto_heal(
        &self,
        tool: &Tool,
        args: Map<String, Value>,
        cluster: Option<&str>,
        debuggable: bool,
        report: &mut HealReport,
    ) -> ToolResult {
        let max_retries = self.config.max_retries;
        let mut used_categories: HashSet<String> = HashSet::new();

        let mut result = self.base_call(tool, args.clone(), debuggable).await;

        loop {
            let mut err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let error_text = err.error_text().to_string();
            let class = classify(&tool.name, &error_text);

            // Post-failure learning for misuse; the learned pattern's
            // prevention text becomes a hint on this very error.
            if matches!(class, FailureClass::Usage { .. }) {
                if let Some(pattern) = self.patterns.learn(&tool.name, &error_text, &class).await {
                    let hint = pattern.hint();
                    if !err.hints.contains(&hint) {
                        err.hints.push(hint);
                    }
                }
            }

            // Known fixes always surface as hints
            let fixes = self.fix_memory.lookup(&tool.name, &error_text).await;
            for fix in &fixes {
                let hint = fix.hint();
                if !err.hints.contains(&hint) {
                    err.hints.push(hint);
                }
            }

            if report.attempts.len() as u32 >= max_retries {
                return Err(err);
            }

            // Remediation: infrastructure categories get their registered
            // action; anything else may ride a high-confidence known fix.
            let attempt = match &class {
                FailureClass::Infrastructure { category } => {
                    let key = category.as_str().to_string();
                    if used_categories.contains(&key) {
                        None
                    } else {
                        used_categories.insert(key.clone());
                        match self.remediation.run(*category, cluster).await {
                            RemediationOutcome::Fixed { action } => Some((key, action)),
                            RemediationOutcome::ActionFailed { .. }
                            | RemediationOutcome::NoAction => None,
                        }
                    }
                }
                FailureClass::Unknown | FailureClass::Usage { .. } => {
                    let eligible = self.config.apply_known
                        && !used_categories.contains("known_fix")
                        && fixes
                            .first()
                            .is_some_and(|f| f.confidence >= self.config.apply_threshold);
                    if eligible {
                        used_categories.insert("known_fix".to_string());
                        let action = format!("known_fix:{}", fixes[0].error_pattern);
                        Some((class.label(), action))
                    } else {
                        None
                    }
                }
            };

            let Some((failure_type, action)) = attempt else {
                return Err(err);
            };

            let retry_count = report.attempts.len() as u32 + 1;
            report.attempts.push(RemediationAttempt {
                failure_type: failure_type.clone(),
                action: action.clone(),
                retry_count,
                max_retries,
            });
            debug!(tool = %tool.name, failure_type, action, retry_count, "Retrying after remediation");

            result = self.base_call(tool, args.clone(), debuggable).await;
            if result.is_ok() {
                self.fix_memory.record_applied(&tool.name, &error_text, &action).await;
            }
        }
    }

    /// The innermost layer: the tool function itself, with panic containment
    /// and the `debuggable` capture.
    async fn base_call(&self, tool: &Tool, args: Map<String, Value>, debuggable: bool) -> ToolResult {
        let result = match std::panic::AssertUnwindSafe(tool.call_raw(args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(tool = %tool.name, detail, "Tool panicked");
                Err(ToolError::new(
                    ErrorKind::Internal,
                    format!("tool '{}' panicked: {detail}", tool.name),
                ))
            }
        };

        if debuggable {
            let mut captures = self.captures.write().unwrap_or_else(|e| e.into_inner());
            let capture = captures.entry(tool.name.clone()).or_insert_with(|| DebugCapture {
                tool_name: tool.name.clone(),
                origin: tool.origin.clone(),
                decorators: tool.decorators.iter().map(|d| d.name().to_string()).collect(),
                last_error: None,
                last_failure_at: None,
            });
            if let Err(e) = &result {
                capture.last_error = Some(e.message.clone());
                capture.last_failure_at = Some(Utc::now());
            }
        }

        result
    }
}

/// Convenience handle bundled where several components need the same core.
pub type SharedHeal = Arc<AutoHealCore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn core() -> (tempfile::TempDir, AutoHealCore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), Duration::from_millis(10));
        (dir, AutoHealCore::new(store, HealConfig::default()))
    }

    /// A tool that fails `failures` times with `error`, then returns 42.
    fn flaky_tool(name: &str, failures: usize, error: &str) -> Tool {
        let remaining = Arc::new(AtomicUsize::new(failures));
        let error = error.to_string();
        Tool::simple(name, json!({"type": "object"}), move |_| {
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(ToolError::new(ErrorKind::Network, error.clone()).with_raw(error.clone()))
            } else {
                Ok(json!(42))
            }
        })
    }

    #[tokio::test]
    async fn test_network_failure_heals_and_retries() {
        let (_dir, core) = core();
        core.remediation.set_network_fix("vpn_connect", || Box::pin(async { Ok(()) }));
        let tool = flaky_tool("t_net", 1, "no route to host");

        let (result, report) = core.run_chain(&tool, Map::new()).await;
        assert_eq!(result.unwrap(), json!(42));
        assert_eq!(report.attempts.len(), 1);
        let attempt = &report.attempts[0];
        assert_eq!(attempt.failure_type, "network");
        assert_eq!(attempt.action, "vpn_connect");
        assert_eq!(attempt.retry_count, 1);

        // Successful remediation left a FixRecord behind
        let fixes = core.fix_memory.lookup("t_net", "no route to host").await;
        assert!(!fixes.is_empty());
        assert!(fixes[0].observations >= 1);
    }

    #[tokio::test]
    async fn test_remediation_bounded_to_one_retry() {
        let (_dir, core) = core();
        core.remediation.set_network_fix("vpn_connect", || Box::pin(async { Ok(()) }));
        // Still failing after the single allowed retry
        let tool = flaky_tool("t_net", 5, "no route to host");

        let (result, report) = core.run_chain(&tool, Map::new()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(report.attempts.len(), 1, "one retry per category, never recursive");
    }

    #[tokio::test]
    async fn test_no_action_surfaces_original_error() {
        let (_dir, core) = core();
        let tool = flaky_tool("t_net", 1, "no route to host");
        let (result, report) = core.run_chain(&tool, Map::new()).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Network);
        assert!(report.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_means_no_retry() {
        let (_dir, core) = core();
        core.remediation
            .set_network_fix("vpn_connect", || Box::pin(async { Err("vpn down".into()) }));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::simple("t", json!({"type": "object"}), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::new(ErrorKind::Network, "connection refused"))
        });

        let (result, _report) = core.run_chain(&tool, Map::new()).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "tool must not be retried without a fix");
    }

    #[tokio::test]
    async fn test_usage_failure_learns_pattern_and_hints() {
        let (_dir, core) = core();
        let tool = Tool::simple("jira_move", json!({"type": "object"}), |_| {
            Err(ToolError::new(ErrorKind::Usage, "no active sprint"))
        });

        let (result, _report) = core.run_chain(&tool, Map::new()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Usage, "auto-heal never changes kind");
        assert!(
            err.hints.iter().any(|h| h.source == opal_types::HintSource::UsagePattern),
            "learned pattern hint attached"
        );
        assert_eq!(core.patterns.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_precheck_blocks_before_tool_runs() {
        let (_dir, core) = core();
        let now = Utc::now();
        core.patterns
            .insert(UsagePattern {
                id: "p1".into(),
                tool: "t_tag".into(),
                category: UsageCategory::ParameterFormat,
                match_pattern: "never-matches-context".into(),
                cause: "short tag".into(),
                prevention_text: "Pass the full 40-character image digest".into(),
                validation_rules: vec![ValidationRule::LengthEquals {
                    param: "tag".into(),
                    len: 40,
                }],
                confidence: 0.96,
                observations: 7,
                prevention_stats: PreventionStats::default(),
                created: now,
                last_seen: now,
                last_active: now,
            })
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::simple("t_tag", json!({"type": "object"}), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("tagged"))
        });

        let mut args = Map::new();
        args.insert("tag".into(), json!("abcdef"));
        let (result, report) = core.run_chain(&tool, args).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Usage);
        assert!(err.hints.iter().any(|h| h.text.contains("40-character")));
        assert!(report.blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "fn is never called on a block");
        assert_eq!(core.patterns.all().await[0].observations, 7, "observations unchanged");
    }

    #[tokio::test]
    async fn test_fix_memory_hint_attached_on_failure() {
        let (_dir, core) = core();
        core.fix_memory
            .learn("t", "quota exceeded", "namespace at quota", "request a quota bump")
            .await
            .unwrap();
        let tool = Tool::simple("t", json!({"type": "object"}), |_| {
            Err(ToolError::new(ErrorKind::Internal, "quota exceeded for namespace"))
        });

        let (result, _report) = core.run_chain(&tool, Map::new()).await;
        let err = result.unwrap_err();
        assert!(err.hints.iter().any(|h| h.text.contains("quota bump")));
    }

    #[tokio::test]
    async fn test_debuggable_capture_recorded() {
        let (_dir, core) = core();
        let tool = Tool::simple("t_cap", json!({"type": "object"}), |_| {
            Err(ToolError::new(ErrorKind::Internal, "boom"))
        });
        let _ = core.run_chain(&tool, Map::new()).await;
        let capture = core.debug_capture("t_cap").unwrap();
        assert_eq!(capture.origin, "tool:t_cap");
        assert_eq!(capture.last_error.as_deref(), Some("boom"));
        assert!(capture.decorators.contains(&"auto_heal".to_string()));
    }

    #[tokio::test]
    async fn test_idempotent_observation_counting() {
        let (_dir, core) = core();
        core.remediation.set_network_fix("vpn_connect", || Box::pin(async { Ok(()) }));

        for _ in 0..2 {
            let tool = flaky_tool("t_net", 1, "no route to host");
            let (result, _) = core.run_chain(&tool, Map::new()).await;
            assert!(result.is_ok());
        }

        let fixes = core.fix_memory.lookup("t_net", "no route to host").await;
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].observations, 2, "one observation per successful remediation");
        assert!(fixes[0].confidence <= 0.95);
    }
}
