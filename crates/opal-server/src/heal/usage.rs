// crates/opal-server/src/heal/usage.rs
// Learned usage patterns: pre-check gate + post-failure learner

use super::classifier::{FailureClass, UsageCategory};
use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use opal_types::{FixHint, HintSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Document path under the config root.
pub const USAGE_PATTERNS_PATH: &str = "learned/usage_patterns.yaml";

/// Pre-check thresholds.
pub const BLOCK_THRESHOLD: f64 = 0.95;
pub const WARN_THRESHOLD: f64 = 0.80;
pub const INFO_THRESHOLD: f64 = 0.50;

/// New patterns start here.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

/// Two patterns this similar are the same mistake.
pub const SIMILARITY_THRESHOLD: f64 = 0.70;

/// Per-tool pattern cache: 5 minutes, at most 1000 tools.
const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAP: u64 = 1000;

/// A predicate describing *correct* usage; the pattern fires when violated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    /// The parameter must be present and non-null
    ParamPresent { param: String },
    /// The parameter, when a string, must have exactly this length
    LengthEquals { param: String, len: usize },
    /// The parameter, when a string, must match this regex
    MatchesPattern { param: String, pattern: String },
}

impl ValidationRule {
    /// Whether `args` violate this rule.
    pub fn violated_by(&self, args: &Map<String, Value>) -> bool {
        match self {
            ValidationRule::ParamPresent { param } => {
                matches!(args.get(param), None | Some(Value::Null))
            }
            ValidationRule::LengthEquals { param, len } => match args.get(param) {
                Some(Value::String(s)) => s.chars().count() != *len,
                _ => false,
            },
            ValidationRule::MatchesPattern { param, pattern } => match args.get(param) {
                Some(Value::String(s)) => match regex::Regex::new(pattern) {
                    Ok(re) => !re.is_match(s),
                    Err(e) => {
                        warn!(pattern, error = %e, "Invalid validation rule pattern");
                        false
                    }
                },
                _ => false,
            },
        }
    }
}

/// How often showing this pattern actually helped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreventionStats {
    pub shown: u64,
    pub prevented: u64,
    pub failed: u64,
    pub false_positive: u64,
}

impl PreventionStats {
    /// Prevention success rate; 0.5 (neutral) with no signal yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.prevented + self.failed;
        if total == 0 {
            0.5
        } else {
            self.prevented as f64 / total as f64
        }
    }
}

/// A learned misuse pattern for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePattern {
    pub id: String,
    pub tool: String,
    pub category: UsageCategory,
    /// Regex tested against the rendered call context
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub cause: String,
    pub prevention_text: String,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    pub confidence: f64,
    pub observations: u64,
    #[serde(default)]
    pub prevention_stats: PreventionStats,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl UsagePattern {
    /// Confidence: grows with observations, nudged by prevention outcomes,
    /// capped at 0.95.
    pub fn confidence_for(observations: u64, success_rate: f64) -> f64 {
        let grown =
            0.5 + ((observations as f64) + 1.0).log10() / 2.0 + 0.2 * (success_rate - 0.5);
        grown.min(0.95)
    }

    pub fn recompute_confidence(&mut self) {
        self.confidence =
            Self::confidence_for(self.observations, self.prevention_stats.success_rate());
    }

    /// Whether this pattern fires for a call: any validation rule violated, or
    /// the rendered call context matches the pattern regex.
    pub fn matches_call(&self, args: &Map<String, Value>, rendered_context: &str) -> bool {
        if self.validation_rules.iter().any(|r| r.violated_by(args)) {
            return true;
        }
        match regex::Regex::new(&self.match_pattern) {
            Ok(re) => re.is_match(rendered_context),
            Err(e) => {
                warn!(pattern = %self.match_pattern, error = %e, "Invalid usage pattern regex");
                false
            }
        }
    }

    pub fn hint(&self) -> FixHint {
        FixHint::new(self.prevention_text.clone(), HintSource::UsagePattern)
    }
}

/// Aggregate counters persisted alongside the pattern list.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_observations: u64,
    pub total_blocked: u64,
    pub total_warnings: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatternFile {
    #[serde(default)]
    patterns: Vec<UsagePattern>,
    #[serde(default)]
    stats: AggregateStats,
}

/// Pre-check verdict for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Precheck {
    /// Confidence ≥ 0.95: the call is refused outright
    Block { pattern_id: String, hints: Vec<FixHint> },
    /// Confidence ≥ 0.80: proceed, but warn
    Warn { pattern_ids: Vec<String>, hints: Vec<FixHint> },
    /// Confidence ≥ 0.50: informational hint only
    Info { pattern_ids: Vec<String>, hints: Vec<FixHint> },
    Clear,
}

/// Render the call context the `match` regex is tested against.
pub fn render_call_context(tool: &str, args: &Map<String, Value>) -> String {
    let args_json = serde_json::to_string(args).unwrap_or_default();
    format!("tool={tool} args={args_json}")
}

/// Lowercased word tokens, for Jaccard similarity.
pub fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Jaccard similarity of two token sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// The persisted pattern store. Single-writer (the auto-heal core); reads go
/// against an immutable snapshot; per-tool lookups are cached for five
/// minutes.
pub struct UsagePatternStore {
    store: Store,
    snapshot: RwLock<Arc<PatternFile>>,
    write_lock: Mutex<()>,
    loaded: std::sync::atomic::AtomicBool,
    per_tool: moka::sync::Cache<String, Arc<Vec<UsagePattern>>>,
}

impl UsagePatternStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(PatternFile::default())),
            write_lock: Mutex::new(()),
            loaded: std::sync::atomic::AtomicBool::new(false),
            per_tool: moka::sync::Cache::builder()
                .max_capacity(CACHE_CAP)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    fn current(&self) -> Arc<PatternFile> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install(&self, file: PatternFile) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(file);
    }

    async fn ensure_loaded(&self) {
        use std::sync::atomic::Ordering;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.write_lock.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        match self.store.read_as::<PatternFile>(USAGE_PATTERNS_PATH).await {
            Ok(file) => self.install(file),
            Err(crate::error::OpalError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "Failed to load usage patterns, starting empty"),
        }
        self.loaded.store(true, Ordering::Release);
    }

    async fn persist(&self) {
        let file = self.current();
        if let Err(e) = self.store.write_value(USAGE_PATTERNS_PATH, file.as_ref()).await {
            warn!(error = %e, "Failed to persist usage patterns");
        }
    }

    /// Patterns for one tool, via the five-minute cache.
    pub async fn patterns_for(&self, tool: &str) -> Arc<Vec<UsagePattern>> {
        self.ensure_loaded().await;
        if let Some(cached) = self.per_tool.get(tool) {
            return cached;
        }
        let file = self.current();
        let patterns: Arc<Vec<UsagePattern>> =
            Arc::new(file.patterns.iter().filter(|p| p.tool == tool).cloned().collect());
        self.per_tool.insert(tool.to_string(), patterns.clone());
        patterns
    }

    pub async fn all(&self) -> Vec<UsagePattern> {
        self.ensure_loaded().await;
        self.current().patterns.clone()
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        self.ensure_loaded().await;
        self.current().stats
    }

    /// Install a pattern directly (operator seeding and tests).
    pub async fn insert(&self, pattern: UsagePattern) -> Result<()> {
        self.ensure_loaded().await;
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        self.per_tool.invalidate(&pattern.tool);
        file.patterns.push(pattern);
        self.install(file);
        self.persist().await;
        Ok(())
    }

    /// The pre-call gate. Evaluates every pattern for the tool against the
    /// args and the rendered call context, then tiers by the highest matching
    /// confidence.
    pub async fn precheck(&self, tool: &str, args: &Map<String, Value>) -> Precheck {
        let patterns = self.patterns_for(tool).await;
        if patterns.is_empty() {
            return Precheck::Clear;
        }

        let rendered = render_call_context(tool, args);
        let mut matched: Vec<&UsagePattern> =
            patterns.iter().filter(|p| p.matches_call(args, &rendered)).collect();
        if matched.is_empty() {
            return Precheck::Clear;
        }
        matched.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let top = matched[0];
        let verdict = if top.confidence >= BLOCK_THRESHOLD {
            let verdict = Precheck::Block { pattern_id: top.id.clone(), hints: vec![top.hint()] };
            self.note_shown(&[top.id.clone()], true).await;
            verdict
        } else if top.confidence >= WARN_THRESHOLD {
            let ids: Vec<String> = matched
                .iter()
                .filter(|p| p.confidence >= WARN_THRESHOLD)
                .map(|p| p.id.clone())
                .collect();
            let hints = matched
                .iter()
                .filter(|p| p.confidence >= WARN_THRESHOLD)
                .map(|p| p.hint())
                .collect();
            let verdict = Precheck::Warn { pattern_ids: ids.clone(), hints };
            self.note_shown(&ids, false).await;
            verdict
        } else if top.confidence >= INFO_THRESHOLD {
            let ids: Vec<String> = matched.iter().map(|p| p.id.clone()).collect();
            let hints = matched.iter().map(|p| p.hint()).collect();
            Precheck::Info { pattern_ids: ids, hints }
        } else {
            Precheck::Clear
        };
        verdict
    }

    /// Record that patterns were shown (and, for a block, that the call was
    /// prevented). Blocking does not change `observations`; the misuse did
    /// not happen.
    async fn note_shown(&self, pattern_ids: &[String], blocked: bool) {
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        for pattern in file.patterns.iter_mut() {
            if pattern_ids.contains(&pattern.id) {
                pattern.prevention_stats.shown += 1;
                if blocked {
                    pattern.prevention_stats.prevented += 1;
                    pattern.last_active = Utc::now();
                }
            }
        }
        if blocked {
            file.stats.total_blocked += 1;
        } else {
            file.stats.total_warnings += 1;
        }
        self.install(file);
        self.persist().await;
    }

    /// Feed a warned call's outcome back into prevention stats: a usage
    /// failure after the warning counts against the pattern; success after a
    /// warning counts as a false positive.
    pub async fn record_outcome(&self, pattern_ids: &[String], failed_with_usage: bool) {
        if pattern_ids.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        let mut touched_tools = HashSet::new();
        for pattern in file.patterns.iter_mut() {
            if pattern_ids.contains(&pattern.id) {
                if failed_with_usage {
                    pattern.prevention_stats.failed += 1;
                } else {
                    pattern.prevention_stats.false_positive += 1;
                }
                pattern.recompute_confidence();
                touched_tools.insert(pattern.tool.clone());
            }
        }
        for tool in touched_tools {
            self.per_tool.invalidate(&tool);
        }
        self.install(file);
        self.persist().await;
    }

    /// Post-failure learning: derive a pattern from a usage classification,
    /// fold it into a similar existing one (same tool + category, Jaccard ≥
    /// 0.70 over match+cause tokens) or insert a fresh pattern at 0.5.
    pub async fn learn(&self, tool: &str, error_text: &str, class: &FailureClass) -> Option<UsagePattern> {
        let FailureClass::Usage { category, parameter, expected_format, prerequisite } = class
        else {
            return None;
        };

        self.ensure_loaded().await;
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        let now = Utc::now();

        let derived_match = derive_match_pattern(error_text);
        let cause = derive_cause(*category, parameter, expected_format, prerequisite, error_text);
        let prevention_text = derive_prevention(*category, tool, parameter, expected_format, prerequisite);

        let new_tokens = tokens(&format!("{derived_match} {cause}"));
        let learned = if let Some(existing) = file.patterns.iter_mut().find(|p| {
            p.tool == tool
                && p.category == *category
                && jaccard(&tokens(&format!("{} {}", p.match_pattern, p.cause)), &new_tokens)
                    >= SIMILARITY_THRESHOLD
        }) {
            existing.observations += 1;
            existing.last_seen = now;
            existing.last_active = now;
            existing.recompute_confidence();
            existing.clone()
        } else {
            let pattern = UsagePattern {
                id: uuid::Uuid::new_v4().to_string(),
                tool: tool.to_string(),
                category: *category,
                match_pattern: derived_match,
                cause,
                prevention_text,
                validation_rules: Vec::new(),
                confidence: INITIAL_CONFIDENCE,
                observations: 1,
                prevention_stats: PreventionStats::default(),
                created: now,
                last_seen: now,
                last_active: now,
            };
            file.patterns.push(pattern.clone());
            pattern
        };

        file.stats.total_observations += 1;
        self.per_tool.invalidate(tool);
        self.install(file);
        self.persist().await;
        Some(learned)
    }

    /// Replace the whole pattern list (optimizer commits through this).
    pub(super) async fn replace_all(&self, patterns: Vec<UsagePattern>) {
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        file.patterns = patterns;
        self.per_tool.invalidate_all();
        self.install(file);
        self.persist().await;
    }
}

fn derive_match_pattern(error_text: &str) -> String {
    let first_line = error_text.lines().next().unwrap_or("").trim();
    let truncated: String = first_line.chars().take(120).collect();
    regex::escape(&truncated)
}

fn derive_cause(
    category: UsageCategory,
    parameter: &Option<String>,
    expected_format: &Option<String>,
    prerequisite: &Option<String>,
    error_text: &str,
) -> String {
    match category {
        UsageCategory::IncorrectParameter => match parameter {
            Some(p) => format!("parameter '{p}' had an invalid value"),
            None => "a parameter had an invalid value".to_string(),
        },
        UsageCategory::ParameterFormat => match (parameter, expected_format) {
            (Some(p), Some(f)) => format!("parameter '{p}' must be {f}"),
            (Some(p), None) => format!("parameter '{p}' was malformed"),
            _ => "a parameter was malformed".to_string(),
        },
        UsageCategory::MissingPrerequisite => match prerequisite {
            Some(pre) => format!("missing prerequisite: {pre}"),
            None => "a prerequisite was missing".to_string(),
        },
        UsageCategory::WorkflowSequence => "called out of workflow order".to_string(),
        UsageCategory::WrongTool => {
            let first = error_text.lines().next().unwrap_or("").trim();
            format!("wrong tool for this operation ({first})")
        }
    }
}

fn derive_prevention(
    category: UsageCategory,
    tool: &str,
    parameter: &Option<String>,
    expected_format: &Option<String>,
    prerequisite: &Option<String>,
) -> String {
    match category {
        UsageCategory::IncorrectParameter => match parameter {
            Some(p) => format!("Check the value of '{p}' before calling {tool}"),
            None => format!("Check parameter values before calling {tool}"),
        },
        UsageCategory::ParameterFormat => match (parameter, expected_format) {
            (Some(p), Some(f)) => format!("Format '{p}' as {f} before calling {tool}"),
            (Some(p), None) => format!("Verify the format of '{p}' before calling {tool}"),
            _ => format!("Verify argument formats before calling {tool}"),
        },
        UsageCategory::MissingPrerequisite => match prerequisite {
            Some(pre) => format!("Ensure {pre} exists before calling {tool}"),
            None => format!("Ensure prerequisites are in place before calling {tool}"),
        },
        UsageCategory::WorkflowSequence => {
            format!("Call {tool} in the documented workflow order")
        }
        UsageCategory::WrongTool => format!("{tool} is not the right tool for this operation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UsagePatternStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), Duration::from_millis(10));
        (dir, UsagePatternStore::new(store))
    }

    fn pattern(tool: &str, confidence: f64) -> UsagePattern {
        let now = Utc::now();
        UsagePattern {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            category: UsageCategory::ParameterFormat,
            match_pattern: "will not match anything sensible".to_string(),
            cause: "tag must be a 40-char digest".to_string(),
            prevention_text: "Pass the full 40-character image digest".to_string(),
            validation_rules: vec![ValidationRule::LengthEquals { param: "tag".into(), len: 40 }],
            confidence,
            observations: 10,
            prevention_stats: PreventionStats::default(),
            created: now,
            last_seen: now,
            last_active: now,
        }
    }

    fn args(v: serde_json::Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_block_at_high_confidence() {
        let (_dir, store) = store();
        store.insert(pattern("t_tag", 0.96)).await.unwrap();

        let verdict = store.precheck("t_tag", &args(serde_json::json!({"tag": "abcdef"}))).await;
        match verdict {
            Precheck::Block { hints, .. } => {
                assert!(hints[0].text.contains("40-character"));
            }
            other => panic!("expected block, got {other:?}"),
        }

        // The block recorded a prevention, not an observation
        let all = store.all().await;
        assert_eq!(all[0].observations, 10);
        assert_eq!(all[0].prevention_stats.shown, 1);
        assert_eq!(all[0].prevention_stats.prevented, 1);
    }

    #[tokio::test]
    async fn test_warn_and_info_tiers() {
        let (_dir, warn_store) = store();
        let (_dir2, info_store) = store();

        warn_store.insert(pattern("t_tag", 0.85)).await.unwrap();
        let verdict = warn_store.precheck("t_tag", &args(serde_json::json!({"tag": "short"}))).await;
        assert!(matches!(verdict, Precheck::Warn { .. }));

        info_store.insert(pattern("t_tag", 0.6)).await.unwrap();
        let verdict = info_store.precheck("t_tag", &args(serde_json::json!({"tag": "short"}))).await;
        assert!(matches!(verdict, Precheck::Info { .. }));
    }

    #[tokio::test]
    async fn test_correct_args_pass_clear() {
        let (_dir, store) = store();
        store.insert(pattern("t_tag", 0.96)).await.unwrap();
        let good_tag = "a".repeat(40);
        let verdict = store.precheck("t_tag", &args(serde_json::json!({"tag": good_tag}))).await;
        assert_eq!(verdict, Precheck::Clear);
    }

    #[tokio::test]
    async fn test_learn_creates_then_folds_similar() {
        let (_dir, store) = store();
        let class = FailureClass::Usage {
            category: UsageCategory::MissingPrerequisite,
            parameter: None,
            expected_format: None,
            prerequisite: Some("sprint".to_string()),
        };
        let first = store.learn("jira_move", "no active sprint", &class).await.unwrap();
        assert_eq!(first.observations, 1);
        assert!((first.confidence - 0.5).abs() < 1e-9);

        let second = store.learn("jira_move", "no active sprint", &class).await.unwrap();
        assert_eq!(second.id, first.id, "similar failure folds into the same pattern");
        assert_eq!(second.observations, 2);
        assert!(second.confidence > first.confidence);
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_learn_distinct_tools_stay_separate() {
        let (_dir, store) = store();
        let class = FailureClass::Usage {
            category: UsageCategory::MissingPrerequisite,
            parameter: None,
            expected_format: None,
            prerequisite: Some("sprint".to_string()),
        };
        let _ = store.learn("jira_move", "no active sprint", &class).await;
        let _ = store.learn("jira_close", "no active sprint", &class).await;
        assert_eq!(store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_confidence_formula() {
        // n=1, neutral success rate
        let c1 = UsagePattern::confidence_for(1, 0.5);
        assert!((c1 - (0.5 + (2.0_f64).log10() / 2.0)).abs() < 1e-9);
        // capped at 0.95
        assert!((UsagePattern::confidence_for(10_000, 1.0) - 0.95).abs() < 1e-9);
        // poor prevention record drags it down
        assert!(UsagePattern::confidence_for(10, 0.0) < UsagePattern::confidence_for(10, 1.0));
    }

    #[tokio::test]
    async fn test_monotonic_in_same_session() {
        let (_dir, store) = store();
        let class = FailureClass::Usage {
            category: UsageCategory::IncorrectParameter,
            parameter: Some("key".to_string()),
            expected_format: None,
            prerequisite: None,
        };
        let mut last = 0.0;
        for _ in 0..12 {
            let p = store.learn("t", "invalid value for parameter 'key'", &class).await.unwrap();
            assert!(p.confidence >= last, "confidence must not decrease with observations");
            last = p.confidence;
        }
    }

    #[tokio::test]
    async fn test_record_outcome_feeds_back() {
        let (_dir, store) = store();
        let p = pattern("t", 0.85);
        let id = p.id.clone();
        store.insert(p).await.unwrap();

        store.record_outcome(&[id.clone()], false).await;
        let all = store.all().await;
        assert_eq!(all[0].prevention_stats.false_positive, 1);

        store.record_outcome(&[id], true).await;
        let all = store.all().await;
        assert_eq!(all[0].prevention_stats.failed, 1);
    }

    #[tokio::test]
    async fn test_jaccard() {
        let a = tokens("no active sprint");
        let b = tokens("no active sprint found");
        assert!(jaccard(&a, &b) >= 0.70);
        let c = tokens("completely different words here");
        assert!(jaccard(&a, &c) < 0.70);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let (dir, store) = store();
        store.insert(pattern("t", 0.9)).await.unwrap();
        store.store.flush_all().await.unwrap();

        let reopened = UsagePatternStore::new(Store::new(dir.path(), Duration::from_millis(10)));
        let all = reopened.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].validation_rules.len(), 1);
        assert_eq!(all[0].category, UsageCategory::ParameterFormat);
    }
}
