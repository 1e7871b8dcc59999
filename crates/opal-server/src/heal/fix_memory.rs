// crates/opal-server/src/heal/fix_memory.rs
// Persistent fix memory: known failures and their remedies, per tool

use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use opal_types::{FixHint, HintSource};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::warn;

/// Document path under the config root.
pub const TOOL_FIXES_PATH: &str = "learned/tool_fixes.yaml";

/// Confidence ceiling: a fix never becomes a certainty.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Derived patterns keep at most this much of the error text.
const DERIVED_PATTERN_CHARS: usize = 120;

/// One learned failure → remedy association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub tool_name: String,
    /// Regex matched against error text
    pub error_pattern: String,
    pub root_cause: String,
    pub fix_text: String,
    pub confidence: f64,
    pub observations: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FixRecord {
    /// Confidence grows with observations, capped at [`MAX_CONFIDENCE`].
    pub fn confidence_for(observations: u64) -> f64 {
        let grown = 0.5 + ((observations as f64) + 1.0).log10() / 2.0;
        grown.min(MAX_CONFIDENCE)
    }

    pub fn matches(&self, tool_name: &str, error_text: &str) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        match regex::Regex::new(&self.error_pattern) {
            Ok(re) => re.is_match(error_text),
            Err(e) => {
                warn!(pattern = %self.error_pattern, error = %e, "Invalid fix pattern, skipping");
                false
            }
        }
    }

    /// Rendered hint surfaced on matching errors.
    pub fn hint(&self) -> FixHint {
        FixHint::new(
            format!(
                "{} (cause: {}; seen {}x, confidence {:.2})",
                self.fix_text, self.root_cause, self.observations, self.confidence
            ),
            HintSource::FixMemory,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FixFile {
    #[serde(default)]
    fixes: Vec<FixRecord>,
}

/// The fix memory: single-writer (the auto-heal core), snapshot reads.
pub struct FixMemory {
    store: Store,
    snapshot: RwLock<Arc<FixFile>>,
    /// Serializes mutations; readers never take it
    write_lock: Mutex<()>,
    loaded: std::sync::atomic::AtomicBool,
}

impl FixMemory {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(FixFile::default())),
            write_lock: Mutex::new(()),
            loaded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn current(&self) -> Arc<FixFile> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install(&self, file: FixFile) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(file);
    }

    /// Load from disk once. Store failures degrade to an empty memory.
    async fn ensure_loaded(&self) {
        use std::sync::atomic::Ordering;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.write_lock.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        match self.store.read_as::<FixFile>(TOOL_FIXES_PATH).await {
            Ok(file) => self.install(file),
            Err(crate::error::OpalError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "Failed to load fix memory, starting empty"),
        }
        self.loaded.store(true, Ordering::Release);
    }

    async fn persist(&self) {
        let file = self.current();
        if let Err(e) = self.store.write_value(TOOL_FIXES_PATH, file.as_ref()).await {
            warn!(error = %e, "Failed to persist fix memory");
        }
    }

    /// Records matching a failure, most confident first.
    pub async fn lookup(&self, tool_name: &str, error_text: &str) -> Vec<FixRecord> {
        self.ensure_loaded().await;
        let file = self.current();
        let mut matches: Vec<FixRecord> = file
            .fixes
            .iter()
            .filter(|f| f.matches(tool_name, error_text))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        matches
    }

    /// Records for `check_known_issues`: filter by tool and/or error text.
    pub async fn search(&self, tool_name: Option<&str>, error_text: Option<&str>) -> Vec<FixRecord> {
        self.ensure_loaded().await;
        let file = self.current();
        file.fixes
            .iter()
            .filter(|f| tool_name.is_none_or(|t| f.tool_name == t))
            .filter(|f| match error_text {
                Some(text) => f.matches(&f.tool_name, text),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Insert or update a record (the `learn_tool_fix` surface). Keyed by
    /// (tool_name, error_pattern).
    pub async fn learn(
        &self,
        tool_name: &str,
        error_pattern: &str,
        root_cause: &str,
        fix_text: &str,
    ) -> Result<FixRecord> {
        // Reject patterns that will never match
        regex::Regex::new(error_pattern)
            .map_err(|e| crate::error::OpalError::Validation(format!("bad error_pattern: {e}")))?;

        self.ensure_loaded().await;
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        let now = Utc::now();

        let record = if let Some(existing) = file
            .fixes
            .iter_mut()
            .find(|f| f.tool_name == tool_name && f.error_pattern == error_pattern)
        {
            existing.observations += 1;
            existing.root_cause = root_cause.to_string();
            existing.fix_text = fix_text.to_string();
            existing.last_seen = now;
            existing.confidence = FixRecord::confidence_for(existing.observations);
            existing.clone()
        } else {
            let record = FixRecord {
                tool_name: tool_name.to_string(),
                error_pattern: error_pattern.to_string(),
                root_cause: root_cause.to_string(),
                fix_text: fix_text.to_string(),
                confidence: FixRecord::confidence_for(1),
                observations: 1,
                first_seen: now,
                last_seen: now,
            };
            file.fixes.push(record.clone());
            record
        };

        self.install(file);
        self.persist().await;
        Ok(record)
    }

    /// Bookkeeping after a successful remediation: bump every matching record.
    /// When none matches, a derived record is created so the outcome survives
    /// for a later `learn_tool_fix` to refine.
    pub async fn record_applied(&self, tool_name: &str, error_text: &str, action: &str) {
        self.ensure_loaded().await;
        let _guard = self.write_lock.lock().await;
        let mut file = (*self.current()).clone();
        let now = Utc::now();

        let mut matched = false;
        for fix in file.fixes.iter_mut() {
            if fix.matches(tool_name, error_text) {
                fix.observations += 1;
                fix.last_seen = now;
                fix.confidence = FixRecord::confidence_for(fix.observations);
                matched = true;
            }
        }

        if !matched {
            let first_line = error_text.lines().next().unwrap_or("").trim();
            let truncated: String = first_line.chars().take(DERIVED_PATTERN_CHARS).collect();
            file.fixes.push(FixRecord {
                tool_name: tool_name.to_string(),
                error_pattern: regex::escape(&truncated),
                root_cause: format!("remediated by {action}"),
                fix_text: format!("Run {action}, then retry"),
                confidence: FixRecord::confidence_for(1),
                observations: 1,
                first_seen: now,
                last_seen: now,
            });
        }

        self.install(file);
        self.persist().await;
    }
}
