// crates/opal-server/src/skills/context.rs
// Per-run execution state: bindings, step results, cancellation, tool cache

use chrono::{DateTime, Utc};
use opal_types::ToolError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Cooperative cancellation: checked at every suspension point. Tools that
/// are mid-flight run to completion; their results are discarded.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves when cancellation trips; immediately if already tripped.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Skipped,
    Success,
    Failed,
    Healing,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Skipped | StepStatus::Success | StepStatus::Failed)
    }
}

/// Outcome record for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub retries: u32,
}

impl StepResult {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            started: None,
            ended: None,
            duration_ms: 0,
            raw_result: None,
            error: None,
            retries: 0,
        }
    }
}

struct CachedCall {
    value: Value,
    stored: Instant,
    ttl: Duration,
}

/// The per-run record. Exists only for the duration of one skill execution;
/// tools never see it directly, only their rendered argument maps.
pub struct ExecutionContext {
    pub execution_id: String,
    pub workspace_uri: String,
    pub session_id: Option<String>,
    pub inputs: Map<String, Value>,
    /// Read-only configuration snapshot
    pub config: Value,
    pub cancel: CancelToken,
    bindings: RwLock<Map<String, Value>>,
    step_results: RwLock<HashMap<String, StepResult>>,
    call_cache: RwLock<HashMap<String, CachedCall>>,
}

impl ExecutionContext {
    pub fn new(
        workspace_uri: &str,
        session_id: Option<String>,
        inputs: Map<String, Value>,
        config: Value,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workspace_uri: workspace_uri.to_string(),
            session_id,
            inputs,
            config,
            cancel: CancelToken::new(),
            bindings: RwLock::new(Map::new()),
            step_results: RwLock::new(HashMap::new()),
            call_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Commit a step's binding. Bindings commit atomically per step, which is
    /// what parallel groups rely on.
    pub fn bind(&self, name: &str, value: Value) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.insert(name.to_string(), value);
    }

    pub fn binding(&self, name: &str) -> Option<Value> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings.get(name).cloned()
    }

    pub fn bindings_snapshot(&self) -> Map<String, Value> {
        self.bindings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_step_result(&self, result: StepResult) {
        let mut results = self.step_results.write().unwrap_or_else(|e| e.into_inner());
        results.insert(result.step_id.clone(), result);
    }

    pub fn step_result(&self, step_id: &str) -> Option<StepResult> {
        let results = self.step_results.read().unwrap_or_else(|e| e.into_inner());
        results.get(step_id).cloned()
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_result(step_id).map(|r| r.status)
    }

    /// Counters for the completion event.
    pub fn tally(&self) -> (usize, usize, usize) {
        let results = self.step_results.read().unwrap_or_else(|e| e.into_inner());
        let mut completed = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for result in results.values() {
            match result.status {
                StepStatus::Success => completed += 1,
                StepStatus::Skipped => skipped += 1,
                StepStatus::Failed => failed += 1,
                _ => {}
            }
        }
        (completed, skipped, failed)
    }

    /// The evaluation scope: inputs, config, session and every committed
    /// binding, visible to templates, conditions, and compute blocks.
    pub fn scope(&self) -> Map<String, Value> {
        let mut scope = Map::new();
        scope.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        scope.insert("config".to_string(), self.config.clone());
        scope.insert(
            "session".to_string(),
            serde_json::json!({
                "id": self.session_id,
                "workspace": self.workspace_uri,
                "execution_id": self.execution_id,
            }),
        );
        for (name, value) in self.bindings_snapshot() {
            scope.insert(name, value);
        }
        scope
    }

    /// Look up a cached tool result within this execution.
    pub fn cached_call(&self, key: &str) -> Option<Value> {
        let cache = self.call_cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(key).and_then(|entry| {
            if entry.stored.elapsed() <= entry.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn cache_call(&self, key: String, value: Value, ttl: Duration) {
        let mut cache = self.call_cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, CachedCall { value, stored: Instant::now(), ttl });
    }
}
