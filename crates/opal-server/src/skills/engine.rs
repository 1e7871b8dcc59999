// crates/opal-server/src/skills/engine.rs
// The skill executor: ordering, conditions, loops, retries, confirmations

use super::context::{ExecutionContext, StepResult, StepStatus};
use super::template;
use super::{ConfirmDef, OnError, SkillDef, StepDef, expr, load_skill};
use crate::bus::EventBus;
use crate::error::{OpalError, Result};
use crate::registry::ToolRegistry;
use opal_types::{BusEvent, ErrorKind, StepSummary, ToolError};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Exponential backoff for `retry:N`: base 1 s, cap 30 s.
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Poll cadence while waiting for a dependency to settle.
const DEP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one skill run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkillOutcome {
    pub execution_id: String,
    pub skill_name: String,
    pub success: bool,
    pub cancelled: bool,
    pub outputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    pub duration_ms: u64,
    pub steps_completed: usize,
    pub steps_skipped: usize,
    pub steps_failed: usize,
}

enum StepEnd {
    Done,
    Abort { error: ToolError },
    Cancelled,
}

enum RunEnd {
    Completed,
    Failed { step_id: String, error: ToolError },
    Cancelled,
}

/// The deterministic executor for YAML skills. Owns the active execution
/// contexts; everything else reaches tools through the registry.
pub struct SkillEngine {
    root: PathBuf,
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    config_snapshot: Value,
    executions: Mutex<HashMap<String, Arc<ExecutionContext>>>,
}

impl SkillEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        registry: Arc<ToolRegistry>,
        bus: EventBus,
        config_snapshot: Value,
    ) -> Self {
        Self {
            root: root.into(),
            registry,
            bus,
            config_snapshot,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Skill names available on disk.
    pub fn list(&self) -> Vec<String> {
        super::list_skills(&self.root)
    }

    /// Trip an execution's cancellation token. Pending confirmations resolve
    /// to their defaults so the run reaches a terminal state promptly.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let executions = self.executions.lock().await;
        match executions.get(execution_id) {
            Some(ctx) => {
                info!(execution_id, "Skill cancellation requested");
                ctx.cancel.cancel();
                self.bus.drop_confirmations_for(execution_id).await;
                true
            }
            None => false,
        }
    }

    /// Execute a skill end to end. The definition is re-read from disk, so
    /// edits apply to the next run without a restart.
    pub async fn run(
        &self,
        skill_name: &str,
        inputs: &Value,
        workspace_uri: &str,
        session_id: Option<String>,
    ) -> Result<SkillOutcome> {
        let skill = load_skill(&self.root, skill_name)?;

        let resolved = match skill.resolve_inputs(inputs) {
            Ok(resolved) => resolved,
            Err(e) => {
                // Invalid inputs are a terminal failure of this run
                self.bus.emit(
                    BusEvent::SkillFailed {
                        skill_name: skill.name.clone(),
                        error: e.to_string(),
                        failed_step_id: None,
                        duration_ms: 0,
                        partial_outputs: Value::Object(Map::new()),
                    },
                    None,
                );
                return Err(e);
            }
        };

        let ctx = Arc::new(ExecutionContext::new(
            workspace_uri,
            session_id,
            resolved,
            self.config_snapshot.clone(),
        ));
        let execution_id = ctx.execution_id.clone();
        {
            let mut executions = self.executions.lock().await;
            executions.insert(execution_id.clone(), ctx.clone());
        }
        self.bus.execution_started();
        let started = Instant::now();

        self.bus.emit(
            BusEvent::SkillStarted {
                skill_name: skill.name.clone(),
                inputs: Value::Object(ctx.inputs.clone()),
                steps: skill
                    .steps
                    .iter()
                    .map(|s| StepSummary {
                        id: s.id.clone(),
                        kind: s.kind().to_string(),
                        tool: s.tool.clone(),
                    })
                    .collect(),
            },
            Some(execution_id.clone()),
        );

        let end = self.run_steps(&skill, &ctx).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let (steps_completed, steps_skipped, steps_failed) = ctx.tally();
        let outcome = match end {
            RunEnd::Completed => {
                let outputs = self.render_outputs(&skill, &ctx);
                self.bus.emit(
                    BusEvent::SkillCompleted {
                        skill_name: skill.name.clone(),
                        success: true,
                        duration_ms,
                        outputs: outputs.clone(),
                        steps_completed,
                        steps_skipped,
                        steps_failed,
                    },
                    Some(execution_id.clone()),
                );
                SkillOutcome {
                    execution_id: execution_id.clone(),
                    skill_name: skill.name.clone(),
                    success: true,
                    cancelled: false,
                    outputs,
                    error: None,
                    failed_step_id: None,
                    duration_ms,
                    steps_completed,
                    steps_skipped,
                    steps_failed,
                }
            }
            RunEnd::Failed { step_id, error } => {
                let partial = Value::Object(ctx.bindings_snapshot());
                self.bus.emit(
                    BusEvent::SkillFailed {
                        skill_name: skill.name.clone(),
                        error: error.message.clone(),
                        failed_step_id: Some(step_id.clone()),
                        duration_ms,
                        partial_outputs: partial.clone(),
                    },
                    Some(execution_id.clone()),
                );
                SkillOutcome {
                    execution_id: execution_id.clone(),
                    skill_name: skill.name.clone(),
                    success: false,
                    cancelled: false,
                    outputs: partial,
                    error: Some(error.message),
                    failed_step_id: Some(step_id),
                    duration_ms,
                    steps_completed,
                    steps_skipped,
                    steps_failed,
                }
            }
            RunEnd::Cancelled => {
                let partial = Value::Object(ctx.bindings_snapshot());
                self.bus.emit(
                    BusEvent::SkillFailed {
                        skill_name: skill.name.clone(),
                        error: "cancelled".to_string(),
                        failed_step_id: None,
                        duration_ms,
                        partial_outputs: partial.clone(),
                    },
                    Some(execution_id.clone()),
                );
                SkillOutcome {
                    execution_id: execution_id.clone(),
                    skill_name: skill.name.clone(),
                    success: false,
                    cancelled: true,
                    outputs: partial,
                    error: Some("cancelled".to_string()),
                    failed_step_id: None,
                    duration_ms,
                    steps_completed,
                    steps_skipped,
                    steps_failed,
                }
            }
        };

        {
            let mut executions = self.executions.lock().await;
            executions.remove(&execution_id);
        }
        self.bus.execution_finished();
        Ok(outcome)
    }

    /// Walk steps in declaration order; a `parallel_group` runs all of its
    /// members concurrently the first time the group is reached.
    async fn run_steps(&self, skill: &SkillDef, ctx: &Arc<ExecutionContext>) -> RunEnd {
        let mut executed_groups: HashSet<u32> = HashSet::new();

        for (index, step) in skill.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return RunEnd::Cancelled;
            }

            if let Some(group) = step.parallel_group {
                if !executed_groups.insert(group) {
                    continue;
                }
                let members: Vec<(usize, &StepDef)> = skill
                    .steps
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.parallel_group == Some(group))
                    .collect();
                let futures = members
                    .iter()
                    .map(|(i, s)| self.run_step(skill, s, *i, ctx))
                    .collect::<Vec<_>>();
                let ends = futures::future::join_all(futures).await;
                let mut cancelled = false;
                for (end, (_, member)) in ends.into_iter().zip(members) {
                    match end {
                        StepEnd::Done => {}
                        StepEnd::Abort { error } => {
                            return RunEnd::Failed { step_id: member.id.clone(), error };
                        }
                        StepEnd::Cancelled => cancelled = true,
                    }
                }
                if cancelled {
                    return RunEnd::Cancelled;
                }
            } else {
                match self.run_step(skill, step, index, ctx).await {
                    StepEnd::Done => {}
                    StepEnd::Abort { error } => {
                        return RunEnd::Failed { step_id: step.id.clone(), error };
                    }
                    StepEnd::Cancelled => return RunEnd::Cancelled,
                }
            }
        }
        RunEnd::Completed
    }

    async fn run_step(
        &self,
        skill: &SkillDef,
        step: &StepDef,
        step_index: usize,
        ctx: &Arc<ExecutionContext>,
    ) -> StepEnd {
        if ctx.cancel.is_cancelled() {
            return StepEnd::Cancelled;
        }

        // Dependency gate: wait until every listed step has a terminal
        // status, then a skipped or failed dependency skips this step,
        // unless the condition inspects that dependency's result (the
        // recovery-step escape hatch). Validation rules out edges inside one
        // parallel group, so the wait always settles.
        for dep in &step.depends_on {
            let dep_status = loop {
                match ctx.step_status(dep) {
                    Some(status) if status.is_terminal() => break status,
                    _ => {
                        if ctx.cancel.is_cancelled() {
                            return StepEnd::Cancelled;
                        }
                        tokio::time::sleep(DEP_POLL_INTERVAL).await;
                    }
                }
            };
            if matches!(dep_status, StepStatus::Skipped | StepStatus::Failed) {
                let condition_sees_dep = step
                    .condition
                    .as_deref()
                    .map(|c| template::expr_roots(c).iter().any(|r| r == dep))
                    .unwrap_or(false);
                if !condition_sees_dep {
                    let reason = format!(
                        "dependency '{dep}' {}",
                        if dep_status == StepStatus::Failed { "failed" } else { "skipped" }
                    );
                    self.record_skip(ctx, step, &reason);
                    return StepEnd::Done;
                }
            }
        }

        // Condition gate
        let mut scope = ctx.scope();
        if let Some(condition) = &step.condition {
            match expr::eval_condition(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    self.record_skip(ctx, step, "condition false");
                    return StepEnd::Done;
                }
                Err(e) => {
                    let error = ToolError::new(
                        ErrorKind::Validation,
                        format!("condition on step '{}': {e}", step.id),
                    );
                    return self.finish_failed(ctx, step, error, 0, Instant::now());
                }
            }
        }

        // In-flight confirmation: blocks this step only
        if let Some(confirm) = skill.confirmation_for(step) {
            let answer = self.await_confirmation(ctx, step, &confirm).await;
            scope.insert("confirm_answer".to_string(), Value::String(answer));
        }
        if ctx.cancel.is_cancelled() {
            return StepEnd::Cancelled;
        }

        let started = Instant::now();
        let started_at = chrono::Utc::now();
        let mut result_record = StepResult::pending(&step.id);
        result_record.status = StepStatus::Running;
        result_record.started = Some(started_at);
        ctx.set_step_result(result_record);

        // Render tool args just before execution, not at parse time
        let rendered_args = if step.tool.is_some() && step.loop_expr.is_none() {
            match self.render_args(step, &scope) {
                Ok(args) => Some(args),
                Err(e) => {
                    self.emit_step_started(ctx, step, step_index, None);
                    return self.finish_failed(ctx, step, e, 0, started);
                }
            }
        } else {
            None
        };

        self.emit_step_started(ctx, step, step_index, rendered_args.clone());

        // Attempt loop: `retry:N` means up to N additional attempts
        let max_attempts = match step.on_error {
            OnError::Retry(n) => n + 1,
            _ => 1,
        };
        let mut retries = 0u32;
        let mut last_error: Option<ToolError> = None;

        for attempt in 0..max_attempts {
            if ctx.cancel.is_cancelled() {
                return StepEnd::Cancelled;
            }
            if attempt > 0 {
                retries += 1;
                let backoff = Duration::from_secs(
                    (BACKOFF_BASE_SECS << (attempt - 1).min(5)).min(BACKOFF_CAP_SECS),
                );
                debug!(step = %step.id, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying step");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancel.cancelled() => return StepEnd::Cancelled,
                }
            }

            match self.execute_body(step, ctx, &scope, rendered_args.clone()).await {
                Ok(value) => {
                    return self.finish_success(ctx, step, value, retries, started);
                }
                Err(BodyError::Cancelled) => return StepEnd::Cancelled,
                Err(BodyError::Failed(error)) => {
                    warn!(step = %step.id, attempt, error = %error.message, "Step attempt failed");
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ToolError::new(ErrorKind::Internal, format!("step '{}' produced no result", step.id))
        });
        self.finish_failed(ctx, step, error, retries, started)
    }

    async fn execute_body(
        &self,
        step: &StepDef,
        ctx: &Arc<ExecutionContext>,
        scope: &Map<String, Value>,
        rendered_args: Option<Map<String, Value>>,
    ) -> std::result::Result<Value, BodyError> {
        if let (Some(loop_expr), Some(loop_var)) = (&step.loop_expr, &step.loop_var) {
            let sequence = expr::eval_expr(loop_expr, scope)
                .map_err(|e| BodyError::Failed(ToolError::new(ErrorKind::Validation, e.to_string())))?;
            let Value::Array(items) = sequence else {
                return Err(BodyError::Failed(ToolError::new(
                    ErrorKind::Validation,
                    format!("loop expression on step '{}' is not a sequence", step.id),
                )));
            };

            let mut collected = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(BodyError::Cancelled);
                }
                let mut iter_scope = scope.clone();
                iter_scope.insert(loop_var.clone(), item);
                let value = self.execute_once(step, ctx, &iter_scope).await.map_err(|e| {
                    match e {
                        BodyError::Failed(err) => BodyError::Failed(ToolError {
                            message: format!("iteration {i}: {}", err.message),
                            ..err
                        }),
                        other => other,
                    }
                })?;
                collected.push(value);
            }
            return Ok(Value::Array(collected));
        }

        match rendered_args {
            Some(args) => self.invoke_tool(step, ctx, args).await,
            None => self.execute_once(step, ctx, scope).await,
        }
    }

    /// One tool call or compute evaluation with the given scope.
    async fn execute_once(
        &self,
        step: &StepDef,
        ctx: &Arc<ExecutionContext>,
        scope: &Map<String, Value>,
    ) -> std::result::Result<Value, BodyError> {
        if step.tool.is_some() {
            let args = self.render_args(step, scope).map_err(BodyError::Failed)?;
            return self.invoke_tool(step, ctx, args).await;
        }

        let code = step.compute.clone().unwrap_or_default();
        let timeout = step
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(expr::DEFAULT_COMPUTE_TIMEOUT);
        match expr::eval_compute(code, scope.clone(), timeout).await {
            Ok(value) => Ok(value),
            Err(OpalError::Timeout(msg)) => {
                Err(BodyError::Failed(ToolError::new(ErrorKind::Timeout, msg)))
            }
            Err(e) => Err(BodyError::Failed(ToolError::new(
                ErrorKind::Validation,
                format!("compute step '{}': {e}", step.id),
            ))),
        }
    }

    fn render_args(&self, step: &StepDef, scope: &Map<String, Value>) -> std::result::Result<Map<String, Value>, ToolError> {
        let raw = Value::Object(step.args.clone().into_iter().collect());
        let rendered = template::render_value(&raw, scope)
            .map_err(|e| ToolError::new(ErrorKind::Validation, e.to_string()))?;
        match rendered {
            Value::Object(map) => Ok(map),
            _ => Err(ToolError::new(
                ErrorKind::Validation,
                format!("args of step '{}' did not render to an object", step.id),
            )),
        }
    }

    async fn invoke_tool(
        &self,
        step: &StepDef,
        ctx: &Arc<ExecutionContext>,
        args: Map<String, Value>,
    ) -> std::result::Result<Value, BodyError> {
        let tool_name = step.tool.clone().unwrap_or_default();

        // Per-execution result cache keyed by (tool, rendered args)
        let cache_key = step.cache_ttl.map(|_| {
            let mut hasher = Sha256::new();
            hasher.update(tool_name.as_bytes());
            hasher.update(serde_json::to_vec(&args).unwrap_or_default());
            format!("{:x}", hasher.finalize())
        });
        if let (Some(key), Some(_ttl)) = (&cache_key, step.cache_ttl) {
            if let Some(cached) = ctx.cached_call(key) {
                debug!(step = %step.id, tool = %tool_name, "Tool cache hit");
                return Ok(cached);
            }
        }

        let registry = self.registry.clone();
        let invoke_name = tool_name.clone();
        let invoke_args = args.clone();
        // Spawned so a cancel or timeout leaves the tool to finish on its
        // own; the result is simply discarded.
        let mut handle =
            tokio::spawn(async move { registry.invoke_with_report(&invoke_name, invoke_args).await });

        let timeout = step.timeout_s.map(Duration::from_secs);
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = ctx.cancel.cancelled() => {
                debug!(step = %step.id, "Cancelled mid-flight; tool left to complete");
                return Err(BodyError::Cancelled);
            }
            _ = sleep_opt(timeout) => {
                return Err(BodyError::Failed(ToolError::new(
                    ErrorKind::Timeout,
                    format!("step '{}' timed out after {}s", step.id, step.timeout_s.unwrap_or(0)),
                )));
            }
        };

        let (result, report) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                return Err(BodyError::Failed(ToolError::new(
                    ErrorKind::Internal,
                    format!("tool task failed: {join_err}"),
                )));
            }
        };

        for attempt in &report.attempts {
            self.bus.emit(
                BusEvent::AutoHealTriggered {
                    step_id: step.id.clone(),
                    failure_type: attempt.failure_type.clone(),
                    action: attempt.action.clone(),
                    retry_count: attempt.retry_count,
                    max_retries: attempt.max_retries,
                },
                Some(ctx.execution_id.clone()),
            );
        }

        match result {
            Ok(value) => {
                if let (Some(key), Some(ttl)) = (cache_key, step.cache_ttl) {
                    ctx.cache_call(key, value.clone(), Duration::from_secs(ttl));
                }
                Ok(value)
            }
            Err(error) => Err(BodyError::Failed(error)),
        }
    }

    async fn await_confirmation(
        &self,
        ctx: &Arc<ExecutionContext>,
        step: &StepDef,
        confirm: &ConfirmDef,
    ) -> String {
        let options = confirm.options.iter().map(|o| o.to_option()).collect();
        self.bus
            .await_confirmation(
                &ctx.execution_id,
                &step.id,
                &confirm.message,
                options,
                confirm.default.clone(),
                Duration::from_secs(confirm.timeout_s),
            )
            .await
    }

    fn emit_step_started(
        &self,
        ctx: &Arc<ExecutionContext>,
        step: &StepDef,
        step_index: usize,
        args: Option<Map<String, Value>>,
    ) {
        self.bus.emit(
            BusEvent::StepStarted {
                step_id: step.id.clone(),
                step_index,
                step_type: step.kind().to_string(),
                tool_name: step.tool.clone(),
                args: args.map(Value::Object),
            },
            Some(ctx.execution_id.clone()),
        );
    }

    fn record_skip(&self, ctx: &Arc<ExecutionContext>, step: &StepDef, reason: &str) {
        let mut record = StepResult::pending(&step.id);
        record.status = StepStatus::Skipped;
        ctx.set_step_result(record);
        self.bus.emit(
            BusEvent::StepSkipped { step_id: step.id.clone(), reason: reason.to_string() },
            Some(ctx.execution_id.clone()),
        );
    }

    fn finish_success(
        &self,
        ctx: &Arc<ExecutionContext>,
        step: &StepDef,
        value: Value,
        retries: u32,
        started: Instant,
    ) -> StepEnd {
        let duration_ms = started.elapsed().as_millis() as u64;
        ctx.bind(&step.id, value.clone());
        if step.binding() != step.id {
            ctx.bind(step.binding(), value.clone());
        }
        ctx.set_step_result(StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Success,
            started: ctx.step_result(&step.id).and_then(|r| r.started),
            ended: Some(chrono::Utc::now()),
            duration_ms,
            raw_result: Some(value.clone()),
            error: None,
            retries,
        });
        self.bus.emit(
            BusEvent::StepCompleted {
                step_id: step.id.clone(),
                success: true,
                duration_ms,
                result: Some(value),
            },
            Some(ctx.execution_id.clone()),
        );
        StepEnd::Done
    }

    fn finish_failed(
        &self,
        ctx: &Arc<ExecutionContext>,
        step: &StepDef,
        error: ToolError,
        retries: u32,
        started: Instant,
    ) -> StepEnd {
        let duration_ms = started.elapsed().as_millis() as u64;
        ctx.set_step_result(StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            started: ctx.step_result(&step.id).and_then(|r| r.started),
            ended: Some(chrono::Utc::now()),
            duration_ms,
            raw_result: None,
            error: Some(error.clone()),
            retries,
        });
        self.bus.emit(
            BusEvent::StepCompleted {
                step_id: step.id.clone(),
                success: false,
                duration_ms,
                result: None,
            },
            Some(ctx.execution_id.clone()),
        );

        match step.on_error {
            OnError::Continue => {
                // Bind the error shape so later steps can inspect it
                ctx.bind(
                    &step.id,
                    serde_json::json!({
                        "error": {
                            "kind": error.kind.as_str(),
                            "message": error.message,
                            "hints": error.hints,
                        }
                    }),
                );
                StepEnd::Done
            }
            _ => StepEnd::Abort { error },
        }
    }

    fn render_outputs(&self, skill: &SkillDef, ctx: &Arc<ExecutionContext>) -> Value {
        let scope = ctx.scope();
        let mut outputs = Map::new();
        for (key, template_text) in &skill.outputs {
            match template::render_template(template_text, &scope) {
                Ok(value) => {
                    outputs.insert(key.clone(), value);
                }
                Err(e) => {
                    warn!(output = key, error = %e, "Failed to render skill output");
                    outputs.insert(key.clone(), Value::Null);
                }
            }
        }
        Value::Object(outputs)
    }
}

enum BodyError {
    Failed(ToolError),
    Cancelled,
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
