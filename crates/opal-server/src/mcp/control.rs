// crates/opal-server/src/mcp/control.rs
// The core control tools: always registered, never unloaded

use super::OpalServer;
use crate::error::Result;
use crate::registry::{Tool, ToolResult};
use opal_types::{ErrorKind, FixHint, HintSource, ToolError};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;

fn invalid(message: impl Into<String>) -> ToolError {
    ToolError::new(ErrorKind::Validation, message)
}

fn internal(message: impl std::fmt::Display) -> ToolError {
    ToolError::new(ErrorKind::Internal, message.to_string())
}

/// The dispatch layer injects the resolved workspace URI under this key.
pub const WORKSPACE_ARG: &str = "workspace_uri";

fn workspace_of(args: &Map<String, Value>) -> std::result::Result<String, ToolError> {
    args.get(WORKSPACE_ARG)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(format!("missing required parameter '{WORKSPACE_ARG}'")))
}

// Request types for the core tools. Their derived schemas are what MCP
// clients see in `list_tools`; the injected workspace key rides alongside and
// is ignored by deserialization.

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PersonaLoadRequest {
    #[schemars(description = "Persona name")]
    pub name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionStartRequest {
    #[schemars(description = "Session name")]
    pub name: Option<String>,
    #[schemars(description = "Session to resume. An unknown id creates a fresh session.")]
    pub session_id: Option<String>,
    #[schemars(description = "Calling agent identifier")]
    pub agent: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionInfoRequest {
    #[schemars(description = "Session id; defaults to the active session")]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionSwitchRequest {
    #[schemars(description = "Session to make active")]
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SkillRunRequest {
    #[schemars(description = "Skill name")]
    pub name: String,
    #[schemars(description = "Skill inputs: object, or JSON-encoded string")]
    pub inputs_json: Option<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SkillCancelRequest {
    #[schemars(description = "Execution to cancel")]
    pub execution_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebugToolRequest {
    #[schemars(description = "Tool to inspect")]
    pub tool_name: String,
    #[schemars(description = "Error text to match hints against")]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LearnToolFixRequest {
    #[schemars(description = "Tool the fix applies to")]
    pub tool_name: String,
    #[schemars(description = "Regex matched against error text")]
    pub error_pattern: String,
    #[schemars(description = "Root cause of the failure")]
    pub root_cause: String,
    #[schemars(description = "How to fix it")]
    pub fix_description: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CheckKnownIssuesRequest {
    #[schemars(description = "Filter by tool")]
    pub tool_name: Option<String>,
    #[schemars(description = "Filter by matching error text")]
    pub error_text: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryReadRequest {
    #[schemars(description = "Memory key, e.g. state/notes")]
    pub key: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryWriteRequest {
    #[schemars(description = "Memory key, e.g. state/notes")]
    pub key: String,
    #[schemars(description = "Document content")]
    pub content: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryUpdateRequest {
    #[schemars(description = "Memory key, e.g. state/notes")]
    pub key: String,
    #[schemars(description = "Dotted path, e.g. sprint.active_issue")]
    pub pointer: String,
    #[serde(default)]
    #[schemars(description = "Value to set")]
    pub value: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryAppendRequest {
    #[schemars(description = "Memory key, e.g. state/notes")]
    pub key: String,
    #[schemars(description = "Dotted path of the list")]
    pub pointer: String,
    #[serde(default)]
    #[schemars(description = "Item to append")]
    pub item: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryQueryRequest {
    #[schemars(description = "Memory key, e.g. state/notes")]
    pub key: String,
    #[schemars(description = "Dotted query path; `*` fans out")]
    pub path: String,
}

/// Parameterless tools still list an (empty) object schema.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EmptyRequest {}

/// Derived parameter schema for a request type, as a plain JSON object.
fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

/// Deserialize the argument map into a typed request.
fn parse_req<T: serde::de::DeserializeOwned>(args: &Map<String, Value>) -> std::result::Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| invalid(format!("invalid arguments: {e}")))
}

/// Map a memory key to its document path: `state/notes` →
/// `memory/state/notes.yaml`. Escapes are rejected by the store itself.
fn memory_path(key: &str) -> std::result::Result<String, ToolError> {
    if key.is_empty() {
        return Err(invalid("memory key must not be empty"));
    }
    let with_ext = if key.ends_with(".yaml") || key.ends_with(".yml") || key.ends_with(".json") {
        key.to_string()
    } else {
        format!("{key}.yaml")
    };
    Ok(format!("memory/{with_ext}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> ToolResult {
    serde_json::to_value(value).map_err(internal)
}

/// Build a core tool from a typed request and an async closure.
fn core_tool<R, F, Fut>(name: &str, description: &str, f: F) -> Tool
where
    R: JsonSchema,
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    Tool::new(name, description, schema_value::<R>(), Arc::new(move |args| Box::pin(f(args))))
        .with_module("core")
        .with_origin(format!("core::{name}"))
}

/// Install the stable control surface into the registry's protected set.
pub fn register_core_tools(server: &OpalServer) -> Result<()> {
    let tools = build_core_tools(server);
    for tool in tools {
        server.registry.register_core(tool)?;
    }
    Ok(())
}

fn build_core_tools(server: &OpalServer) -> Vec<Tool> {
    let mut tools = Vec::new();

    // ── Personas ────────────────────────────────────────────────

    let personas = server.personas.clone();
    tools.push(core_tool::<PersonaLoadRequest, _, _>(
        "persona_load",
        "Switch the workspace persona; swaps the active tool set atomically and emits tools_changed.",
        move |args| {
            let personas = personas.clone();
            async move {
                let uri = workspace_of(&args)?;
                let req: PersonaLoadRequest = parse_req(&args)?;
                let switch =
                    personas.load(&uri, &req.name).await.map_err(|e| e.into_tool_error())?;
                to_json(&switch)
            }
        },
    ));

    let personas = server.personas.clone();
    tools.push(core_tool::<EmptyRequest, _, _>(
        "persona_list",
        "Enumerate available personas.",
        move |_args| {
            let personas = personas.clone();
            async move {
                let list: Vec<Value> = personas
                    .list()
                    .into_iter()
                    .map(|m| {
                        json!({
                            "name": m.name,
                            "description": m.description,
                            "modules": m.modules,
                            "skills": m.skills,
                        })
                    })
                    .collect();
                Ok(json!({"personas": list, "active": personas.active()}))
            }
        },
    ));

    // ── Sessions ────────────────────────────────────────────────

    let workspaces = server.workspaces.clone();
    tools.push(core_tool::<SessionStartRequest, _, _>(
        "session_start",
        "Create or resume a session; returns session id, persona, project, and a state summary.",
        move |args| {
            let workspaces = workspaces.clone();
            async move {
                let uri = workspace_of(&args)?;
                let req: SessionStartRequest = parse_req(&args)?;
                let started = workspaces
                    .session_start(&uri, req.name, req.session_id, req.agent)
                    .await;
                to_json(&started)
            }
        },
    ));

    let workspaces = server.workspaces.clone();
    tools.push(core_tool::<SessionInfoRequest, _, _>(
        "session_info",
        "Read one session (the active one when no id is given).",
        move |args| {
            let workspaces = workspaces.clone();
            async move {
                let uri = workspace_of(&args)?;
                let req: SessionInfoRequest = parse_req(&args)?;
                let session = workspaces
                    .session_info(&uri, req.session_id.as_deref())
                    .await
                    .map_err(|e| e.into_tool_error())?;
                to_json(&session)
            }
        },
    ));

    let workspaces = server.workspaces.clone();
    tools.push(core_tool::<EmptyRequest, _, _>(
        "session_list",
        "All sessions in the workspace, most recent first.",
        move |args| {
            let workspaces = workspaces.clone();
            async move {
                let uri = workspace_of(&args)?;
                let sessions = workspaces.session_list(&uri).await;
                to_json(&sessions)
            }
        },
    ));

    let workspaces = server.workspaces.clone();
    tools.push(core_tool::<SessionSwitchRequest, _, _>(
        "session_switch",
        "Set the workspace's active session.",
        move |args| {
            let workspaces = workspaces.clone();
            async move {
                let uri = workspace_of(&args)?;
                let req: SessionSwitchRequest = parse_req(&args)?;
                let session = workspaces
                    .session_switch(&uri, &req.session_id)
                    .await
                    .map_err(|e| e.into_tool_error())?;
                to_json(&session)
            }
        },
    ));

    // ── Skills ──────────────────────────────────────────────────

    let engine = server.engine.clone();
    let workspaces = server.workspaces.clone();
    let personas = server.personas.clone();
    tools.push(core_tool::<SkillRunRequest, _, _>(
        "skill_run",
        "Execute a skill by name with JSON inputs; streams lifecycle events on the bus.",
        move |args| {
            let engine = engine.clone();
            let workspaces = workspaces.clone();
            let personas = personas.clone();
            async move {
                let uri = workspace_of(&args)?;
                let req: SkillRunRequest = parse_req(&args)?;
                let inputs = match req.inputs_json {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(Value::String(raw)) if raw.trim().is_empty() => Value::Object(Map::new()),
                    Some(Value::String(raw)) => serde_json::from_str(&raw)
                        .map_err(|e| invalid(format!("inputs_json is not valid JSON: {e}")))?,
                    Some(other) => other,
                };

                let ws = workspaces.get_or_create(&uri).await;
                if let Some(persona_name) = &ws.persona {
                    if let Ok(manifest) = personas.manifest(persona_name) {
                        if !manifest.allows_skill(&req.name) {
                            return Err(invalid(format!(
                                "skill '{}' is not allowed by persona '{persona_name}'",
                                req.name
                            )));
                        }
                    }
                }

                let outcome = engine
                    .run(&req.name, &inputs, &uri, ws.active_session.clone())
                    .await
                    .map_err(|e| e.into_tool_error())?;
                to_json(&outcome)
            }
        },
    ));

    let engine = server.engine.clone();
    tools.push(core_tool::<SkillCancelRequest, _, _>(
        "skill_cancel",
        "Trip a running execution's cancellation token.",
        move |args| {
            let engine = engine.clone();
            async move {
                let req: SkillCancelRequest = parse_req(&args)?;
                if engine.cancel(&req.execution_id).await {
                    Ok(json!({"cancelled": true, "execution_id": req.execution_id}))
                } else {
                    Err(ToolError::new(
                        ErrorKind::NotFound,
                        format!("no running execution '{}'", req.execution_id),
                    ))
                }
            }
        },
    ));

    // ── Auto-heal surface ───────────────────────────────────────

    let registry_handle = server.registry.clone();
    let heal = server.heal.clone();
    tools.push(core_tool::<DebugToolRequest, _, _>(
        "debug_tool",
        "Return a tool's source reference, decorator chain, and hints matching an error.",
        move |args| {
            let registry = registry_handle.clone();
            let heal = heal.clone();
            async move {
                let req: DebugToolRequest = parse_req(&args)?;
                let registered = registry.get(&req.tool_name).map(|t| {
                    json!({
                        "module": t.module,
                        "origin": t.origin,
                        "decorators": t.decorators.iter().map(|d| d.name()).collect::<Vec<_>>(),
                    })
                });
                let capture = heal.debug_capture(&req.tool_name);

                let mut hints: Vec<FixHint> = Vec::new();
                if let Some(origin) = registry.get(&req.tool_name).map(|t| t.origin.clone()) {
                    hints.push(FixHint::new(format!("registered at {origin}"), HintSource::DebugTool));
                }
                if let Some(error_text) = &req.error_message {
                    for fix in heal.fix_memory.lookup(&req.tool_name, error_text).await {
                        hints.push(fix.hint());
                    }
                }

                Ok(json!({
                    "tool_name": req.tool_name,
                    "registered": registered,
                    "last_run": capture,
                    "hints": hints,
                }))
            }
        },
    ));

    let heal = server.heal.clone();
    tools.push(core_tool::<LearnToolFixRequest, _, _>(
        "learn_tool_fix",
        "Insert or update a fix record for a tool failure pattern.",
        move |args| {
            let heal = heal.clone();
            async move {
                let req: LearnToolFixRequest = parse_req(&args)?;
                let record = heal
                    .fix_memory
                    .learn(&req.tool_name, &req.error_pattern, &req.root_cause, &req.fix_description)
                    .await
                    .map_err(|e| e.into_tool_error())?;
                to_json(&record)
            }
        },
    ));

    let heal = server.heal.clone();
    tools.push(core_tool::<CheckKnownIssuesRequest, _, _>(
        "check_known_issues",
        "Return fix records matching a tool and/or error text.",
        move |args| {
            let heal = heal.clone();
            async move {
                let req: CheckKnownIssuesRequest = parse_req(&args)?;
                let records = heal
                    .fix_memory
                    .search(req.tool_name.as_deref(), req.error_text.as_deref())
                    .await;
                let count = records.len();
                Ok(json!({"fixes": records, "count": count}))
            }
        },
    ));

    // ── Memory documents ────────────────────────────────────────

    let store = server.store.clone();
    tools.push(core_tool::<MemoryReadRequest, _, _>(
        "memory_read",
        "Read a memory document by key.",
        move |args| {
            let store = store.clone();
            async move {
                let req: MemoryReadRequest = parse_req(&args)?;
                let path = memory_path(&req.key)?;
                store.read(&path).await.map_err(|e| e.into_tool_error())
            }
        },
    ));

    let store = server.store.clone();
    tools.push(core_tool::<MemoryWriteRequest, _, _>(
        "memory_write",
        "Replace a memory document by key.",
        move |args| {
            let store = store.clone();
            async move {
                let req: MemoryWriteRequest = parse_req(&args)?;
                let path = memory_path(&req.key)?;
                store.write(&path, req.content).await.map_err(|e| e.into_tool_error())?;
                Ok(json!({"written": path}))
            }
        },
    ));

    let store = server.store.clone();
    tools.push(core_tool::<MemoryUpdateRequest, _, _>(
        "memory_update",
        "Set a dotted pointer inside a memory document.",
        move |args| {
            let store = store.clone();
            async move {
                let req: MemoryUpdateRequest = parse_req(&args)?;
                let path = memory_path(&req.key)?;
                store
                    .update(&path, &req.pointer, req.value)
                    .await
                    .map_err(|e| e.into_tool_error())?;
                Ok(json!({"updated": path, "pointer": req.pointer}))
            }
        },
    ));

    let store = server.store.clone();
    tools.push(core_tool::<MemoryAppendRequest, _, _>(
        "memory_append",
        "Append an item to a list inside a memory document.",
        move |args| {
            let store = store.clone();
            async move {
                let req: MemoryAppendRequest = parse_req(&args)?;
                let path = memory_path(&req.key)?;
                store
                    .append(&path, &req.pointer, req.item)
                    .await
                    .map_err(|e| e.into_tool_error())?;
                Ok(json!({"appended": path, "pointer": req.pointer}))
            }
        },
    ));

    let store = server.store.clone();
    tools.push(core_tool::<MemoryQueryRequest, _, _>(
        "memory_query",
        "Query values inside a memory document with a dotted path (`*` fans out).",
        move |args| {
            let store = store.clone();
            async move {
                let req: MemoryQueryRequest = parse_req(&args)?;
                let path = memory_path(&req.key)?;
                let values =
                    store.query(&path, &req.path).await.map_err(|e| e.into_tool_error())?;
                Ok(json!({"values": values}))
            }
        },
    ));

    tools
}
