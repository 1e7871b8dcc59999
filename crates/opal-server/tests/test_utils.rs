// crates/opal-server/tests/test_utils.rs
// Shared harness for integration tests

use opal::bus::EventBus;
use opal::config::{EnvConfig, OpalConfig};
use opal::mcp::{OpalServer, WORKSPACE_ARG};
use opal::registry::{Tool, ToolResult};
use opal_types::{BusEvent, EventFrame};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::broadcast;

pub const TEST_WORKSPACE: &str = "file:///test/workspace";

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub server: OpalServer,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = EnvConfig {
            config_root: dir.path().to_path_buf(),
            ws_port: 0,
            timezone: None,
            disable_ws: true,
            disable_scheduler: true,
        };
        let config = OpalConfig::default();
        let server = OpalServer::new(&env, &config).expect("server");
        Self { dir, server }
    }

    pub fn bus(&self) -> &EventBus {
        &self.server.bus
    }

    pub fn write_skill(&self, name: &str, body: &str) {
        let dir = self.dir.path().join("skills");
        std::fs::create_dir_all(&dir).expect("skills dir");
        std::fs::write(dir.join(format!("{name}.yaml")), body).expect("write skill");
    }

    pub fn write_persona(&self, name: &str, modules: &[&str]) {
        let dir = self.dir.path().join("personas");
        std::fs::create_dir_all(&dir).expect("personas dir");
        let modules_yaml = modules
            .iter()
            .map(|m| format!("  - {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(
            dir.join(format!("{name}.yaml")),
            format!("name: {name}\ndescription: test persona\nmodules:\n{modules_yaml}\n"),
        )
        .expect("write persona");
    }

    pub fn register_echo(&self, name: &str) {
        self.server
            .registry
            .register(echo_tool(name))
            .expect("register echo");
    }

    /// Invoke a tool the way the MCP dispatch does, workspace injected.
    pub async fn invoke(&self, tool: &str, mut args: Map<String, Value>) -> ToolResult {
        args.insert(WORKSPACE_ARG.to_string(), json!(TEST_WORKSPACE));
        self.server.registry.invoke(tool, args).await
    }

    pub async fn run_skill(&self, name: &str, inputs: Value) -> opal::skills::SkillOutcome {
        self.server
            .engine
            .run(name, &inputs, TEST_WORKSPACE, None)
            .await
            .expect("skill run")
    }
}

pub fn echo_tool(name: &str) -> Tool {
    Tool::simple(name, json!({"type": "object"}), |args| {
        Ok(args.get("msg").cloned().unwrap_or(Value::Null))
    })
    .with_module("test")
}

pub fn args_of(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Drain frames from a subscription until the predicate matches a terminal
/// event or the deadline passes. Returns everything received.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<EventFrame>,
    mut done: impl FnMut(&BusEvent) -> bool,
    deadline: Duration,
) -> Vec<EventFrame> {
    let mut frames = Vec::new();
    let result = tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let stop = done(&frame.event);
                    frames.push(frame);
                    if stop {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out collecting events; got {} frames", frames.len());
    frames
}

/// The wire `type` names, in arrival order.
pub fn type_names(frames: &[EventFrame]) -> Vec<&'static str> {
    frames.iter().map(|f| f.event.type_name()).collect()
}
