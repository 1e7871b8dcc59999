// crates/opal-server/src/cli/tool.rs
// One-shot tool runner for operators

use super::{Cli, StartupError};
use opal::mcp::WORKSPACE_ARG;
use serde_json::Value;

/// Invoke a single tool with JSON args and print the result. Returns whether
/// the call succeeded so main can pick the exit code.
pub async fn run_tool(cli: &Cli, name: &str, args_json: &str) -> Result<bool, StartupError> {
    let (server, _env, _config) = super::serve::init_server(cli).await?;

    let parsed: Value = serde_json::from_str(args_json)
        .map_err(|e| StartupError::Config(format!("args must be a JSON object: {e}")))?;
    let mut args = match parsed {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        _ => return Err(StartupError::Config("args must be a JSON object".to_string())),
    };

    let workspace = server.default_workspace.read().await.clone();
    args.insert(WORKSPACE_ARG.to_string(), Value::String(workspace));

    let result = server.registry.invoke(name, args).await;
    let ok = result.is_ok();
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(rendered) => println!("{rendered}"),
            Err(_) => println!("{value}"),
        },
        Err(error) => {
            let payload = serde_json::json!({"error": error});
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
        }
    }

    // Leave nothing dirty behind
    if let Err(e) = server.store.flush_all().await {
        tracing::warn!(error = %e, "Flush after one-shot tool failed");
    }
    Ok(ok)
}
