// crates/opal-server/src/mcp/handler.rs
// MCP ServerHandler implementation over the dynamic tool registry

use super::OpalServer;
use super::control::WORKSPACE_ARG;

use rmcp::{
    ErrorData, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
};
use serde_json::Value;
use std::sync::Arc;

/// Render a tool's success value as text content: strings verbatim,
/// everything else pretty-printed JSON.
fn render_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

impl ServerHandler for OpalServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "opal".into(),
                title: Some("Opal - developer workflow automation".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Opal exposes workflow tools and multi-step skills. Call session_start first; \
                 persona_load switches the active tool set."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        // The listing reflects the live registry: persona switches change it
        let tools = self
            .registry
            .list(None)
            .into_iter()
            .map(|descriptor| {
                let schema = descriptor
                    .params
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                rmcp::model::Tool::new(
                    descriptor.name.clone(),
                    descriptor.description.clone(),
                    Arc::new(schema),
                )
            })
            .collect();
        std::future::ready(Ok(ListToolsResult { tools, next_cursor: None, meta: None }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            let tool_name = request.name.to_string();
            let mut args = request.arguments.clone().unwrap_or_default();

            // Requests carry {args, context: {workspace_uri}}; the context key
            // never reaches the tool itself
            let requested_workspace = args
                .remove("context")
                .as_ref()
                .and_then(|c| c.get(WORKSPACE_ARG))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let workspace_uri = self.resolve_workspace(requested_workspace.as_deref()).await;
            args.insert(WORKSPACE_ARG.to_string(), Value::String(workspace_uri.clone()));

            let start = std::time::Instant::now();
            let result = self.registry.invoke(&tool_name, args).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            // Record the call on the active session's bounded activity log
            if let Some(session_id) = self
                .workspaces
                .get(&workspace_uri)
                .await
                .and_then(|ws| ws.active_session)
            {
                let status = if result.is_ok() { "ok" } else { "failed" };
                self.workspaces
                    .record_activity(
                        &workspace_uri,
                        &session_id,
                        format!("{tool_name} {status} ({duration_ms}ms)"),
                    )
                    .await;
            }

            match result {
                Ok(value) => Ok(CallToolResult::success(vec![Content::text(render_result(&value))])),
                Err(tool_error) => {
                    let payload = serde_json::json!({ "error": tool_error });
                    let text = serde_json::to_string_pretty(&payload)
                        .unwrap_or_else(|_| tool_error.to_string());
                    Ok(CallToolResult::error(vec![Content::text(text)]))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_result() {
        assert_eq!(render_result(&Value::String("plain".into())), "plain");
        let rendered = render_result(&serde_json::json!({"a": 1}));
        assert!(rendered.contains("\"a\": 1"));
    }
}
