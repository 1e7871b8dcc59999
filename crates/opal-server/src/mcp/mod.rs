// crates/opal-server/src/mcp/mod.rs
// MCP server state: owns the long-lived core components

mod control;
mod handler;

pub use control::{WORKSPACE_ARG, register_core_tools};

use crate::bus::EventBus;
use crate::config::{EnvConfig, OpalConfig};
use crate::error::Result;
use crate::heal::AutoHealCore;
use crate::persona::PersonaLoader;
use crate::registry::{ModuleCatalog, ToolRegistry};
use crate::skills::SkillEngine;
use crate::store::Store;
use crate::workspace::WorkspaceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// MCP server state. Components are long-lived owned handles so tests can
/// construct isolated instances.
#[derive(Clone)]
pub struct OpalServer {
    pub store: Store,
    pub heal: Arc<AutoHealCore>,
    pub registry: Arc<ToolRegistry>,
    pub catalog: ModuleCatalog,
    pub workspaces: Arc<WorkspaceRegistry>,
    pub personas: Arc<PersonaLoader>,
    pub engine: Arc<SkillEngine>,
    pub bus: EventBus,
    /// Workspace assumed when a request carries no context
    pub default_workspace: Arc<RwLock<String>>,
}

impl OpalServer {
    /// Wire up the full component graph under one config root.
    pub fn new(env: &EnvConfig, config: &OpalConfig) -> Result<Self> {
        let root = env.config_root.clone();
        let store = Store::new(&root, Duration::from_millis(config.store.debounce_ms));
        let heal = Arc::new(AutoHealCore::new(store.clone(), config.heal.clone()));
        let registry = Arc::new(ToolRegistry::new(heal.clone()));
        let catalog = ModuleCatalog::new();
        let workspaces = Arc::new(WorkspaceRegistry::new(store.clone()));
        let bus = EventBus::new();
        let personas = Arc::new(PersonaLoader::new(
            &root,
            registry.clone(),
            catalog.clone(),
            workspaces.clone(),
            bus.clone(),
            config.persona.default_persona.clone(),
        ));

        // The read-only config snapshot templates see as `config`
        let config_snapshot = serde_json::json!({
            "timezone": env.timezone,
            "ws_port": env.ws_port,
        });
        let engine = Arc::new(SkillEngine::new(&root, registry.clone(), bus.clone(), config_snapshot));

        let default_workspace = std::env::current_dir()
            .map(|p| format!("file://{}", p.display()))
            .unwrap_or_else(|_| "file:///".to_string());

        let server = Self {
            store,
            heal,
            registry,
            catalog,
            workspaces,
            personas,
            engine,
            bus,
            default_workspace: Arc::new(RwLock::new(default_workspace)),
        };
        register_core_tools(&server)?;
        Ok(server)
    }

    /// Resolve the workspace for a request and make sure its persona's tool
    /// set is active.
    pub async fn resolve_workspace(&self, requested: Option<&str>) -> String {
        let uri = match requested {
            Some(uri) if !uri.is_empty() => uri.to_string(),
            _ => self.default_workspace.read().await.clone(),
        };
        if let Err(e) = self.personas.ensure_for_workspace(&uri).await {
            tracing::warn!(workspace = %uri, error = %e, "Failed to ensure workspace persona");
        }
        uri
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::env::DEFAULT_WS_PORT;

    /// An isolated server over a temp config root.
    pub fn server_at(root: &std::path::Path) -> OpalServer {
        let env = EnvConfig {
            config_root: root.to_path_buf(),
            ws_port: DEFAULT_WS_PORT,
            timezone: None,
            disable_ws: true,
            disable_scheduler: true,
        };
        let config = OpalConfig::default();
        OpalServer::new(&env, &config).expect("server construction")
    }
}
