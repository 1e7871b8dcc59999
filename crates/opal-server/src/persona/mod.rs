// crates/opal-server/src/persona/mod.rs
// Persona manifests and the atomic tool-set switcher

use crate::bus::EventBus;
use crate::error::{OpalError, Result};
use crate::registry::{ModuleCatalog, Tool, ToolRegistry};
use crate::workspace::WorkspaceRegistry;
use opal_types::BusEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Directory of persona manifests under the config root.
pub const PERSONAS_DIR: &str = "personas";

/// A persona manifest: read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered set of modules this persona exposes
    #[serde(default)]
    pub modules: Vec<String>,
    /// Role prompt handed to the assistant on session start
    #[serde(default)]
    pub prompt: String,
    /// Skill allowlist; empty means every skill is allowed
    #[serde(default)]
    pub skills: Vec<String>,
}

impl PersonaManifest {
    pub fn allows_skill(&self, skill_name: &str) -> bool {
        self.skills.is_empty() || self.skills.iter().any(|s| s == skill_name)
    }
}

/// Read one manifest by name. Fails with `not_found` (unknown persona).
pub fn load_manifest(root: &Path, name: &str) -> Result<PersonaManifest> {
    let path = root.join(PERSONAS_DIR).join(format!("{name}.yaml"));
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            OpalError::NotFound(format!("unknown persona: {name}"))
        } else {
            e.into()
        }
    })?;
    let manifest: PersonaManifest = serde_yaml::from_str(&contents)?;
    if manifest.name != name {
        warn!(
            file = %path.display(),
            declared = %manifest.name,
            "Persona manifest name does not match its file name"
        );
    }
    Ok(manifest)
}

/// Enumerate every manifest in the personas directory, sorted by name.
pub fn list_manifests(root: &Path) -> Vec<PersonaManifest> {
    let dir = root.join(PERSONAS_DIR);
    let mut manifests = Vec::new();
    for entry in walkdir::WalkDir::new(&dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match std::fs::read_to_string(path)
            .map_err(OpalError::from)
            .and_then(|c| serde_yaml::from_str::<PersonaManifest>(&c).map_err(OpalError::from))
        {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable persona"),
        }
    }
    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    manifests
}

/// Result of a completed switch.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaSwitch {
    pub persona: String,
    pub tool_count: usize,
    pub modules_added: Vec<String>,
    pub modules_removed: Vec<String>,
}

/// Installs and removes persona module sets. Switches are staged off to the
/// side and committed with a single registry swap, so no caller ever observes
/// a partial persona.
pub struct PersonaLoader {
    root: PathBuf,
    registry: Arc<ToolRegistry>,
    catalog: ModuleCatalog,
    workspaces: Arc<WorkspaceRegistry>,
    bus: EventBus,
    default_persona: Option<String>,
    /// Serializes switches; holding it is the `loading` state
    switch_lock: tokio::sync::Mutex<()>,
    active: std::sync::RwLock<Option<String>>,
}

impl PersonaLoader {
    pub fn new(
        root: impl Into<PathBuf>,
        registry: Arc<ToolRegistry>,
        catalog: ModuleCatalog,
        workspaces: Arc<WorkspaceRegistry>,
        bus: EventBus,
        default_persona: Option<String>,
    ) -> Self {
        Self {
            root: root.into(),
            registry,
            catalog,
            workspaces,
            bus,
            default_persona,
            switch_lock: tokio::sync::Mutex::new(()),
            active: std::sync::RwLock::new(None),
        }
    }

    /// Currently loaded persona, if any.
    pub fn active(&self) -> Option<String> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn list(&self) -> Vec<PersonaManifest> {
        list_manifests(&self.root)
    }

    pub fn manifest(&self, name: &str) -> Result<PersonaManifest> {
        load_manifest(&self.root, name)
    }

    /// Switch a workspace to a persona. Exactly-once observable: the registry
    /// transitions in one swap and `tools_changed` fires after the commit.
    pub async fn load(&self, workspace_uri: &str, name: &str) -> Result<PersonaSwitch> {
        let _switching = self.switch_lock.lock().await;

        let manifest = load_manifest(&self.root, name)?;
        let target: HashSet<String> = manifest.modules.iter().cloned().collect();
        let current = self.registry.loaded_modules();

        let to_remove: HashSet<String> = current.difference(&target).cloned().collect();
        let to_add: Vec<String> = manifest
            .modules
            .iter()
            .filter(|m| !current.contains(*m))
            .cloned()
            .collect();

        // Stage: build every incoming module before touching the registry, so
        // an unknown module fails the whole switch
        let mut staged_tools: Vec<Tool> = Vec::new();
        for module_name in &to_add {
            let module = self.catalog.build(module_name)?;
            staged_tools.extend(module.into_tools());
        }

        let tool_count = self.registry.apply_transaction(&to_remove, staged_tools)?;

        {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            *active = Some(name.to_string());
        }

        self.workspaces
            .update(workspace_uri, |ws| ws.persona = Some(name.to_string()))
            .await;

        self.bus.emit(
            BusEvent::ToolsChanged { persona: name.to_string(), tool_count },
            None,
        );

        let mut modules_removed: Vec<String> = to_remove.into_iter().collect();
        modules_removed.sort();
        info!(persona = name, tool_count, ?modules_removed, "Persona loaded");

        Ok(PersonaSwitch {
            persona: name.to_string(),
            tool_count,
            modules_added: to_add,
            modules_removed,
        })
    }

    /// Make sure the caller's workspace has its persona active. A workspace
    /// with no persona yet falls back to the configured default; the global
    /// default is never consulted again once the workspace has one.
    pub async fn ensure_for_workspace(&self, workspace_uri: &str) -> Result<()> {
        let ws = self.workspaces.get_or_create(workspace_uri).await;
        let wanted = match ws.persona {
            Some(persona) => persona,
            None => match &self.default_persona {
                Some(default) => default.clone(),
                None => return Ok(()),
            },
        };
        if self.active().as_deref() == Some(wanted.as_str()) {
            return Ok(());
        }
        match self.load(workspace_uri, &wanted).await {
            Ok(_) => Ok(()),
            // A stale persona name in the workspace record must not brick the
            // request path
            Err(OpalError::NotFound(msg)) => {
                warn!(workspace = workspace_uri, error = %msg, "Recorded persona is unknown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::HealConfig;
    use crate::heal::AutoHealCore;
    use crate::registry::ToolModule;
    use crate::store::Store;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        loader: PersonaLoader,
        registry: Arc<ToolRegistry>,
        bus: EventBus,
    }

    fn write_persona(root: &Path, name: &str, modules: &[&str]) {
        let dir = root.join(PERSONAS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = PersonaManifest {
            name: name.to_string(),
            description: format!("{name} persona"),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            prompt: String::new(),
            skills: Vec::new(),
        };
        std::fs::write(
            dir.join(format!("{name}.yaml")),
            serde_yaml::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn module_with(names: &[&str]) -> ToolModule {
        let mut module = ToolModule::new("unused");
        for name in names {
            module = module.with_basic(Tool::simple(*name, json!({"type": "object"}), |_| {
                Ok(json!("ok"))
            }));
        }
        module
    }

    fn fixture(default_persona: Option<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Store::new(&root, Duration::from_millis(10));
        let heal = Arc::new(AutoHealCore::new(store.clone(), HealConfig::default()));
        let registry = Arc::new(ToolRegistry::new(heal));
        let workspaces = Arc::new(WorkspaceRegistry::new(store));
        let bus = EventBus::new();

        let catalog = ModuleCatalog::new();
        catalog.register("git", || {
            let mut m = module_with(&["git_status", "git_commit"]);
            m.name = "git".into();
            m
        });
        catalog.register("deploy", || {
            let mut m = module_with(&["deploy_app"]);
            m.name = "deploy".into();
            m
        });

        write_persona(&root, "dev", &["git"]);
        write_persona(&root, "devops", &["git", "deploy"]);

        let loader = PersonaLoader::new(
            &root,
            registry.clone(),
            catalog,
            workspaces,
            bus.clone(),
            default_persona,
        );
        Fixture { _dir: dir, loader, registry, bus }
    }

    #[tokio::test]
    async fn test_load_installs_modules_and_emits() {
        let f = fixture(None);
        let mut rx = f.bus.subscribe();

        let switch = f.loader.load("file:///repo", "dev").await.unwrap();
        assert_eq!(switch.persona, "dev");
        assert_eq!(switch.modules_added, vec!["git".to_string()]);
        assert!(f.registry.get("git_status").is_some());

        let frame = rx.recv().await.unwrap();
        match frame.event {
            BusEvent::ToolsChanged { persona, tool_count } => {
                assert_eq!(persona, "dev");
                assert_eq!(tool_count, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_switch_replaces_modules() {
        let f = fixture(None);
        f.loader.load("file:///repo", "devops").await.unwrap();
        assert!(f.registry.get("deploy_app").is_some());

        let switch = f.loader.load("file:///repo", "dev").await.unwrap();
        assert_eq!(switch.modules_removed, vec!["deploy".to_string()]);
        assert!(f.registry.get("deploy_app").is_none());
        assert!(f.registry.get("git_status").is_some(), "shared module survives");
    }

    #[tokio::test]
    async fn test_unknown_persona_and_module_fail_cleanly() {
        let f = fixture(None);
        assert!(matches!(
            f.loader.load("file:///repo", "ghost").await.unwrap_err(),
            OpalError::NotFound(_)
        ));

        // A persona naming an unknown module fails before the registry changes
        write_persona(f.loader.root.as_path(), "broken", &["git", "missing_module"]);
        f.loader.load("file:///repo", "dev").await.unwrap();
        let before = f.registry.tool_count();
        assert!(f.loader.load("file:///repo", "broken").await.is_err());
        assert_eq!(f.registry.tool_count(), before, "failed switch left registry untouched");
    }

    #[tokio::test]
    async fn test_core_tools_survive_switch() {
        let f = fixture(None);
        f.registry
            .register_core(Tool::simple("skill_run", json!({"type": "object"}), |_| Ok(json!({}))))
            .unwrap();
        f.loader.load("file:///repo", "devops").await.unwrap();
        f.loader.load("file:///repo", "dev").await.unwrap();
        assert!(f.registry.get("skill_run").is_some());
    }

    #[tokio::test]
    async fn test_ensure_for_workspace_uses_default_once() {
        let f = fixture(Some("dev".to_string()));
        f.loader.ensure_for_workspace("file:///repo").await.unwrap();
        assert_eq!(f.loader.active().as_deref(), Some("dev"));

        // An explicit switch wins over the global default afterwards
        f.loader.load("file:///repo", "devops").await.unwrap();
        f.loader.ensure_for_workspace("file:///repo").await.unwrap();
        assert_eq!(f.loader.active().as_deref(), Some("devops"));
    }

    #[tokio::test]
    async fn test_concurrent_switches_serialize() {
        let f = fixture(None);
        let loader = Arc::new(f.loader);
        let mut handles = Vec::new();
        for name in ["dev", "devops", "dev", "devops"] {
            let loader = loader.clone();
            handles.push(tokio::spawn(async move {
                loader.load("file:///repo", name).await
            }));
        }
        for h in handles {
            let _ = h.await.unwrap();
        }
        // Final state matches one of the serial orders
        let active = loader.active().unwrap();
        let tools = f.registry.tool_count();
        match active.as_str() {
            "dev" => assert_eq!(tools, 2),
            "devops" => assert_eq!(tools, 3),
            other => panic!("unexpected persona {other}"),
        }
    }

    #[test]
    fn test_allowlist() {
        let manifest = PersonaManifest {
            name: "dev".into(),
            description: String::new(),
            modules: Vec::new(),
            prompt: String::new(),
            skills: vec!["greet".into()],
        };
        assert!(manifest.allows_skill("greet"));
        assert!(!manifest.allows_skill("deploy"));
    }
}
