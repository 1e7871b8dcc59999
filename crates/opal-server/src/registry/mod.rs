// crates/opal-server/src/registry/mod.rs
// Dynamic tool registry: named, typed capabilities with decorator chains

mod modules;
mod schema;

pub use modules::{ModuleBuilder, ModuleCatalog, ToolModule};
pub use schema::validate_args;

use crate::error::{OpalError, Result};
use crate::heal::{AutoHealCore, HealReport};
use futures::future::BoxFuture;
use opal_types::{ErrorKind, ToolError};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Result of a tool invocation. The success value is opaque to the core.
pub type ToolResult = std::result::Result<Value, ToolError>;

/// A tool function: typed argument map in, result or structured error out.
pub type ToolFn = Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// One decorator site on a tool. The chain is interpreted outside-in by the
/// auto-heal core; each decorator may transform arguments, observe the
/// result, and cause at most one retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoratorSpec {
    /// Consult learned usage patterns before the call; block on high confidence
    UsagePrecheck,
    /// Classify failures and run remediation actions, then retry once
    AutoHeal {
        /// Hint passed to cluster-scoped remediation actions (e.g. auth_fix)
        cluster: Option<String>,
    },
    /// Capture a source reference for failure reports
    Debuggable,
}

impl DecoratorSpec {
    /// The default chain every tool gets unless it opts out.
    pub fn default_chain() -> Vec<DecoratorSpec> {
        vec![
            DecoratorSpec::UsagePrecheck,
            DecoratorSpec::AutoHeal { cluster: None },
            DecoratorSpec::Debuggable,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            DecoratorSpec::UsagePrecheck => "usage_precheck",
            DecoratorSpec::AutoHeal { .. } => "auto_heal",
            DecoratorSpec::Debuggable => "debuggable",
        }
    }
}

/// A named, typed capability. Owned exclusively by the registry once
/// installed.
pub struct Tool {
    pub name: String,
    pub module: String,
    pub description: String,
    /// JSON-schema object describing the argument map (the shape MCP lists)
    pub params: Value,
    pub decorators: Vec<DecoratorSpec>,
    /// Source reference reported by `debug_tool`
    pub origin: String,
    func: ToolFn,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Value,
        func: ToolFn,
    ) -> Self {
        let name = name.into();
        let origin = format!("tool:{name}");
        Self {
            name,
            module: String::new(),
            description: description.into(),
            params,
            decorators: DecoratorSpec::default_chain(),
            origin,
            func,
        }
    }

    /// Build a tool from a synchronous closure. Handy for tests and compute
    /// shims; production tools usually wrap async work via [`Tool::new`].
    pub fn simple<F>(name: impl Into<String>, params: Value, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> ToolResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, "", params, Arc::new(move |args| {
            let f = f.clone();
            Box::pin(async move { f(args) })
        }))
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_decorators(mut self, decorators: Vec<DecoratorSpec>) -> Self {
        self.decorators = decorators;
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        for spec in &mut self.decorators {
            if let DecoratorSpec::AutoHeal { cluster: slot } = spec {
                *slot = Some(cluster.clone());
            }
        }
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Invoke the raw tool function, bypassing decorators. The registry and
    /// the auto-heal interpreter are the only callers.
    pub fn call_raw(&self, args: Map<String, Value>) -> BoxFuture<'static, ToolResult> {
        (self.func)(args)
    }
}

/// Listing entry returned by `list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub module: String,
    pub description: String,
    pub params: Value,
}

type ToolMap = HashMap<String, Arc<Tool>>;

/// The registry: a snapshot map swapped atomically. An invocation that starts
/// on one snapshot keeps it for its entire decorator chain, which is what
/// makes persona switches linearizable.
pub struct ToolRegistry {
    heal: Arc<AutoHealCore>,
    tools: RwLock<Arc<ToolMap>>,
    core_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new(heal: Arc<AutoHealCore>) -> Self {
        Self {
            heal,
            tools: RwLock::new(Arc::new(HashMap::new())),
            core_names: RwLock::new(HashSet::new()),
        }
    }

    fn snapshot(&self) -> Arc<ToolMap> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn swap(&self, map: ToolMap) {
        let mut guard = self.tools.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(map);
    }

    fn is_core(&self, name: &str) -> bool {
        self.core_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Install a tool. Fails with `conflict` when the name is taken.
    pub fn register(&self, tool: Tool) -> Result<()> {
        let mut guard = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&tool.name) {
            return Err(OpalError::Conflict(format!("tool '{}' already registered", tool.name)));
        }
        let mut map = (**guard).clone();
        map.insert(tool.name.clone(), Arc::new(tool));
        *guard = Arc::new(map);
        Ok(())
    }

    /// Install a tool into the protected core set. Core tools survive every
    /// persona switch and cannot be unregistered.
    pub fn register_core(&self, tool: Tool) -> Result<()> {
        let name = tool.name.clone();
        self.register(tool)?;
        let mut core = self.core_names.write().unwrap_or_else(|e| e.into_inner());
        core.insert(name);
        Ok(())
    }

    /// Remove a tool. Fails with `protected` for core names and `not_found`
    /// for unknown ones.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if self.is_core(name) {
            return Err(OpalError::Protected(format!("'{name}' is a core tool")));
        }
        let mut guard = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(name) {
            return Err(OpalError::NotFound(format!("no such tool: {name}")));
        }
        let mut map = (**guard).clone();
        map.remove(name);
        *guard = Arc::new(map);
        Ok(())
    }

    /// Stage and commit a persona transition in one atomic swap: every
    /// non-core tool belonging to `remove_modules` goes away, then `add`
    /// installs. Nothing is visible until the final swap; on any conflict the
    /// registry is untouched.
    pub fn apply_transaction(
        &self,
        remove_modules: &HashSet<String>,
        add: Vec<Tool>,
    ) -> Result<usize> {
        let core = self.core_names.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut guard = self.tools.write().unwrap_or_else(|e| e.into_inner());

        // Stage into a temporary map
        let mut staged: ToolMap = (**guard).clone();
        staged.retain(|name, tool| core.contains(name) || !remove_modules.contains(&tool.module));
        for tool in add {
            if staged.contains_key(&tool.name) {
                return Err(OpalError::Conflict(format!(
                    "tool '{}' already registered (module {})",
                    tool.name, tool.module
                )));
            }
            staged.insert(tool.name.clone(), Arc::new(tool));
        }

        let count = staged.len();
        *guard = Arc::new(staged);
        Ok(count)
    }

    /// List installed tools, optionally filtered by module name.
    pub fn list(&self, module_filter: Option<&str>) -> Vec<ToolDescriptor> {
        let snapshot = self.snapshot();
        let mut entries: Vec<ToolDescriptor> = snapshot
            .values()
            .filter(|t| module_filter.is_none_or(|m| t.module == m))
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                module: t.module.clone(),
                description: t.description.clone(),
                params: t.params.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.snapshot().get(name).cloned()
    }

    pub fn tool_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Modules currently represented by at least one installed tool.
    pub fn loaded_modules(&self) -> HashSet<String> {
        self.snapshot()
            .values()
            .map(|t| t.module.clone())
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Validate args and run the decorator chain. Never panics: unexpected
    /// panics inside tool functions surface as `internal` errors.
    pub async fn invoke(&self, name: &str, args: Map<String, Value>) -> ToolResult {
        self.invoke_with_report(name, args).await.0
    }

    /// Like [`invoke`], also returning the auto-heal report (remediations
    /// attempted, retries) so the skill engine can emit lifecycle events.
    pub async fn invoke_with_report(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> (ToolResult, HealReport) {
        // Resolve on one snapshot; the tool reference is pinned for the whole
        // chain even if a persona switch lands mid-flight.
        let Some(tool) = self.get(name) else {
            return (
                Err(ToolError::new(ErrorKind::NotFound, format!("no such tool: {name}"))),
                HealReport::default(),
            );
        };

        if let Err(e) = validate_args(name, &tool.params, &args) {
            return (Err(e), HealReport::default());
        }

        self.heal.run_chain(&tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::HealConfig;
    use crate::store::Store;
    use serde_json::json;
    use std::time::Duration;

    fn test_registry() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), Duration::from_millis(10));
        let heal = Arc::new(AutoHealCore::new(store, HealConfig::default()));
        (dir, ToolRegistry::new(heal))
    }

    fn echo_tool(name: &str) -> Tool {
        Tool::simple(name, json!({"type": "object"}), |args| {
            Ok(args.get("msg").cloned().unwrap_or(Value::Null))
        })
        .with_module("echoes")
    }

    #[tokio::test]
    async fn test_register_invoke_roundtrip() {
        let (_dir, registry) = test_registry();
        registry.register(echo_tool("t_echo")).unwrap();
        let mut args = Map::new();
        args.insert("msg".into(), json!("hi"));
        let result = registry.invoke("t_echo", args).await.unwrap();
        assert_eq!(result, json!("hi"));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (_dir, registry) = test_registry();
        registry.register(echo_tool("t")).unwrap();
        let err = registry.register(echo_tool("t")).unwrap_err();
        assert!(matches!(err, OpalError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_core_tools_are_protected() {
        let (_dir, registry) = test_registry();
        registry.register_core(echo_tool("skill_run")).unwrap();
        let err = registry.unregister("skill_run").unwrap_err();
        assert!(matches!(err, OpalError::Protected(_)));
        // and they survive module removal transactions
        let mut remove = HashSet::new();
        remove.insert("echoes".to_string());
        registry.apply_transaction(&remove, Vec::new()).unwrap();
        assert!(registry.get("skill_run").is_some());
    }

    #[tokio::test]
    async fn test_unregister_missing_is_not_found() {
        let (_dir, registry) = test_registry();
        assert!(matches!(registry.unregister("ghost").unwrap_err(), OpalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transaction_swaps_module_atomically() {
        let (_dir, registry) = test_registry();
        registry.register(echo_tool("old_a")).unwrap();
        registry.register(echo_tool("old_b")).unwrap();

        let mut remove = HashSet::new();
        remove.insert("echoes".to_string());
        let add = vec![
            echo_tool("new_a").with_module("fresh"),
            echo_tool("new_b").with_module("fresh"),
        ];
        let count = registry.apply_transaction(&remove, add).unwrap();
        assert_eq!(count, 2);
        assert!(registry.get("old_a").is_none());
        assert!(registry.get("new_a").is_some());
        assert_eq!(registry.loaded_modules(), HashSet::from(["fresh".to_string()]));
    }

    #[tokio::test]
    async fn test_transaction_conflict_leaves_registry_untouched() {
        let (_dir, registry) = test_registry();
        registry.register(echo_tool("keep")).unwrap();
        let add = vec![echo_tool("keep").with_module("fresh")];
        assert!(registry.apply_transaction(&HashSet::new(), add).is_err());
        assert_eq!(registry.get("keep").unwrap().module, "echoes");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let (_dir, registry) = test_registry();
        let err = registry.invoke("ghost", Map::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invoke_validates_schema() {
        let (_dir, registry) = test_registry();
        let tool = Tool::simple(
            "t_tag",
            json!({"type": "object", "properties": {"tag": {"type": "string"}}, "required": ["tag"]}),
            |_| Ok(json!("tagged")),
        );
        registry.register(tool).unwrap();
        let err = registry.invoke("t_tag", Map::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_panicking_tool_reports_internal() {
        let (_dir, registry) = test_registry();
        let tool = Tool::simple("t_panic", json!({"type": "object"}), |_| {
            panic!("tool blew up")
        });
        registry.register(tool).unwrap();
        let err = registry.invoke("t_panic", Map::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_list_filter_and_order() {
        let (_dir, registry) = test_registry();
        registry.register(echo_tool("b_tool")).unwrap();
        registry.register(echo_tool("a_tool")).unwrap();
        registry.register(echo_tool("zeta").with_module("other")).unwrap();
        let all = registry.list(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "a_tool");
        let echoes = registry.list(Some("echoes"));
        assert_eq!(echoes.len(), 2);
    }
}
