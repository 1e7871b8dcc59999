// crates/opal-server/src/registry/modules.rs
// Module catalog: named groups of tools that load and unload together

use super::Tool;
use crate::error::{OpalError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A named group of tools. Modules load atomically: all tools or none.
pub struct ToolModule {
    pub name: String,
    /// Always installed when the module loads
    pub basic_tools: Vec<Tool>,
    /// Installed alongside basic tools; split kept for persona manifests that
    /// only want the basics
    pub extra_tools: Vec<Tool>,
}

impl ToolModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), basic_tools: Vec::new(), extra_tools: Vec::new() }
    }

    pub fn with_basic(mut self, tool: Tool) -> Self {
        self.basic_tools.push(tool);
        self
    }

    pub fn with_extra(mut self, tool: Tool) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// All tools in install order, tagged with the module name.
    pub fn into_tools(self) -> Vec<Tool> {
        let name = self.name;
        self.basic_tools
            .into_iter()
            .chain(self.extra_tools)
            .map(|mut t| {
                t.module = name.clone();
                t
            })
            .collect()
    }
}

/// Builds a fresh module instance; called each time a persona loads it.
pub type ModuleBuilder = Arc<dyn Fn() -> ToolModule + Send + Sync>;

/// Registry of module builders. Tool implementations (git, issue tracking,
/// deployment, ...) register themselves here; the core never looks inside a
/// `ToolFn`.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    builders: Arc<RwLock<HashMap<String, ModuleBuilder>>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, builder: F)
    where
        F: Fn() -> ToolModule + Send + Sync + 'static,
    {
        let name = name.into();
        let mut builders = self.builders.write().unwrap_or_else(|e| e.into_inner());
        builders.insert(name, Arc::new(builder));
    }

    /// Build a module by name; fails with `not_found` for unknown modules.
    pub fn build(&self, name: &str) -> Result<ToolModule> {
        let builder = {
            let builders = self.builders.read().unwrap_or_else(|e| e.into_inner());
            builders.get(name).cloned()
        };
        match builder {
            Some(builder) => Ok(builder()),
            None => Err(OpalError::NotFound(format!("unknown module: {name}"))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let builders = self.builders.read().unwrap_or_else(|e| e.into_inner());
        builders.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let builders = self.builders.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = builders.keys().cloned().collect();
        names.sort();
        names
    }
}
