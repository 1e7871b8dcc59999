// crates/opal-server/src/config/file.rs
// File-based configuration from <config root>/config.toml

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Deserialize, Default)]
pub struct OpalConfig {
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub heal: HealConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Persona defaults
#[derive(Debug, Deserialize, Default)]
pub struct PersonaConfig {
    /// Persona applied to a workspace that has never loaded one explicitly
    pub default_persona: Option<String>,
}

/// Auto-heal tuning
#[derive(Debug, Deserialize, Clone)]
pub struct HealConfig {
    /// Apply high-confidence known fixes automatically
    #[serde(default = "HealConfig::default_apply_known")]
    pub apply_known: bool,
    /// Minimum FixRecord confidence before a known fix is applied
    #[serde(default = "HealConfig::default_apply_threshold")]
    pub apply_threshold: f64,
    /// Max automatic retries per remediation category in one invocation
    #[serde(default = "HealConfig::default_max_retries")]
    pub max_retries: u32,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self { apply_known: true, apply_threshold: 0.8, max_retries: 1 }
    }
}

impl HealConfig {
    fn default_apply_known() -> bool {
        true
    }
    fn default_apply_threshold() -> f64 {
        0.8
    }
    fn default_max_retries() -> u32 {
        1
    }
}

/// Scheduler tuning
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "SchedulerConfig::default_enabled")]
    pub enabled: bool,
    /// Wall-clock jump (seconds) treated as a sleep/wake transition
    #[serde(default = "SchedulerConfig::default_wake_gap_secs")]
    pub wake_gap_secs: u64,
    /// Tick interval in seconds
    #[serde(default = "SchedulerConfig::default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true, wake_gap_secs: 30, tick_secs: 5 }
    }
}

impl SchedulerConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_wake_gap_secs() -> u64 {
        30
    }
    fn default_tick_secs() -> u64 {
        5
    }
}

/// Persistent store tuning
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Quiet window (milliseconds) before a dirty document is flushed
    #[serde(default = "StoreConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { debounce_ms: 2000 }
    }
}

impl StoreConfig {
    fn default_debounce_ms() -> u64 {
        2000
    }
}

impl OpalConfig {
    /// Load config from `<root>/config.toml`, falling back to defaults on
    /// missing or malformed files.
    pub fn load(root: &Path) -> Self {
        let path = Self::config_path(root);

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Config file path under a root (public for CLI config commands)
    pub fn config_path(root: &Path) -> PathBuf {
        root.join("config.toml")
    }
}
