// crates/opal-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::warn;

/// Default WebSocket port for the live execution bus.
pub const DEFAULT_WS_PORT: u16 = 8790;

/// Parse a boolean-ish env var: "1", "true", "yes", "on" (case-insensitive).
/// Returns None when unset or empty.
pub fn parse_bool_env(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

/// Environment configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Config root holding personas/, skills/, learned/, memory/ (OPAL_HOME)
    pub config_root: PathBuf,
    /// WebSocket bus port, always bound on loopback (OPAL_WS_PORT)
    pub ws_port: u16,
    /// IANA timezone for the scheduler (OPAL_TZ)
    pub timezone: Option<String>,
    /// Disable the live execution bus (OPAL_DISABLE_WS)
    pub disable_ws: bool,
    /// Disable the cron scheduler (OPAL_DISABLE_SCHEDULER)
    pub disable_scheduler: bool,
}

/// Result of config validation: warnings are non-fatal.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Self {
        let config_root = std::env::var("OPAL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_root());

        let ws_port = std::env::var("OPAL_WS_PORT")
            .ok()
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_WS_PORT);

        let timezone = std::env::var("OPAL_TZ")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            config_root,
            ws_port,
            timezone,
            disable_ws: parse_bool_env("OPAL_DISABLE_WS").unwrap_or(false),
            disable_scheduler: parse_bool_env("OPAL_DISABLE_SCHEDULER").unwrap_or(false),
        }
    }

    /// Per-user default config root: `~/.opal`.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| {
                warn!("HOME directory not set, using current directory for the Opal config root");
                PathBuf::from(".")
            })
            .join(".opal")
    }

    /// Validate the loaded configuration. Only warns; startup decides what is fatal.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(tz) = &self.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                result
                    .warnings
                    .push(format!("OPAL_TZ '{tz}' is not a valid IANA timezone, using UTC"));
            }
        }
        if self.ws_port < 1024 {
            result
                .warnings
                .push(format!("OPAL_WS_PORT {} is privileged; binding may fail", self.ws_port));
        }

        result
    }

    /// Scheduler timezone, defaulting to UTC when unset or invalid.
    pub fn scheduler_tz(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse::<chrono_tz::Tz>().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env_variants() {
        // SAFETY: test-only, single-threaded test runner for this module
        unsafe {
            std::env::set_var("OPAL_TEST_FLAG", "1");
        }
        assert_eq!(parse_bool_env("OPAL_TEST_FLAG"), Some(true));
        unsafe {
            std::env::set_var("OPAL_TEST_FLAG", "off");
        }
        assert_eq!(parse_bool_env("OPAL_TEST_FLAG"), Some(false));
        unsafe {
            std::env::remove_var("OPAL_TEST_FLAG");
        }
        assert_eq!(parse_bool_env("OPAL_TEST_FLAG"), None);
    }

    #[test]
    fn test_scheduler_tz_falls_back_to_utc() {
        let config = EnvConfig {
            config_root: PathBuf::from("."),
            ws_port: DEFAULT_WS_PORT,
            timezone: Some("Not/AZone".into()),
            disable_ws: false,
            disable_scheduler: false,
        };
        assert_eq!(config.scheduler_tz(), chrono_tz::UTC);

        let config = EnvConfig { timezone: Some("Europe/Prague".into()), ..config };
        assert_eq!(config.scheduler_tz(), chrono_tz::Europe::Prague);
    }

    #[test]
    fn test_validate_warns_on_bad_tz() {
        let config = EnvConfig {
            config_root: PathBuf::from("."),
            ws_port: 80,
            timezone: Some("Mars/Olympus".into()),
            disable_ws: false,
            disable_scheduler: false,
        };
        let result = config.validate();
        assert_eq!(result.warnings.len(), 2);
    }
}
