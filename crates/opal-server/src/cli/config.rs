// crates/opal-server/src/cli/config.rs
// `opal config show|set` helpers for <root>/config.toml

use super::StartupError;
use opal::config::{EnvConfig, OpalConfig};
use std::path::Path;

pub fn run_config_show() -> Result<(), StartupError> {
    let root = EnvConfig::load().config_root;
    let path = OpalConfig::config_path(&root);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            println!("# {}", path.display());
            print!("{contents}");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("# {} (not present, defaults in effect)", path.display());
        }
        Err(e) => return Err(StartupError::Config(format!("{}: {e}", path.display()))),
    }
    Ok(())
}

pub fn run_config_set(key: &str, value: &str) -> Result<(), StartupError> {
    let root = EnvConfig::load().config_root;
    let path = OpalConfig::config_path(&root);
    set_in_file(&path, key, value)?;
    println!("{key} = {value}");
    Ok(())
}

/// Set a dotted key in a TOML document, creating tables as needed.
fn set_in_file(path: &Path, key: &str, value: &str) -> Result<(), StartupError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(StartupError::Config(format!("{}: {e}", path.display()))),
    };
    let mut doc: toml::Value = if existing.trim().is_empty() {
        toml::Value::Table(toml::map::Map::new())
    } else {
        toml::from_str(&existing)
            .map_err(|e| StartupError::Config(format!("{}: {e}", path.display())))?
    };

    // Typed when possible, string otherwise
    let parsed: toml::Value = value
        .parse::<i64>()
        .map(toml::Value::Integer)
        .or_else(|_| value.parse::<f64>().map(toml::Value::Float))
        .or_else(|_| value.parse::<bool>().map(toml::Value::Boolean))
        .unwrap_or_else(|_| toml::Value::String(value.to_string()));

    let mut current = &mut doc;
    let segments: Vec<&str> = key.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let table = current
            .as_table_mut()
            .ok_or_else(|| StartupError::Config(format!("'{key}' crosses a non-table value")))?;
        if i == segments.len() - 1 {
            table.insert(segment.to_string(), parsed);
            break;
        }
        current = table
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    let rendered = toml::to_string_pretty(&doc)
        .map_err(|e| StartupError::Config(format!("render config: {e}")))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StartupError::Config(format!("{}: {e}", parent.display())))?;
    }
    std::fs::write(path, rendered)
        .map_err(|e| StartupError::Config(format!("{}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_in_file_creates_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        set_in_file(&path, "persona.default_persona", "developer").unwrap();
        set_in_file(&path, "scheduler.wake_gap_secs", "45").unwrap();
        set_in_file(&path, "heal.apply_known", "false").unwrap();

        let doc: toml::Value = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            doc["persona"]["default_persona"],
            toml::Value::String("developer".into())
        );
        assert_eq!(doc["scheduler"]["wake_gap_secs"], toml::Value::Integer(45));
        assert_eq!(doc["heal"]["apply_known"], toml::Value::Boolean(false));

        // Parses as the real config
        let config: OpalConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.scheduler.wake_gap_secs, 45);
        assert!(!config.heal.apply_known);
    }
}
