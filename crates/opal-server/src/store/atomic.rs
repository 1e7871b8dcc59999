// crates/opal-server/src/store/atomic.rs
// Atomic document serialization: temp sibling + fsync + rename

use crate::error::{OpalError, Result};
use serde_json::Value;
use std::io::Write;
use std::path::Path;

/// On-disk document format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Yaml,
    Json,
}

impl DocFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => DocFormat::Yaml,
            _ => DocFormat::Json,
        }
    }
}

/// Parse file contents into a document value.
pub fn parse_doc(format: DocFormat, contents: &str) -> Result<Value> {
    match format {
        DocFormat::Yaml => Ok(serde_yaml::from_str(contents)?),
        DocFormat::Json => Ok(serde_json::from_str(contents)?),
    }
}

/// Serialize a document value. YAML uses block style; JSON is pretty-printed.
pub fn render_doc(format: DocFormat, value: &Value) -> Result<String> {
    match format {
        DocFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        DocFormat::Json => {
            let mut rendered = serde_json::to_string_pretty(value)?;
            rendered.push('\n');
            Ok(rendered)
        }
    }
}

/// Write `contents` to `path` atomically: write a temporary sibling, fsync it,
/// then rename over the destination. Readers observe either the old document
/// or the new one, never a truncated file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| OpalError::Validation(format!("path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| OpalError::Validation(format!("invalid file name: {}", path.display())))?;
    let tmp_path = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let write_result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if write_result.is_err() {
        // Release the temp sibling on every exit path
        let _ = std::fs::remove_file(&tmp_path);
    } else {
        // Persist the rename itself; failure here is not a torn write
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    write_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_by_extension() {
        assert_eq!(DocFormat::for_path(Path::new("a/b.yaml")), DocFormat::Yaml);
        assert_eq!(DocFormat::for_path(Path::new("a/b.yml")), DocFormat::Yaml);
        assert_eq!(DocFormat::for_path(Path::new("a/b.json")), DocFormat::Json);
        assert_eq!(DocFormat::for_path(Path::new("noext")), DocFormat::Json);
    }

    #[test]
    fn test_yaml_roundtrip_block_style() {
        let value = json!({"jobs": [{"name": "nightly", "enabled": true}]});
        let rendered = render_doc(DocFormat::Yaml, &value).unwrap();
        // serde_yaml emits block style by default
        assert!(rendered.contains("jobs:"));
        assert!(rendered.contains("- name: nightly"));
        let back = parse_doc(DocFormat::Yaml, &rendered).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_json_pretty_printed() {
        let value = json!({"a": 1});
        let rendered = render_doc(DocFormat::Json, &value).unwrap();
        assert!(rendered.contains("\n"));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn test_atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write(&path, "{\"v\": 1}\n").unwrap();
        atomic_write(&path, "{\"v\": 2}\n").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"v\": 2"));
        // No temp siblings left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory/state/notes.yaml");
        atomic_write(&path, "key: value\n").unwrap();
        assert!(path.exists());
    }
}
