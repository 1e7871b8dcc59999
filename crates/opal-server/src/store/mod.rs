// crates/opal-server/src/store/mod.rs
// Persistent document store: atomic YAML/JSON files under the config root

mod atomic;
mod pointer;

pub use atomic::{DocFormat, atomic_write, parse_doc, render_doc};

use crate::error::{OpalError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// How often the write-behind flusher scans for quiet documents.
const FLUSH_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Cached parse of an on-disk document.
struct CachedDoc {
    value: Value,
    mtime: SystemTime,
}

/// A buffered write that has not reached disk yet.
struct DirtyDoc {
    value: Value,
    last_write: Instant,
}

/// Per-document state, guarded by one lock so reads and writes of the same
/// path are serialized.
#[derive(Default)]
struct DocState {
    cached: Option<CachedDoc>,
    dirty: Option<DirtyDoc>,
}

struct StoreInner {
    root: PathBuf,
    debounce: Duration,
    docs: Mutex<HashMap<PathBuf, Arc<Mutex<DocState>>>>,
}

/// Atomic read/write of small structured documents under a config root.
///
/// Writes are buffered (write-behind): a write marks the document dirty and a
/// background flusher persists it once the quiet window elapses, coalescing
/// bursts into a single atomic temp+rename. Same-process readers always see
/// the buffered value, never stale disk state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.into(),
                debounce,
                docs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store rooted at `root` with the default 2 s quiet window.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Duration::from_secs(2))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Resolve a store-relative path, rejecting escapes from the config root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(OpalError::Validation(format!("absolute path not allowed: {rel}")));
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(OpalError::Validation(format!(
                        "path may not contain '..' or root segments: {rel}"
                    )));
                }
            }
        }
        Ok(self.inner.root.join(rel_path))
    }

    async fn doc_state(&self, path: &Path) -> Arc<Mutex<DocState>> {
        let mut docs = self.inner.docs.lock().await;
        docs.entry(path.to_path_buf()).or_default().clone()
    }

    /// Load the current value of a document, assuming its lock is held.
    fn load_locked(state: &mut DocState, path: &Path) -> Result<Value> {
        if let Some(dirty) = &state.dirty {
            return Ok(dirty.value.clone());
        }

        let mtime = match std::fs::metadata(path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OpalError::NotFound(format!("no such document: {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(cached) = &state.cached {
            if cached.mtime == mtime {
                return Ok(cached.value.clone());
            }
        }

        let contents = std::fs::read_to_string(path)?;
        let value = parse_doc(DocFormat::for_path(path), &contents)?;
        state.cached = Some(CachedDoc { value: value.clone(), mtime });
        Ok(value)
    }

    fn flush_locked(state: &mut DocState, path: &Path) -> Result<()> {
        let Some(dirty) = state.dirty.take() else {
            return Ok(());
        };
        let rendered = render_doc(DocFormat::for_path(path), &dirty.value)?;
        if let Err(e) = atomic_write(path, &rendered) {
            // Put the buffer back so a later flush can retry
            state.dirty = Some(dirty);
            return Err(e);
        }
        let mtime = std::fs::metadata(path)?.modified()?;
        state.cached = Some(CachedDoc { value: dirty.value, mtime });
        Ok(())
    }

    /// Read a document. Fails with `not_found` or `parse`.
    pub async fn read(&self, rel: &str) -> Result<Value> {
        let path = self.resolve(rel)?;
        let state = self.doc_state(&path).await;
        let mut guard = state.lock().await;
        Self::load_locked(&mut guard, &path)
    }

    /// Read and deserialize a document into a typed value.
    pub async fn read_as<T: DeserializeOwned>(&self, rel: &str) -> Result<T> {
        let value = self.read(rel).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Buffer a full-document write. The flusher persists it after the quiet
    /// window; same-process reads observe the new value immediately.
    pub async fn write(&self, rel: &str, value: Value) -> Result<()> {
        let path = self.resolve(rel)?;
        let state = self.doc_state(&path).await;
        let mut guard = state.lock().await;
        guard.dirty = Some(DirtyDoc { value, last_write: Instant::now() });
        Ok(())
    }

    /// Serialize and buffer a typed document write.
    pub async fn write_value<T: Serialize>(&self, rel: &str, value: &T) -> Result<()> {
        self.write(rel, serde_json::to_value(value)?).await
    }

    /// Read-modify-write under the document lock: set `pointer` to `value`.
    /// A missing document starts as an empty object.
    pub async fn update(&self, rel: &str, ptr: &str, value: Value) -> Result<()> {
        let path = self.resolve(rel)?;
        let state = self.doc_state(&path).await;
        let mut guard = state.lock().await;
        let mut doc = match Self::load_locked(&mut guard, &path) {
            Ok(doc) => doc,
            Err(OpalError::NotFound(_)) => Value::Object(serde_json::Map::new()),
            Err(e) => return Err(e),
        };
        pointer::set(&mut doc, ptr, value)?;
        guard.dirty = Some(DirtyDoc { value: doc, last_write: Instant::now() });
        Ok(())
    }

    /// Read-modify-write with list semantics: push `item` onto the list at
    /// `pointer`, creating the list when absent.
    pub async fn append(&self, rel: &str, ptr: &str, item: Value) -> Result<()> {
        let path = self.resolve(rel)?;
        let state = self.doc_state(&path).await;
        let mut guard = state.lock().await;
        let mut doc = match Self::load_locked(&mut guard, &path) {
            Ok(doc) => doc,
            Err(OpalError::NotFound(_)) => Value::Object(serde_json::Map::new()),
            Err(e) => return Err(e),
        };
        pointer::append(&mut doc, ptr, item)?;
        guard.dirty = Some(DirtyDoc { value: doc, last_write: Instant::now() });
        Ok(())
    }

    /// Read-only dotted-path query (`*` fans out across collections).
    pub async fn query(&self, rel: &str, path_expr: &str) -> Result<Vec<Value>> {
        let doc = self.read(rel).await?;
        Ok(pointer::query(&doc, path_expr))
    }

    /// Whether a document exists on disk or in the write-behind buffer.
    pub async fn exists(&self, rel: &str) -> bool {
        match self.read(rel).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Synchronously flush every dirty document. Called on shutdown and by
    /// tests that need the on-disk state.
    pub async fn flush_all(&self) -> Result<()> {
        let entries: Vec<(PathBuf, Arc<Mutex<DocState>>)> = {
            let docs = self.inner.docs.lock().await;
            docs.iter().map(|(p, s)| (p.clone(), s.clone())).collect()
        };
        let mut first_err = None;
        for (path, state) in entries {
            let mut guard = state.lock().await;
            if let Err(e) = Self::flush_locked(&mut guard, &path) {
                warn!(path = %path.display(), error = %e, "Failed to flush document");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush documents whose quiet window has elapsed.
    async fn flush_quiet(&self) {
        let entries: Vec<(PathBuf, Arc<Mutex<DocState>>)> = {
            let docs = self.inner.docs.lock().await;
            docs.iter().map(|(p, s)| (p.clone(), s.clone())).collect()
        };
        for (path, state) in entries {
            let mut guard = state.lock().await;
            let due = guard
                .dirty
                .as_ref()
                .map(|d| d.last_write.elapsed() >= self.inner.debounce)
                .unwrap_or(false);
            if due {
                if let Err(e) = Self::flush_locked(&mut guard, &path) {
                    warn!(path = %path.display(), error = %e, "Write-behind flush failed (will retry)");
                } else {
                    debug!(path = %path.display(), "Flushed document");
                }
            }
        }
    }

    /// Spawn the write-behind flusher. It runs until the shutdown channel
    /// flips, then flushes everything one last time.
    pub fn spawn_flusher(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FLUSH_SCAN_INTERVAL) => {
                        store.flush_quiet().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            if let Err(e) = store.flush_all().await {
                                warn!(error = %e, "Final flush on shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), Duration::from_millis(10));
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_then_read_no_stale() {
        let (_dir, store) = test_store();
        store.write("memory/state/notes.yaml", json!({"k": 1})).await.unwrap();
        // Buffered write is immediately visible, before any flush
        assert_eq!(store.read("memory/state/notes.yaml").await.unwrap(), json!({"k": 1}));
        store.write("memory/state/notes.yaml", json!({"k": 2})).await.unwrap();
        assert_eq!(store.read("memory/state/notes.yaml").await.unwrap(), json!({"k": 2}));
    }

    #[tokio::test]
    async fn test_flush_all_persists_and_reload() {
        let (dir, store) = test_store();
        store.write("learned/tool_fixes.yaml", json!({"fixes": []})).await.unwrap();
        store.flush_all().await.unwrap();
        assert!(dir.path().join("learned/tool_fixes.yaml").exists());

        // A fresh store (fresh cache) reads the flushed state
        let store2 = Store::open(dir.path());
        assert_eq!(
            store2.read("learned/tool_fixes.yaml").await.unwrap(),
            json!({"fixes": []})
        );
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_dir, store) = test_store();
        let err = store.read("nope.json").await.unwrap_err();
        assert!(matches!(err, OpalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_parse_error_surfaces() {
        let (dir, store) = test_store();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let err = store.read("bad.json").await.unwrap_err();
        assert!(matches!(err, OpalError::Json(_)));
    }

    #[tokio::test]
    async fn test_update_and_append_pointers() {
        let (_dir, store) = test_store();
        store.update("workspace_states.json", "active.persona", json!("dev")).await.unwrap();
        store.append("workspace_states.json", "active.history", json!("loaded dev")).await.unwrap();
        let doc = store.read("workspace_states.json").await.unwrap();
        assert_eq!(doc["active"]["persona"], json!("dev"));
        assert_eq!(doc["active"]["history"], json!(["loaded dev"]));
    }

    #[tokio::test]
    async fn test_query_wildcard() {
        let (_dir, store) = test_store();
        store
            .write("schedules.yaml", json!({"jobs": [{"name": "a"}, {"name": "b"}]}))
            .await
            .unwrap();
        let names = store.query("schedules.yaml", "jobs.*.name").await.unwrap();
        assert_eq!(names, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.read("../outside.yaml").await.unwrap_err(),
            OpalError::Validation(_)
        ));
        assert!(matches!(
            store.write("/etc/passwd", json!({})).await.unwrap_err(),
            OpalError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_last_value_wins() {
        let (dir, store) = test_store();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("race.json", json!({"writer": i})).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        store.flush_all().await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("race.json")).unwrap();
        let doc: Value = serde_json::from_str(&contents).unwrap();
        // Exactly one of the writers' inputs is the final content
        let writer = doc["writer"].as_i64().unwrap();
        assert!((0..8).contains(&writer));
    }

    #[tokio::test]
    async fn test_external_modification_invalidates_cache() {
        let (dir, store) = test_store();
        store.write("doc.json", json!({"v": 1})).await.unwrap();
        store.flush_all().await.unwrap();
        assert_eq!(store.read("doc.json").await.unwrap()["v"], json!(1));

        // Simulate another process rewriting the file with a newer mtime
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{\"v\": 2}").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(future).unwrap();
        drop(file);

        assert_eq!(store.read("doc.json").await.unwrap()["v"], json!(2));
    }
}
