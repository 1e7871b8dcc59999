// crates/opal-server/src/workspace/mod.rs
// Workspace and session registry, persisted as one JSON snapshot

use crate::error::{OpalError, Result};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// Snapshot document under the config root.
pub const WORKSPACE_STATES_PATH: &str = "workspace_states.json";

/// Sessions keep at most this many activity entries.
const ACTIVITY_CAP: usize = 100;

/// One line of a session's bounded activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub entry: String,
}

/// A named chat context inside a workspace. Never deleted except by explicit
/// tooling; resumable by id across server restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
}

impl Session {
    fn new(id: String, name: String, agent: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            created_at: now,
            updated_at: now,
            persona_override: None,
            agent,
            activity: Vec::new(),
        }
    }

    pub fn record(&mut self, entry: impl Into<String>) {
        self.activity.push(ActivityEntry { at: Utc::now(), entry: entry.into() });
        let overflow = self.activity.len().saturating_sub(ACTIVITY_CAP);
        if overflow > 0 {
            self.activity.drain(..overflow);
        }
        self.updated_at = Utc::now();
    }
}

/// A unique working context, usually a directory URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_mr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_session: Option<String>,
    #[serde(default)]
    pub sessions: HashMap<String, Session>,
}

impl Workspace {
    fn new(uri: String) -> Self {
        Self {
            uri,
            persona: None,
            project: None,
            active_issue: None,
            active_branch: None,
            active_mr: None,
            active_session: None,
            sessions: HashMap::new(),
        }
    }

    /// One-line summary reported by `session_start`.
    pub fn state_summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(persona) = &self.persona {
            parts.push(format!("persona={persona}"));
        }
        if let Some(project) = &self.project {
            parts.push(format!("project={project}"));
        }
        if let Some(issue) = &self.active_issue {
            parts.push(format!("issue={issue}"));
        }
        if let Some(branch) = &self.active_branch {
            parts.push(format!("branch={branch}"));
        }
        parts.push(format!("sessions={}", self.sessions.len()));
        parts.join(" ")
    }
}

/// Result of `session_start`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session_id: String,
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub state_summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workspaces: HashMap<String, Workspace>,
}

/// Singleton registry mapping workspace URI → workspace. The whole registry
/// is one document; every mutation schedules a snapshot write.
pub struct WorkspaceRegistry {
    store: Store,
    inner: RwLock<HashMap<String, Workspace>>,
    loaded: std::sync::atomic::AtomicBool,
}

impl WorkspaceRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            inner: RwLock::new(HashMap::new()),
            loaded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn ensure_loaded(&self) {
        use std::sync::atomic::Ordering;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.write().await;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        match self.store.read_as::<RegistryFile>(WORKSPACE_STATES_PATH).await {
            Ok(file) => *inner = file.workspaces,
            Err(OpalError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "Failed to load workspace states, starting empty"),
        }
        self.loaded.store(true, Ordering::Release);
    }

    async fn persist(&self, inner: &HashMap<String, Workspace>) {
        let file = RegistryFile { workspaces: inner.clone() };
        if let Err(e) = self.store.write_value(WORKSPACE_STATES_PATH, &file).await {
            warn!(error = %e, "Failed to persist workspace states");
        }
    }

    /// Idempotent lookup-or-create.
    pub async fn get_or_create(&self, uri: &str) -> Workspace {
        self.ensure_loaded().await;
        {
            let inner = self.inner.read().await;
            if let Some(ws) = inner.get(uri) {
                return ws.clone();
            }
        }
        let mut inner = self.inner.write().await;
        let ws = inner.entry(uri.to_string()).or_insert_with(|| Workspace::new(uri.to_string()));
        let snapshot = ws.clone();
        self.persist(&inner).await;
        snapshot
    }

    pub async fn get(&self, uri: &str) -> Option<Workspace> {
        self.ensure_loaded().await;
        self.inner.read().await.get(uri).cloned()
    }

    pub async fn all(&self) -> Vec<Workspace> {
        self.ensure_loaded().await;
        self.inner.read().await.values().cloned().collect()
    }

    /// Mutate a workspace under the registry lock and persist the snapshot.
    pub async fn update<F>(&self, uri: &str, mutate: F) -> Workspace
    where
        F: FnOnce(&mut Workspace),
    {
        self.ensure_loaded().await;
        let mut inner = self.inner.write().await;
        let ws = inner.entry(uri.to_string()).or_insert_with(|| Workspace::new(uri.to_string()));
        mutate(ws);
        let snapshot = ws.clone();
        self.persist(&inner).await;
        snapshot
    }

    /// Create or resume a session. A supplied id that is unknown creates a
    /// fresh session and reports `resumed: false`.
    pub async fn session_start(
        &self,
        uri: &str,
        name: Option<String>,
        session_id: Option<String>,
        agent: Option<String>,
    ) -> SessionStart {
        self.ensure_loaded().await;
        let mut inner = self.inner.write().await;
        let ws = inner.entry(uri.to_string()).or_insert_with(|| Workspace::new(uri.to_string()));

        let (id, resumed) = match session_id {
            Some(id) if ws.sessions.contains_key(&id) => {
                if let Some(session) = ws.sessions.get_mut(&id) {
                    session.updated_at = Utc::now();
                    if let Some(name) = &name {
                        session.name = name.clone();
                    }
                }
                (id, true)
            }
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                let name = name.unwrap_or_else(|| format!("session-{}", &id[..8]));
                ws.sessions.insert(id.clone(), Session::new(id.clone(), name, agent));
                (id, false)
            }
        };
        ws.active_session = Some(id.clone());

        let result = SessionStart {
            session_id: id,
            resumed,
            persona: ws.persona.clone(),
            project: ws.project.clone(),
            state_summary: ws.state_summary(),
        };
        self.persist(&inner).await;
        result
    }

    /// Read one session; `None` id means the active session.
    pub async fn session_info(&self, uri: &str, session_id: Option<&str>) -> Result<Session> {
        self.ensure_loaded().await;
        let inner = self.inner.read().await;
        let ws = inner
            .get(uri)
            .ok_or_else(|| OpalError::NotFound(format!("unknown workspace: {uri}")))?;
        let id = match session_id {
            Some(id) => id.to_string(),
            None => ws
                .active_session
                .clone()
                .ok_or_else(|| OpalError::NotFound("no active session".to_string()))?,
        };
        ws.sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| OpalError::NotFound(format!("unknown session: {id}")))
    }

    /// All sessions of a workspace, most recently updated first.
    pub async fn session_list(&self, uri: &str) -> Vec<Session> {
        self.ensure_loaded().await;
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .get(uri)
            .map(|ws| ws.sessions.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Set the active session; fails with `not_found` for unknown ids.
    pub async fn session_switch(&self, uri: &str, session_id: &str) -> Result<Session> {
        self.ensure_loaded().await;
        let mut inner = self.inner.write().await;
        let ws = inner
            .get_mut(uri)
            .ok_or_else(|| OpalError::NotFound(format!("unknown workspace: {uri}")))?;
        let session = ws
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OpalError::NotFound(format!("unknown session: {session_id}")))?;
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        ws.active_session = Some(session_id.to_string());
        self.persist(&inner).await;
        Ok(snapshot)
    }

    /// Append to a session's bounded activity log.
    pub async fn record_activity(&self, uri: &str, session_id: &str, entry: impl Into<String>) {
        self.ensure_loaded().await;
        let mut inner = self.inner.write().await;
        if let Some(session) =
            inner.get_mut(uri).and_then(|ws| ws.sessions.get_mut(session_id))
        {
            session.record(entry);
            self.persist(&inner).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> (tempfile::TempDir, WorkspaceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), Duration::from_millis(10));
        (dir, WorkspaceRegistry::new(store))
    }

    #[tokio::test]
    async fn test_get_or_create_idempotent() {
        let (_dir, registry) = registry();
        let a = registry.get_or_create("file:///work/repo").await;
        let b = registry.get_or_create("file:///work/repo").await;
        assert_eq!(a.uri, b.uri);
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_create_and_resume() {
        let (_dir, registry) = registry();
        let uri = "file:///work/repo";

        let created = registry.session_start(uri, Some("fix-auth".into()), None, None).await;
        assert!(!created.resumed);

        let resumed = registry
            .session_start(uri, None, Some(created.session_id.clone()), None)
            .await;
        assert!(resumed.resumed);
        assert_eq!(resumed.session_id, created.session_id);

        // Unknown id creates a fresh session and says so
        let fresh = registry
            .session_start(uri, None, Some("no-such-session".into()), None)
            .await;
        assert!(!fresh.resumed);
        assert_ne!(fresh.session_id, "no-such-session");
    }

    #[tokio::test]
    async fn test_session_switch_and_info() {
        let (_dir, registry) = registry();
        let uri = "file:///work/repo";
        let first = registry.session_start(uri, Some("one".into()), None, None).await;
        let second = registry.session_start(uri, Some("two".into()), None, None).await;

        // Active session is the latest start
        let info = registry.session_info(uri, None).await.unwrap();
        assert_eq!(info.id, second.session_id);

        registry.session_switch(uri, &first.session_id).await.unwrap();
        let info = registry.session_info(uri, None).await.unwrap();
        assert_eq!(info.id, first.session_id);

        assert!(registry.session_switch(uri, "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_activity_log_bounded() {
        let (_dir, registry) = registry();
        let uri = "file:///work/repo";
        let start = registry.session_start(uri, None, None, None).await;
        for i in 0..150 {
            registry.record_activity(uri, &start.session_id, format!("call {i}")).await;
        }
        let info = registry.session_info(uri, Some(&start.session_id)).await.unwrap();
        assert_eq!(info.activity.len(), 100);
        assert_eq!(info.activity.last().unwrap().entry, "call 149");
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let (dir, registry) = registry();
        let uri = "file:///work/repo";
        registry.session_start(uri, Some("persisted".into()), None, None).await;
        registry
            .update(uri, |ws| {
                ws.persona = Some("developer".into());
                ws.active_issue = Some("PROJ-17".into());
            })
            .await;
        registry.store.flush_all().await.unwrap();

        let reopened = WorkspaceRegistry::new(Store::new(dir.path(), Duration::from_millis(10)));
        let ws = reopened.get(uri).await.unwrap();
        assert_eq!(ws.persona.as_deref(), Some("developer"));
        assert_eq!(ws.active_issue.as_deref(), Some("PROJ-17"));
        assert_eq!(ws.sessions.len(), 1);
        let sessions = reopened.session_list(uri).await;
        assert_eq!(sessions[0].name, "persisted");
    }
}
