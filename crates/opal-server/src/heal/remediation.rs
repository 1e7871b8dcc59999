// crates/opal-server/src/heal/remediation.rs
// Named remediation actions keyed by failure category and cluster hint

use super::classifier::InfraCategory;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A remediation action: runs side effects (VPN up, token refresh, ...) and
/// reports whether the original call is worth retrying.
pub type RemediationFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
struct NamedAction {
    name: String,
    func: RemediationFn,
}

/// The fixed remediation table: one network action, auth actions keyed by an
/// optional cluster hint attached at the decorator site.
#[derive(Clone, Default)]
pub struct RemediationActions {
    inner: Arc<RwLock<ActionTable>>,
}

#[derive(Default)]
struct ActionTable {
    network_fix: Option<NamedAction>,
    auth_fix: HashMap<Option<String>, NamedAction>,
}

/// Result of attempting remediation for one failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationOutcome {
    /// The action ran and succeeded; retry the original call once.
    Fixed { action: String },
    /// The action ran and failed; surface the original error.
    ActionFailed { action: String },
    /// No action registered for this category.
    NoAction,
}

impl RemediationActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network_fix<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        table.network_fix = Some(NamedAction { name: name.into(), func: Arc::new(func) });
    }

    /// Register an auth fix. `cluster = None` is the fallback for decorator
    /// sites with no cluster hint.
    pub fn set_auth_fix<F>(&self, cluster: Option<&str>, name: impl Into<String>, func: F)
    where
        F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        table.auth_fix.insert(
            cluster.map(|c| c.to_string()),
            NamedAction { name: name.into(), func: Arc::new(func) },
        );
    }

    fn action_for(&self, category: InfraCategory, cluster: Option<&str>) -> Option<NamedAction> {
        let table = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match category {
            InfraCategory::Network => table.network_fix.clone(),
            InfraCategory::Auth => table
                .auth_fix
                .get(&cluster.map(|c| c.to_string()))
                .or_else(|| table.auth_fix.get(&None))
                .cloned(),
            // Timeouts get no automatic action; the step-level retry policy owns them
            InfraCategory::Timeout => None,
        }
    }

    /// Run the registered action for a category. Action failures are logged
    /// and reported as "no fix"; the original error will propagate.
    pub async fn run(&self, category: InfraCategory, cluster: Option<&str>) -> RemediationOutcome {
        let Some(action) = self.action_for(category, cluster) else {
            return RemediationOutcome::NoAction;
        };

        match (action.func)().await {
            Ok(()) => RemediationOutcome::Fixed { action: action.name },
            Err(e) => {
                warn!(
                    action = %action.name,
                    category = category.as_str(),
                    error = %e,
                    "Remediation action failed"
                );
                RemediationOutcome::ActionFailed { action: action.name }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_network_fix_runs_once() {
        let actions = RemediationActions::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        actions.set_network_fix("vpn_connect", move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let outcome = actions.run(InfraCategory::Network, None).await;
        assert_eq!(outcome, RemediationOutcome::Fixed { action: "vpn_connect".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_fix_cluster_fallback() {
        let actions = RemediationActions::new();
        actions.set_auth_fix(None, "kinit", || Box::pin(async { Ok(()) }));
        actions.set_auth_fix(Some("prod"), "oc_login_prod", || Box::pin(async { Ok(()) }));

        match actions.run(InfraCategory::Auth, Some("prod")).await {
            RemediationOutcome::Fixed { action } => assert_eq!(action, "oc_login_prod"),
            other => panic!("unexpected: {other:?}"),
        }
        match actions.run(InfraCategory::Auth, Some("staging")).await {
            RemediationOutcome::Fixed { action } => assert_eq!(action, "kinit"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_action_failure_is_no_fix() {
        let actions = RemediationActions::new();
        actions.set_network_fix("vpn_connect", || {
            Box::pin(async { Err("vpn endpoint unreachable".to_string()) })
        });
        let outcome = actions.run(InfraCategory::Network, None).await;
        assert_eq!(outcome, RemediationOutcome::ActionFailed { action: "vpn_connect".into() });
    }

    #[tokio::test]
    async fn test_timeout_has_no_action() {
        let actions = RemediationActions::new();
        actions.set_network_fix("vpn_connect", || Box::pin(async { Ok(()) }));
        assert_eq!(actions.run(InfraCategory::Timeout, None).await, RemediationOutcome::NoAction);
    }
}
