// crates/opal-server/src/bus/mod.rs
// Live execution bus: broadcast fan-out + confirmation rendezvous

pub mod server;

use opal_types::{BusEvent, ConfirmOption, EventFrame};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::debug;

/// Broadcast channel depth. Slow subscribers that fall this far behind are
/// dropped, not waited for.
const CHANNEL_CAPACITY: usize = 256;

struct PendingConfirmation {
    execution_id: String,
    step_id: String,
    answer_tx: oneshot::Sender<String>,
}

/// The bus every component publishes to. Broadcast is fire-and-forget; skill
/// execution never blocks on it except inside a confirmation wait.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventFrame>,
    pending: Arc<Mutex<HashMap<String, PendingConfirmation>>>,
    active_executions: Arc<AtomicUsize>,
    connected_clients: Arc<AtomicUsize>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            active_executions: Arc::new(AtomicUsize::new(0)),
            connected_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Broadcast an event to all subscribers. No subscribers is fine.
    pub fn emit(&self, event: BusEvent, execution_id: Option<String>) {
        let _ = self.tx.send(EventFrame::new(event, execution_id));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.tx.subscribe()
    }

    /// Register a pending confirmation, emit `confirmation_required`, and
    /// block until an answer arrives or the deadline elapses. A timeout is
    /// not an error; it resolves to `default`.
    pub async fn await_confirmation(
        &self,
        execution_id: &str,
        step_id: &str,
        message: &str,
        options: Vec<ConfirmOption>,
        default: Option<String>,
        timeout: Duration,
    ) -> String {
        let confirmation_id = uuid::Uuid::new_v4().to_string();
        let (answer_tx, answer_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                confirmation_id.clone(),
                PendingConfirmation {
                    execution_id: execution_id.to_string(),
                    step_id: step_id.to_string(),
                    answer_tx,
                },
            );
        }

        self.emit(
            BusEvent::ConfirmationRequired {
                confirmation_id: confirmation_id.clone(),
                step_id: step_id.to_string(),
                message: message.to_string(),
                options,
                default: default.clone(),
                timeout_seconds: timeout.as_secs(),
            },
            Some(execution_id.to_string()),
        );

        let fallback = default.unwrap_or_default();
        let answer = tokio::select! {
            received = answer_rx => received.unwrap_or_else(|_| fallback.clone()),
            _ = tokio::time::sleep(timeout) => {
                debug!(confirmation_id = %confirmation_id, "Confirmation timed out, using default");
                fallback
            }
        };

        // Drop the entry whether answered or timed out
        self.pending.lock().await.remove(&confirmation_id);
        answer
    }

    /// Resolve a pending confirmation. An unknown id is silently ignored.
    pub async fn resolve_confirmation(&self, confirmation_id: &str, answer: String) {
        let entry = self.pending.lock().await.remove(confirmation_id);
        match entry {
            Some(pending) => {
                debug!(
                    confirmation_id,
                    step_id = %pending.step_id,
                    execution_id = %pending.execution_id,
                    "Confirmation answered"
                );
                let _ = pending.answer_tx.send(answer);
            }
            None => {
                debug!(confirmation_id, "Answer for unknown confirmation ignored");
            }
        }
    }

    /// Cancel every confirmation pending for an execution (used on skill
    /// cancellation so waits resolve immediately to their defaults).
    pub async fn drop_confirmations_for(&self, execution_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, entry| entry.execution_id != execution_id);
    }

    pub fn execution_started(&self) {
        self.active_executions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn execution_finished(&self) {
        self.active_executions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::SeqCst);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_executions(&self) -> usize {
        self.active_executions.load(Ordering::SeqCst)
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::SeqCst)
    }

    /// Current heartbeat payload.
    pub fn heartbeat(&self) -> BusEvent {
        BusEvent::Heartbeat {
            server_status: "ok".to_string(),
            active_executions: self.active_executions(),
            connected_clients: self.connected_clients(),
        }
    }
}
