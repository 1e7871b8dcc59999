// crates/opal-server/src/bus/server.rs
// WebSocket endpoint for the live execution bus (loopback only)

use super::EventBus;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use opal_types::Topic;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Heartbeat cadence on the status topic.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct WsState {
    bus: EventBus,
}

/// Bind the bus endpoint on loopback and spawn the accept loop plus the
/// heartbeat task. Returns once the listener is bound so callers can fail
/// fast on port conflicts.
pub async fn serve(
    bus: EventBus,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> crate::error::Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { bus: bus.clone() });

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Execution bus listening");

    // Heartbeat: status frames at a fixed cadence
    let heartbeat_bus = bus.clone();
    let mut heartbeat_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let event = heartbeat_bus.heartbeat();
                    heartbeat_bus.emit(event, None);
                }
                _ = heartbeat_shutdown.changed() => {
                    if *heartbeat_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let handle = tokio::spawn(async move {
        let serve_future = axum::serve(listener, app);
        tokio::select! {
            result = serve_future => {
                if let Err(e) = result {
                    warn!(error = %e, "Execution bus server stopped");
                }
            }
            _ = shutdown.changed() => {
                debug!("Execution bus shutting down");
            }
        }
    });

    Ok(handle)
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let bus = state.bus;
    bus.client_connected();

    // Default subscription on connect is `all`
    let topics: Arc<RwLock<HashSet<Topic>>> = Arc::new(RwLock::new(HashSet::from([Topic::All])));

    let mut rx = bus.subscribe();

    // Forward matching broadcast frames to this client. A subscriber that
    // lags behind the channel is dropped, not waited for.
    let send_topics = topics.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let wanted = {
                        let topics = send_topics.read().await;
                        topics.contains(&Topic::All) || topics.contains(&frame.event.topic())
                    };
                    if !wanted {
                        continue;
                    }
                    match serde_json::to_string(&frame) {
                        Ok(msg) => {
                            if sender.send(Message::Text(msg.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize event frame");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged, dropping");
                    break;
                }
                Err(_) => break,
            }
        }
    });

    // Inbound frames: subscriptions and confirmation answers
    let recv_bus = bus.clone();
    let recv_topics = topics;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else { continue };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                debug!("Ignoring malformed client frame");
                continue;
            };
            match value.get("type").and_then(|t| t.as_str()) {
                Some("subscribe") => {
                    let parsed: HashSet<Topic> = value
                        .pointer("/data/topics")
                        .and_then(|t| t.as_array())
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                                .collect()
                        })
                        .unwrap_or_default();
                    if !parsed.is_empty() {
                        let mut topics = recv_topics.write().await;
                        *topics = parsed;
                    }
                }
                Some("confirmation_answer") => {
                    let id = value.pointer("/data/confirmation_id").and_then(|v| v.as_str());
                    let answer = value.pointer("/data/answer").and_then(|v| v.as_str());
                    if let (Some(id), Some(answer)) = (id, answer) {
                        recv_bus.resolve_confirmation(id, answer.to_string()).await;
                    }
                }
                other => {
                    debug!(frame_type = ?other, "Ignoring unknown client frame");
                }
            }
        }
    });

    // Whichever half finishes first tears the connection down
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    bus.client_disconnected();
    debug!("WebSocket client disconnected");
}
