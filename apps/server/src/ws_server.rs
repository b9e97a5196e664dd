//! Downstream delivery: WebSocket and SSE endpoints plus health/status.
//!
//! Both transports carry the same [`BroadcastMessage`] envelope, one JSON
//! object per message/event. New connections receive an `initial` snapshot
//! seeded from the state cache before live updates flow.

use crate::hub::ConnId;
use crate::state::SharedState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, Stream, StreamExt};
use matchcast_core::{BroadcastMessage, EntityKey};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

/// Create the downstream router.
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sse", get(sse_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> &'static str {
    "OK"
}

/// Worker status: counters, feed connection states, relay readiness.
async fn status_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let summary = state.stats.summary();
    let feeds: Vec<serde_json::Value> = state
        .feed_states
        .iter()
        .map(|(label, rx)| {
            serde_json::json!({
                "connection": label,
                "state": format!("{:?}", *rx.borrow()),
            })
        })
        .collect();

    Json(serde_json::json!({
        "now": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": summary.uptime_secs,
        "running": state.is_running(),
        "entities": state.cache.len(),
        "connections": state.hub.connection_count(),
        "updates_ingested": summary.updates_ingested,
        "updates_applied": summary.updates_applied,
        "deliveries": state.hub.delivered_count(),
        "dropped_deliveries": state.hub.dropped_count(),
        "relay": {
            "enabled": state.relay.is_some(),
            "ready": state.relay_ready(),
            "published": summary.relay_published,
            "received": summary.relay_received,
        },
        "feeds": feeds,
    }))
}

/// Commands a WebSocket client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        all: bool,
    },
    Unsubscribe {
        #[serde(default)]
        keys: Vec<String>,
    },
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = state.hub.connect(state.config.server.client_buffer);
    debug!("ws client connected as {}", conn_id);

    // Initial snapshot before live updates.
    let initial = BroadcastMessage::Initial {
        games: state.cache.snapshot_active(state.ended_grace()),
    };
    match serde_json::to_string(&initial) {
        Ok(json) => {
            if sender.send(Message::Text(json)).await.is_err() {
                cleanup(&state, conn_id).await;
                return;
            }
        }
        Err(e) => warn!("initial snapshot encode failed: {}", e),
    }

    // Pump hub messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Process client commands until the connection closes.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_command(&state, conn_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("ws client {} error: {}", conn_id, e);
                break;
            }
            // Ping/pong handled by axum.
            _ => {}
        }
    }

    send_task.abort();
    cleanup(&state, conn_id).await;
    debug!("ws client {} disconnected", conn_id);
}

/// Closure of a downstream connection synchronously removes it from all
/// subscriber sets and releases its upstream interest.
async fn cleanup(state: &SharedState, conn_id: ConnId) {
    state.hub.disconnect(conn_id);
    state.router.drop_watcher(conn_id).await;
}

async fn handle_client_command(state: &SharedState, conn_id: ConnId, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!("ws client {} sent unparseable command: {}", conn_id, e);
            return;
        }
    };

    match command {
        ClientCommand::Subscribe { keys, all } => {
            if all {
                state.hub.subscribe_all(conn_id);
            }
            let accepted = register_keys(state, conn_id, &keys).await;
            state
                .hub
                .send_to(conn_id, BroadcastMessage::Subscribed { keys: accepted });
        }
        ClientCommand::Unsubscribe { keys } => {
            for raw in keys {
                let key = EntityKey::new(raw);
                state.hub.unsubscribe_key(conn_id, &key);
                if let Err(e) = state
                    .router
                    .unwatch(state.config.server.client_source, &key, conn_id)
                    .await
                {
                    debug!("unwatch {} failed: {}", key, e);
                }
            }
        }
    }
}

/// Register a connection's interest in a set of keys, both locally (hub)
/// and upstream (router). Returns the accepted keys for the ack.
async fn register_keys(
    state: &SharedState,
    conn_id: ConnId,
    keys: &[String],
) -> Vec<EntityKey> {
    let source = state.config.server.client_source;
    let mut accepted = Vec::new();
    for raw in keys {
        let key = EntityKey::new(raw);
        state.hub.subscribe_key(conn_id, &key);
        match state.router.watch(source, &key, conn_id).await {
            Ok(()) => accepted.push(key),
            Err(e) => {
                // Local delivery still works (relay-fed updates included);
                // the key just is not driving an upstream subscription.
                warn!("watch {} for {} failed: {}", key, conn_id, e);
            }
        }
    }
    accepted
}

/// Interest selection for SSE connections, where there is no command
/// channel: `?keys=a,b,c` and/or `?all=true`.
#[derive(Debug, Default, Deserialize)]
struct SseParams {
    #[serde(default)]
    keys: Option<String>,
    #[serde(default)]
    all: Option<bool>,
}

/// Removes the connection when the SSE stream is dropped.
struct SseGuard {
    state: SharedState,
    conn_id: ConnId,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        debug!("sse client {} disconnected", self.conn_id);
        self.state.hub.disconnect(self.conn_id);
        let state = Arc::clone(&self.state);
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            state.router.drop_watcher(conn_id).await;
        });
    }
}

/// SSE handler: same envelopes as the WebSocket endpoint, one JSON object
/// per event.
async fn sse_handler(
    Query(params): Query<SseParams>,
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (conn_id, rx) = state.hub.connect(state.config.server.client_buffer);
    debug!("sse client connected as {}", conn_id);

    if params.all.unwrap_or(false) {
        state.hub.subscribe_all(conn_id);
    }
    let keys: Vec<String> = params
        .keys
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .collect();
    register_keys(&state, conn_id, &keys).await;

    // The snapshot rides the same channel, so it is the first event out.
    let initial = BroadcastMessage::Initial {
        games: state.cache.snapshot_active(state.ended_grace()),
    };
    state.hub.send_to(conn_id, initial);

    let guard = SseGuard {
        state: state.clone(),
        conn_id,
    };
    let stream = ReceiverStream::new(rx).map(move |msg| {
        let _hold = &guard;
        Ok(Event::default().data(serde_json::to_string(&msg).unwrap_or_default()))
    });

    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_command_parsing() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"op":"subscribe","keys":["NBA-42","nhl-7"]}"#).unwrap();
        let ClientCommand::Subscribe { keys, all } = cmd else {
            panic!("expected subscribe");
        };
        assert_eq!(keys, vec!["NBA-42", "nhl-7"]);
        assert!(!all);

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"op":"subscribe","all":true}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Subscribe { all: true, .. }));

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"op":"unsubscribe","keys":["NBA-42"]}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Unsubscribe { .. }));

        assert!(serde_json::from_str::<ClientCommand>(r#"{"op":"mystery"}"#).is_err());
    }

    #[test]
    fn test_sse_params_parsing() {
        let params: SseParams = serde_json::from_str(r#"{"keys":"a,b,c","all":true}"#).unwrap();
        assert_eq!(params.keys.as_deref(), Some("a,b,c"));
        assert_eq!(params.all, Some(true));

        let params: SseParams = serde_json::from_str("{}").unwrap();
        assert!(params.keys.is_none());
        assert!(params.all.is_none());
    }
}
