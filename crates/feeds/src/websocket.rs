//! WebSocket client for upstream feed connections.

use crate::decode::{UpstreamCommand, APP_PONG};
use crate::manager::{backoff_delay_ms, ConnectionState, FeedConfig};
use crate::FeedError;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Buffer size for subscription change channels.
pub const SUBSCRIPTION_CHANNEL_BUFFER: usize = 1024;

/// Buffer size for the outbound raw message channel.
const MESSAGE_CHANNEL_BUFFER: usize = 1000;

/// Subscription change request delivered to a [`WsClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Add keys to the desired set; sent upstream when connected, queued
    /// otherwise.
    Subscribe(Vec<String>),
    /// Remove keys; the matching unsubscribe command is sent if connected.
    Unsubscribe(Vec<String>),
}

/// Message received from a WebSocket connection.
#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Text frame (JSON).
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Connection established (first time).
    Connected,
    /// Connection lost; backoff and reconnect follow.
    Disconnected,
    /// Reconnected after disconnection; the desired subscription set has
    /// been replayed upstream.
    Reconnected,
    /// Attempt budget exhausted; the client sleeps this long before
    /// resuming attempts.
    CircuitBreakerOpen(Duration),
    /// Permanent error; the client will not retry.
    Error(String),
}

/// Everything the owner needs to talk to a spawned feed connection.
pub struct SpawnedFeed {
    /// Raw frames and lifecycle events from the connection.
    pub messages: mpsc::Receiver<WsMessage>,
    /// Subscription changes into the connection. Dropping this sender shuts
    /// the client down cleanly.
    pub subscriptions: mpsc::Sender<SubscriptionChange>,
    /// Live connection state, for status reporting.
    pub state: watch::Receiver<ConnectionState>,
    pub handle: tokio::task::JoinHandle<()>,
}

/// WebSocket client for a single upstream connection.
///
/// Owns the desired subscription set. Reconnects indefinitely with the
/// capped backoff schedule; after `max_reconnect_attempts` consecutive
/// failures it emits [`WsMessage::CircuitBreakerOpen`] and long-sleeps
/// instead of exiting.
pub struct WsClient {
    config: FeedConfig,
    tx: mpsc::Sender<WsMessage>,
    sub_rx: mpsc::Receiver<SubscriptionChange>,
    state_tx: watch::Sender<ConnectionState>,
    desired: BTreeSet<String>,
    next_request_id: AtomicU64,
    has_connected: bool,
}

impl WsClient {
    /// Create a new WebSocket client.
    pub fn new(
        config: FeedConfig,
        tx: mpsc::Sender<WsMessage>,
        sub_rx: mpsc::Receiver<SubscriptionChange>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            tx,
            sub_rx,
            state_tx,
            desired: BTreeSet::new(),
            next_request_id: AtomicU64::new(1),
            has_connected: false,
        }
    }

    /// Watch the connection state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Spawn a client on the runtime and hand back its channels.
    pub fn spawn(config: FeedConfig) -> SpawnedFeed {
        let (tx, messages) = mpsc::channel(MESSAGE_CHANNEL_BUFFER);
        let (sub_tx, sub_rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_BUFFER);
        let client = Self::new(config, tx, sub_rx);
        let state = client.state_watch();
        let label = client.config.label();

        let handle = tokio::spawn(async move {
            if let Err(e) = client.run().await {
                error!("{}: feed client stopped: {}", label, e);
            }
        });

        SpawnedFeed {
            messages,
            subscriptions: sub_tx,
            state,
            handle,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Connect and run until shutdown (subscription channel dropped) or a
    /// permanent failure.
    pub async fn run(mut self) -> Result<(), FeedError> {
        let label = self.config.label();
        let mut reconnect_attempts = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);
            let connection_start = Instant::now();

            match self.connect_and_handle().await {
                Ok(()) => {
                    debug!("{}: connection closed for shutdown", label);
                    self.set_state(ConnectionState::Idle);
                    return Ok(());
                }
                Err(e) if e.is_permanent() => {
                    error!("{}: permanent failure, not retrying: {}", label, e);
                    let _ = self.tx.send(WsMessage::Error(e.to_string())).await;
                    self.set_state(ConnectionState::Idle);
                    return Err(e);
                }
                Err(e) => {
                    // Any completed handshake restarts the backoff schedule
                    // from the top.
                    if self.state_tx.borrow().is_connected() {
                        reconnect_attempts = 0;
                    }
                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let _ = self.tx.send(WsMessage::Disconnected).await;
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: reconnect_attempts,
                    });

                    if reconnect_attempts > self.config.max_reconnect_attempts {
                        let pause = Duration::from_millis(self.config.circuit_open_ms);
                        warn!(
                            "{}: {} consecutive failures, circuit open for {:?}: {}",
                            label, reconnect_attempts, pause, e
                        );
                        let _ = self.tx.send(WsMessage::CircuitBreakerOpen(pause)).await;
                        tokio::time::sleep(pause).await;
                        reconnect_attempts = 0;
                        continue;
                    }

                    let delay_ms =
                        backoff_delay_ms(reconnect_attempts, self.config.max_backoff_ms);
                    let jitter = (delay_ms as f64 * rand::thread_rng().gen::<f64>() * 0.25) as u64;
                    warn!(
                        "{}: error after {:?}: {}. Reconnecting in {:.1}s (attempt #{})",
                        label,
                        connection_start.elapsed(),
                        e,
                        (delay_ms + jitter) as f64 / 1000.0,
                        reconnect_attempts
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                }
            }
        }
    }

    async fn connect_and_handle(&mut self) -> Result<(), FeedError> {
        let label = self.config.label();
        debug!("{}: connecting to {}", label, self.config.ws_url);

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, response) = tokio::time::timeout(
            connect_timeout,
            connect_async(&self.config.ws_url),
        )
        .await
        .map_err(|_| FeedError::Timeout(format!("connect to {}", self.config.ws_url)))??;
        debug!("{}: connected (status: {:?})", label, response.status());

        let first = !self.has_connected;
        self.has_connected = true;
        self.set_state(ConnectionState::Connected);
        let _ = self
            .tx
            .send(if first {
                WsMessage::Connected
            } else {
                WsMessage::Reconnected
            })
            .await;

        let (mut write, mut read) = ws_stream.split();

        // Split borrows so the select loop can use the channel and the
        // subscription set independently.
        let sub_rx = &mut self.sub_rx;
        let tx = &self.tx;
        let desired = &mut self.desired;
        let next_id = &self.next_request_id;
        let state_tx = &self.state_tx;
        let max_subs = self.config.max_subscriptions;

        // Fold changes queued while disconnected into the desired set, then
        // replay the whole set in bounded batches.
        loop {
            match sub_rx.try_recv() {
                Ok(change) => {
                    let _ = apply_change(desired, max_subs, next_id, &label, change);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    state_tx.send_replace(ConnectionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
        if !desired.is_empty() {
            let topics: Vec<String> = desired.iter().cloned().collect();
            for cmd in UpstreamCommand::subscribe_batched(next_id, &topics) {
                write
                    .send(Message::Text(cmd))
                    .await
                    .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;
            }
            info!("{}: replayed {} subscriptions", label, desired.len());
        }

        let mut ping_timer =
            tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms));
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut last_message = Instant::now();

        loop {
            // Runs at least once per ping interval, so silent connections
            // are noticed within idle_timeout + ping_interval.
            if last_message.elapsed() > idle_timeout {
                return Err(FeedError::Disconnected(format!(
                    "no messages for {:?}",
                    last_message.elapsed()
                )));
            }

            tokio::select! {
                msg = read.next() => {
                    last_message = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            // Application-level liveness probes are answered
                            // here so the data path cannot starve them.
                            if text.contains(r#""type":"ping""#) {
                                write
                                    .send(Message::Text(APP_PONG.to_string()))
                                    .await
                                    .map_err(|e| FeedError::ConnectionFailed(format!("pong send failed: {e}")))?;
                                continue;
                            }
                            // A fatal rejection (bad credentials, revoked
                            // access) must not be retried blindly.
                            if text.contains(r#""type":"error""#)
                                && text.contains(r#""fatal":true"#)
                            {
                                return Err(FeedError::AuthenticationFailed(text));
                            }
                            forward(tx, WsMessage::Text(text), &label)?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            forward(tx, WsMessage::Binary(data), &label)?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| FeedError::ConnectionFailed(format!("pong send failed: {e}")))?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            return Err(FeedError::Disconnected(format!("close frame: {frame:?}")));
                        }
                        Some(Ok(other)) => {
                            warn!("{}: unexpected message type: {:?}", label, other);
                        }
                        Some(Err(e)) => {
                            return Err(FeedError::ConnectionFailed(e.to_string()));
                        }
                        None => {
                            return Err(FeedError::Disconnected("stream ended".to_string()));
                        }
                    }
                }
                change = sub_rx.recv() => {
                    match change {
                        Some(change) => {
                            for cmd in apply_change(desired, max_subs, next_id, &label, change) {
                                write
                                    .send(Message::Text(cmd))
                                    .await
                                    .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;
                            }
                        }
                        None => {
                            debug!("{}: subscription channel closed, shutting down", label);
                            state_tx.send_replace(ConnectionState::Closing);
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| FeedError::ConnectionFailed(format!("ping failed: {e}")))?;
                }
            }
        }
    }
}

/// Forward a message to the owner without blocking the socket. A full
/// channel means the consumer fell behind far enough that a reconnect (and
/// subscription replay) is the cheapest way back to a consistent stream.
fn forward(tx: &mpsc::Sender<WsMessage>, msg: WsMessage, label: &str) -> Result<(), FeedError> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{}: message channel full, forcing reconnect to resync", label);
            Err(FeedError::Disconnected("channel full - resync needed".to_string()))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(FeedError::Disconnected("channel closed".to_string()))
        }
    }
}

/// Apply a subscription change to the desired set and build the wire
/// commands for the delta. Keys already present (or absent, for
/// unsubscribes) produce no commands; growth past `max_subscriptions` is
/// refused and logged.
fn apply_change(
    desired: &mut BTreeSet<String>,
    max_subscriptions: usize,
    next_id: &AtomicU64,
    label: &str,
    change: SubscriptionChange,
) -> Vec<String> {
    match change {
        SubscriptionChange::Subscribe(keys) => {
            let mut added = Vec::new();
            for key in keys {
                if desired.contains(&key) {
                    continue;
                }
                if desired.len() >= max_subscriptions {
                    warn!(
                        "{}: subscription ceiling ({}) reached, refusing {}",
                        label, max_subscriptions, key
                    );
                    continue;
                }
                desired.insert(key.clone());
                added.push(key);
            }
            if added.is_empty() {
                Vec::new()
            } else {
                UpstreamCommand::subscribe_batched(next_id, &added)
            }
        }
        SubscriptionChange::Unsubscribe(keys) => {
            let removed: Vec<String> = keys.into_iter().filter(|k| desired.remove(k)).collect();
            if removed.is_empty() {
                Vec::new()
            } else {
                UpstreamCommand::unsubscribe_batched(next_id, &removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchcast_core::Source;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn topics_of(cmd: &str) -> Vec<String> {
        let parsed: Value = serde_json::from_str(cmd).unwrap();
        parsed["topics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_apply_change_dedupes_and_diffs() {
        let mut desired = BTreeSet::new();
        let next_id = AtomicU64::new(1);

        let cmds = apply_change(
            &mut desired,
            100,
            &next_id,
            "scores",
            SubscriptionChange::Subscribe(vec!["a".into(), "b".into()]),
        );
        assert_eq!(cmds.len(), 1);
        assert_eq!(topics_of(&cmds[0]), vec!["a", "b"]);

        // Re-subscribing an existing key is a no-op on the wire.
        let cmds = apply_change(
            &mut desired,
            100,
            &next_id,
            "scores",
            SubscriptionChange::Subscribe(vec!["a".into(), "c".into()]),
        );
        assert_eq!(topics_of(&cmds[0]), vec!["c"]);
        assert_eq!(desired.len(), 3);
    }

    #[test]
    fn test_apply_change_unsubscribe_only_known_keys() {
        let mut desired: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let next_id = AtomicU64::new(1);

        let cmds = apply_change(
            &mut desired,
            100,
            &next_id,
            "ticker",
            SubscriptionChange::Unsubscribe(vec!["b".into(), "zzz".into()]),
        );
        assert_eq!(cmds.len(), 1);
        assert_eq!(topics_of(&cmds[0]), vec!["b"]);
        assert_eq!(desired.len(), 1);

        // Unsubscribing nothing known sends nothing.
        let cmds = apply_change(
            &mut desired,
            100,
            &next_id,
            "ticker",
            SubscriptionChange::Unsubscribe(vec!["zzz".into()]),
        );
        assert!(cmds.is_empty());
    }

    #[test]
    fn test_apply_change_enforces_ceiling() {
        let mut desired = BTreeSet::new();
        let next_id = AtomicU64::new(1);

        let keys: Vec<String> = (0..5).map(|i| format!("k{i}")).collect();
        let cmds = apply_change(
            &mut desired,
            3,
            &next_id,
            "book#0",
            SubscriptionChange::Subscribe(keys),
        );
        // Only the first three fit; existing subscriptions are untouched.
        assert_eq!(desired.len(), 3);
        assert_eq!(topics_of(&cmds[0]), vec!["k0", "k1", "k2"]);
    }

    #[test]
    fn test_large_subscribe_is_batched() {
        let mut desired = BTreeSet::new();
        let next_id = AtomicU64::new(1);
        let keys: Vec<String> = (0..130).map(|i| format!("k{i:03}")).collect();

        let cmds = apply_change(
            &mut desired,
            1000,
            &next_id,
            "scores",
            SubscriptionChange::Subscribe(keys),
        );
        assert_eq!(cmds.len(), 3);
        assert!(cmds.iter().all(|c| topics_of(c).len() <= 50));
    }

    #[test]
    fn test_forward_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = forward(&tx, WsMessage::Text("x".into()), "scores").unwrap_err();
        assert!(matches!(err, FeedError::Disconnected(_)));
    }

    #[test]
    fn test_forward_full_channel_forces_resync() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(forward(&tx, WsMessage::Text("a".into()), "scores").is_ok());
        let err = forward(&tx, WsMessage::Text("b".into()), "scores").unwrap_err();
        assert!(err.to_string().contains("resync"));
    }

    #[tokio::test]
    async fn test_client_starts_idle() {
        let config = FeedConfig::for_source(Source::Scores, "wss://example.test/ws", 0);
        let (tx, _rx) = mpsc::channel(10);
        let (_sub_tx, sub_rx) = mpsc::channel(10);
        let client = WsClient::new(config, tx, sub_rx);
        assert_eq!(*client.state_watch().borrow(), ConnectionState::Idle);
    }
}
