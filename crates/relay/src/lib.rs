//! Cluster relay over Redis pub/sub.
//!
//! Every worker publishes its accepted state changes to one shared topic
//! and subscribes to the same topic, so changes observed on any worker are
//! re-broadcast to every other worker's local fan-out hub. There is no
//! central cache; losing the relay degrades the system to per-worker
//! consistency instead of failing requests.

use futures_util::StreamExt;
use matchcast_core::{backoff_delay_ms, RelayEnvelope};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Buffer for outbound envelopes while the transport reconnects.
const PUBLISH_CHANNEL_BUFFER: usize = 4096;

/// Errors from the cluster relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("relay encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("relay channel closed")]
    ChannelClosed,
}

/// Handler invoked for every envelope published by another worker.
pub type RelayHandler = Arc<dyn Fn(RelayEnvelope) + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Pub/sub topic shared by all workers.
    pub topic: String,
    /// Fail startup if the transport is unreachable. When false (the
    /// default), the relay keeps retrying in the background and the worker
    /// serves its own subscribers meanwhile.
    pub required: bool,
    /// Cap applied to the reconnect backoff schedule (ms).
    pub max_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            topic: "matchcast:updates".to_string(),
            required: false,
            max_backoff_ms: 60_000,
        }
    }
}

/// This worker's identity, stamped on every published envelope so its own
/// messages can be skipped on the way back in.
pub fn worker_origin() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Handle to the cluster relay.
///
/// `publish` enqueues an envelope for the background publisher task;
/// inbound envelopes from other workers are delivered to the handler passed
/// at start. Cheap to clone.
#[derive(Clone)]
pub struct ClusterRelay {
    origin: String,
    out_tx: mpsc::Sender<RelayEnvelope>,
    ready: Arc<AtomicBool>,
}

impl ClusterRelay {
    /// Start the relay: verify reachability when required, then spawn the
    /// publisher and subscriber tasks.
    pub async fn start(config: RelayConfig, handler: RelayHandler) -> Result<Self, RelayError> {
        let client = redis::Client::open(config.url.as_str())?;

        if config.required {
            // One probe so a misconfigured required relay fails fast.
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| RelayError::Unavailable(e.to_string()))?;
            let pong: Result<String, redis::RedisError> =
                redis::cmd("PING").query_async(&mut conn).await;
            pong.map_err(|e| RelayError::Unavailable(e.to_string()))?;
        }

        let origin = worker_origin();
        let ready = Arc::new(AtomicBool::new(false));
        let (out_tx, out_rx) = mpsc::channel(PUBLISH_CHANNEL_BUFFER);

        tokio::spawn(run_publisher(
            client.clone(),
            config.clone(),
            out_rx,
            ready.clone(),
        ));
        tokio::spawn(run_subscriber(
            client,
            config,
            origin.clone(),
            handler,
            ready.clone(),
        ));

        Ok(Self {
            origin,
            out_tx,
            ready,
        })
    }

    /// Whether the subscription to the shared topic is currently live.
    /// Components consult this to pick a local-only fallback path.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Enqueue an envelope for publication. Failure means the relay is
    /// backed up or down; callers log and carry on serving local
    /// subscribers.
    pub fn publish(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
        match self.out_tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::Unavailable(
                "publish queue full".to_string(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::ChannelClosed),
        }
    }
}

async fn run_publisher(
    client: redis::Client,
    config: RelayConfig,
    mut out_rx: mpsc::Receiver<RelayEnvelope>,
    ready: Arc<AtomicBool>,
) {
    let mut attempt = 0u32;

    'reconnect: loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                attempt = 0;
                conn
            }
            Err(e) => {
                ready.store(false, Ordering::Relaxed);
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay_ms(attempt, config.max_backoff_ms);
                warn!(
                    "relay publisher connect failed (attempt #{}): {}. Retrying in {:.1}s",
                    attempt,
                    e,
                    delay as f64 / 1000.0
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }
        };
        debug!("relay publisher connected to {}", config.url);

        while let Some(envelope) = out_rx.recv().await {
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("relay envelope encode failed: {}", e);
                    continue;
                }
            };
            let published: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                .arg(&config.topic)
                .arg(&payload)
                .query_async(&mut conn)
                .await;
            if let Err(e) = published {
                // The envelope is dropped: at-least-once holds because the
                // cache state it carried will be superseded or re-read.
                warn!("relay publish failed, reconnecting: {}", e);
                continue 'reconnect;
            }
        }

        debug!("relay publisher stopped (channel closed)");
        return;
    }
}

async fn run_subscriber(
    client: redis::Client,
    config: RelayConfig,
    origin: String,
    handler: RelayHandler,
    ready: Arc<AtomicBool>,
) {
    let mut attempt = 0u32;

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                ready.store(false, Ordering::Relaxed);
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay_ms(attempt, config.max_backoff_ms);
                warn!(
                    "relay subscriber connect failed (attempt #{}): {}. Retrying in {:.1}s",
                    attempt,
                    e,
                    delay as f64 / 1000.0
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }
        };

        if let Err(e) = pubsub.subscribe(&config.topic).await {
            ready.store(false, Ordering::Relaxed);
            attempt = attempt.saturating_add(1);
            let delay = backoff_delay_ms(attempt, config.max_backoff_ms);
            warn!(
                "relay topic subscribe failed (attempt #{}): {}. Retrying in {:.1}s",
                attempt,
                e,
                delay as f64 / 1000.0
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            continue;
        }

        info!("relay subscribed to topic {}", config.topic);
        attempt = 0;
        ready.store(true, Ordering::Relaxed);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(payload) => handle_incoming(&payload, &origin, &handler),
                Err(e) => warn!("relay payload read failed: {}", e),
            }
        }

        // Stream ended: the connection dropped. Degrade and reconnect.
        ready.store(false, Ordering::Relaxed);
        warn!("relay subscription lost, reconnecting");
    }
}

/// Decode one inbound payload and hand it to the handler unless this worker
/// published it. Malformed payloads are logged and dropped.
fn handle_incoming(payload: &str, own_origin: &str, handler: &RelayHandler) {
    match serde_json::from_str::<RelayEnvelope>(payload) {
        Ok(envelope) => {
            if envelope.origin == own_origin {
                return;
            }
            handler(envelope);
        }
        Err(e) => {
            warn!(
                "relay dropped malformed envelope: {} ({})",
                e,
                &payload[..payload.len().min(200)]
            );
        }
    }
}
