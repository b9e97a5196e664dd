//! Application configuration.

use matchcast_core::Source;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Downstream server settings.
    pub server: ServerSettings,
    /// State cache settings.
    pub cache: CacheSettings,
    /// Cluster relay settings.
    pub relay: RelaySettings,
    /// Upstream feed configurations.
    pub feeds: Vec<FeedSettings>,
    /// Logging level.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            cache: CacheSettings::default(),
            relay: RelaySettings::default(),
            feeds: vec![
                FeedSettings::new(Source::Scores, "wss://scores.example.test/ws"),
                FeedSettings::new(Source::Ticker, "wss://ticker.example.test/ws"),
            ],
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is absent. `REDIS_URL` in the environment overrides the
    /// configured relay URL.
    pub fn load(path: &str) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("config file {} is invalid ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                config.relay.url = url;
            }
        }

        config
    }

    /// Settings for one source, if configured.
    pub fn feed(&self, source: Source) -> Option<&FeedSettings> {
        self.feeds.iter().find(|f| f.source == source)
    }
}

/// Downstream server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen port for WS/SSE/HTTP.
    pub port: u16,
    /// Heartbeat interval for downstream connections (seconds).
    pub heartbeat_secs: u64,
    /// Interval between batched `games_update` pushes to all-entities
    /// subscribers (seconds). Zero disables the batch push.
    pub batch_refresh_secs: u64,
    /// Per-connection outbound message buffer. A connection that falls this
    /// far behind is dropped.
    pub client_buffer: usize,
    /// Source that client-driven watches are routed to.
    pub client_source: Source,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 9001,
            heartbeat_secs: 25,
            batch_refresh_secs: 30,
            client_buffer: 256,
            client_source: Source::Scores,
        }
    }
}

/// State cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// How long concluded entities stay visible to readers (seconds).
    pub ended_grace_secs: u64,
    /// Background sweep interval for expired ended entities (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ended_grace_secs: 3 * 3600,
            sweep_interval_secs: 600,
        }
    }
}

/// Cluster relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Whether to join the cluster channel at all. Disabled means this
    /// worker serves only its own subscribers.
    pub enabled: bool,
    /// Redis URL.
    pub url: String,
    /// Shared pub/sub topic.
    pub topic: String,
    /// Refuse to start when the relay is unreachable.
    pub required: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            topic: "matchcast:updates".to_string(),
            required: false,
        }
    }
}

/// Per-source feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    /// Source identifier.
    pub source: Source,
    /// Whether enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// WebSocket URL.
    pub ws_url: String,
    /// Number of parallel connections for this source.
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Subscription ceiling per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Keys subscribed at startup (always-on interest, e.g. ticker
    /// symbols), independent of downstream demand.
    #[serde(default)]
    pub symbols: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_shards() -> usize {
    1
}

fn default_max_subscriptions() -> usize {
    2000
}

impl FeedSettings {
    pub fn new(source: Source, ws_url: impl Into<String>) -> Self {
        Self {
            source,
            enabled: true,
            ws_url: ws_url.into(),
            shards: 1,
            max_subscriptions: default_max_subscriptions(),
            symbols: Vec::new(),
        }
    }
}
