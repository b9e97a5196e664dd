//! Connection state, per-source configuration, and reconnect backoff.

use matchcast_core::Source;

pub use matchcast_core::{backoff_delay_ms, BACKOFF_SCHEDULE_SECS};

/// Connection state for an upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Healthy connection; subscriptions replayed.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting { attempt: u32 },
    /// Shutting down; subscriptions are dropped without notice.
    Closing,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Configuration for one upstream feed connection.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket URL.
    pub ws_url: String,
    /// Which source this connection serves.
    pub source: Source,
    /// Shard index within the source (0 for unsharded feeds).
    pub shard: usize,
    /// Connection timeout (ms).
    pub connect_timeout_ms: u64,
    /// Ping interval to keep the connection alive (ms).
    pub ping_interval_ms: u64,
    /// Reconnect if no message of any kind arrives for this long (ms).
    pub idle_timeout_ms: u64,
    /// Attempts before the circuit opens and the client long-sleeps.
    pub max_reconnect_attempts: u32,
    /// Cap applied to the backoff schedule (ms).
    pub max_backoff_ms: u64,
    /// Long sleep once the attempt budget is exhausted (ms).
    pub circuit_open_ms: u64,
    /// Hard ceiling on concurrently subscribed keys for this connection.
    pub max_subscriptions: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            source: Source::Scores,
            shard: 0,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            idle_timeout_ms: 120_000,
            max_reconnect_attempts: 10,
            max_backoff_ms: 60_000,
            circuit_open_ms: 300_000,
            max_subscriptions: 2000,
        }
    }
}

impl FeedConfig {
    /// Config for one shard of a source.
    pub fn for_source(source: Source, ws_url: impl Into<String>, shard: usize) -> Self {
        Self {
            ws_url: ws_url.into(),
            source,
            shard,
            ..Default::default()
        }
    }

    /// Label used in logs: `scores` or `book#2`.
    pub fn label(&self) -> String {
        if self.shard == 0 {
            self.source.to_string()
        } else {
            format!("{}#{}", self.source, self.shard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting { attempt: 3 }.is_connected());
        assert!(!ConnectionState::Idle.is_connected());
    }

    #[test]
    fn test_feed_config_labels() {
        let cfg = FeedConfig::for_source(Source::Scores, "wss://example.test/ws", 0);
        assert_eq!(cfg.label(), "scores");
        let cfg = FeedConfig::for_source(Source::Book, "wss://example.test/ws", 2);
        assert_eq!(cfg.label(), "book#2");
    }

    #[test]
    fn test_feed_config_defaults() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.max_subscriptions, 2000);
        assert!(cfg.idle_timeout_ms > cfg.ping_interval_ms);
    }
}
