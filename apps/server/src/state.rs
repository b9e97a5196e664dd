//! Application state shared across components.

use crate::coalescer::ReadCoalescer;
use crate::config::AppConfig;
use crate::hub::FanoutHub;
use matchcast_cache::StateCache;
use matchcast_core::epoch_ms;
use matchcast_feeds::{ConnectionState, SubscriptionRouter};
use matchcast_relay::ClusterRelay;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Watcher id for the process's own always-on subscriptions; downstream
/// connection ids start at 1.
pub const PROCESS_WATCHER: u64 = 0;

/// Worker counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Updates received from upstream feeds.
    pub updates_ingested: AtomicU64,
    /// Updates that changed the cache (non-no-op).
    pub updates_applied: AtomicU64,
    /// Envelopes published to the cluster relay.
    pub relay_published: AtomicU64,
    /// Envelopes received from other workers.
    pub relay_received: AtomicU64,
    /// Start time in milliseconds.
    started_at_ms: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at_ms: AtomicU64::new(epoch_ms()),
            ..Default::default()
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        epoch_ms().saturating_sub(self.started_at_ms.load(Ordering::Relaxed)) / 1000
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            updates_ingested: self.updates_ingested.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            relay_published: self.relay_published.load(Ordering::Relaxed),
            relay_received: self.relay_received.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Summary of worker counters.
#[derive(Debug, Clone)]
pub struct StatsSummary {
    pub updates_ingested: u64,
    pub updates_applied: u64,
    pub relay_published: u64,
    pub relay_received: u64,
    pub uptime_secs: u64,
}

/// Application state shared across components.
pub struct AppState {
    /// Configuration.
    pub config: AppConfig,
    /// State cache.
    pub cache: Arc<StateCache>,
    /// Local fan-out hub.
    pub hub: Arc<FanoutHub>,
    /// Subscription router.
    pub router: Arc<SubscriptionRouter>,
    /// Cluster relay, when enabled and started.
    pub relay: Option<ClusterRelay>,
    /// Read-path coalescer.
    pub coalescer: Arc<ReadCoalescer>,
    /// Worker counters.
    pub stats: Arc<ServerStats>,
    /// Running flag.
    running: AtomicBool,
    /// Connection state per feed connection, for the status surface.
    pub feed_states: Vec<(String, watch::Receiver<ConnectionState>)>,
}

/// Shared application state.
pub type SharedState = Arc<AppState>;

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        cache: Arc<StateCache>,
        hub: Arc<FanoutHub>,
        router: Arc<SubscriptionRouter>,
        relay: Option<ClusterRelay>,
        coalescer: Arc<ReadCoalescer>,
        stats: Arc<ServerStats>,
        feed_states: Vec<(String, watch::Receiver<ConnectionState>)>,
    ) -> Self {
        Self {
            config,
            cache,
            hub,
            router,
            relay,
            coalescer,
            stats,
            running: AtomicBool::new(true),
            feed_states,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Grace window during which concluded entities remain visible.
    pub fn ended_grace(&self) -> Duration {
        Duration::from_secs(self.config.cache.ended_grace_secs)
    }

    pub fn relay_ready(&self) -> bool {
        self.relay.as_ref().map(|r| r.is_ready()).unwrap_or(false)
    }
}
