//! Matchcast worker: live game/market state ingestion, cache, and fan-out.
//!
//! One worker process holds the upstream feed connections, the state cache,
//! and the downstream WS/SSE connections; the cluster relay keeps a fleet
//! of workers behind a load balancer convergent.

mod coalescer;
mod config;
mod hub;
mod state;
mod ws_server;

use clap::Parser;
use coalescer::ReadCoalescer;
use config::AppConfig;
use hub::FanoutHub;
use matchcast_cache::StateCache;
use matchcast_core::{
    epoch_ms, BroadcastMessage, EntityKey, RelayEnvelope, RelayKind, RelayUpdate, UpdateKind,
    UpdateOrigin,
};
use matchcast_feeds::{
    run_source, ConnectionEvent, ConnectionState, FeedConfig, FeedMessage, ShardHandle,
    SubscriptionRouter, WsClient,
};
use matchcast_relay::{ClusterRelay, RelayConfig, RelayHandler};
use state::{AppState, ServerStats, SharedState, PROCESS_WATCHER};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Matchcast worker CLI.
#[derive(Parser, Debug)]
#[command(name = "matchcast")]
#[command(about = "Live state ingestion and fan-out worker", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Listen port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Spawn one WebSocket client + runner per configured shard and register
/// their subscription channels with the router.
fn spawn_feeds(
    config: &AppConfig,
) -> (
    SubscriptionRouter,
    Vec<(String, watch::Receiver<ConnectionState>)>,
    mpsc::Receiver<FeedMessage>,
) {
    let (feed_tx, feed_rx) = mpsc::channel(4096);
    let mut router = SubscriptionRouter::new();
    let mut feed_states = Vec::new();

    for settings in config.feeds.iter().filter(|f| f.enabled) {
        let shard_count = settings.shards.max(1);
        let mut handles = Vec::new();
        for shard in 0..shard_count {
            let mut feed_config = FeedConfig::for_source(settings.source, &settings.ws_url, shard);
            feed_config.max_subscriptions = settings.max_subscriptions;
            let label = feed_config.label();

            let spawned = WsClient::spawn(feed_config);
            tokio::spawn(run_source(settings.source, spawned.messages, feed_tx.clone()));
            handles.push(ShardHandle::new(
                spawned.subscriptions,
                settings.max_subscriptions,
            ));
            feed_states.push((label, spawned.state));
        }
        info!("{}: {} connection(s) started", settings.source, shard_count);
        router.register_source(settings.source, handles);
    }

    (router, feed_states, feed_rx)
}

/// Always-on interest (e.g. the configured ticker symbols) is subscribed at
/// startup under the process watcher, independent of downstream demand.
async fn subscribe_always_on(config: &AppConfig, router: &SubscriptionRouter) {
    for settings in config.feeds.iter().filter(|f| f.enabled) {
        for symbol in &settings.symbols {
            let key = EntityKey::new(symbol);
            if let Err(e) = router.watch(settings.source, &key, PROCESS_WATCHER).await {
                warn!("{}: always-on subscribe {} failed: {}", settings.source, key, e);
            }
        }
        if !settings.symbols.is_empty() {
            info!(
                "{}: {} always-on subscriptions",
                settings.source,
                settings.symbols.len()
            );
        }
    }
}

/// Handler for envelopes published by other workers. Data kinds are applied
/// to the cache as remote-origin updates (which re-publishes them to this
/// worker's hub); `cache_invalidate` is internal-only and goes to the read
/// coalescer, never to downstream clients.
fn relay_handler(
    cache: Arc<StateCache>,
    coalescer: Arc<ReadCoalescer>,
    stats: Arc<ServerStats>,
) -> RelayHandler {
    Arc::new(move |envelope| {
        stats.relay_received.fetch_add(1, Ordering::Relaxed);
        match envelope.kind {
            RelayKind::Full => match envelope.decode_update() {
                Ok(update) => {
                    cache.apply_full(&update.key, update.state, UpdateOrigin::Remote);
                }
                Err(e) => warn!("relay full decode failed: {}", e),
            },
            RelayKind::Partial => match envelope.decode_update() {
                Ok(update) => {
                    cache.apply_partial(&update.key, update.state, UpdateOrigin::Remote);
                }
                Err(e) => warn!("relay partial decode failed: {}", e),
            },
            RelayKind::Batch => match envelope.decode_batch() {
                Ok(updates) => {
                    for update in updates {
                        cache.apply_full(&update.key, update.state, UpdateOrigin::Remote);
                    }
                }
                Err(e) => warn!("relay batch decode failed: {}", e),
            },
            RelayKind::CacheInvalidate => match envelope.decode_key() {
                Ok(key) => {
                    coalescer.invalidate(key.as_str());
                }
                Err(e) => warn!("relay invalidate decode failed: {}", e),
            },
        }
    })
}

/// Wire the cache into the broadcast layer: every accepted change goes to
/// the local hub, and locally ingested changes additionally go cluster-wide.
fn wire_broadcast(
    cache: &StateCache,
    hub: Arc<FanoutHub>,
    relay: Option<ClusterRelay>,
    stats: Arc<ServerStats>,
) {
    cache.on_change(move |key, state, kind, origin, version| {
        let msg = BroadcastMessage::GameUpdate {
            key: key.clone(),
            state: state.clone(),
            partial: kind.is_partial(),
            version,
        };
        hub.publish_key(key, &msg);

        // Remote-origin changes came from the relay in the first place.
        if origin != UpdateOrigin::Local {
            return;
        }
        let Some(relay) = &relay else {
            return;
        };

        let update = RelayUpdate {
            key: key.clone(),
            state: state.clone(),
            version,
        };
        let envelope = match kind {
            UpdateKind::Full => RelayEnvelope::full(relay.origin(), &update),
            UpdateKind::Partial => RelayEnvelope::partial(relay.origin(), &update),
        };
        match envelope {
            Ok(envelope) => match relay.publish(envelope) {
                Ok(()) => {
                    stats.relay_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!("relay publish skipped: {}", e),
            },
            Err(e) => error!("relay envelope encode failed: {}", e),
        }
    });
}

/// Consume parsed updates and lifecycle events from the feed runners.
async fn run_ingest(state: SharedState, mut feed_rx: mpsc::Receiver<FeedMessage>) {
    info!("ingest pipeline started");

    while let Some(msg) = feed_rx.recv().await {
        match msg {
            FeedMessage::Update(update) => {
                state.stats.updates_ingested.fetch_add(1, Ordering::Relaxed);
                let applied = match update.kind {
                    UpdateKind::Full => {
                        state
                            .cache
                            .apply_full(&update.key, update.fields, UpdateOrigin::Local);
                        true
                    }
                    UpdateKind::Partial => state
                        .cache
                        .apply_partial(&update.key, update.fields, UpdateOrigin::Local)
                        .is_some(),
                };
                if applied {
                    state.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
                }
            }
            FeedMessage::Event(event) => handle_feed_event(event),
        }
    }

    info!("ingest pipeline stopped");
}

fn handle_feed_event(event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected(source) => info!("{}: connected", source),
        ConnectionEvent::Reconnected(source) => info!("{}: reconnected", source),
        ConnectionEvent::Disconnected(source) => warn!("{}: disconnected", source),
        ConnectionEvent::CircuitBreakerOpen(source, pause) => {
            error!(
                "{}: persistent connection failure, paused for {:?} - needs attention",
                source, pause
            );
        }
        ConnectionEvent::Error(source, message) => error!("{}: {}", source, message),
    }
}

/// Periodic heartbeat to every downstream connection, independent of data
/// updates, so intermediary proxies keep the connections open.
async fn run_heartbeat(state: SharedState) {
    let mut timer = tokio::time::interval(Duration::from_secs(
        state.config.server.heartbeat_secs.max(1),
    ));
    loop {
        timer.tick().await;
        if !state.is_running() {
            return;
        }
        state
            .hub
            .publish_heartbeat(&BroadcastMessage::Heartbeat { ts: epoch_ms() });
    }
}

/// Periodic batched snapshot to all-entities subscribers, amortizing
/// serialization across one `games_update` message.
async fn run_batch_refresh(state: SharedState) {
    let secs = state.config.server.batch_refresh_secs;
    if secs == 0 {
        return;
    }
    let mut timer = tokio::time::interval(Duration::from_secs(secs));
    loop {
        timer.tick().await;
        if !state.is_running() {
            return;
        }
        let games = state.cache.snapshot_active(state.ended_grace());
        if !games.is_empty() {
            state
                .hub
                .publish_batch(&BroadcastMessage::GamesUpdate { games });
        }
    }
}

async fn run_stats_reporter(state: SharedState) {
    info!("stats reporter started");

    loop {
        // Check every 100ms whether to stop, but only report every 10s.
        for _ in 0..100 {
            if !state.is_running() {
                info!("stats reporter stopped");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let summary = state.stats.summary();
        info!(
            "stats | uptime: {}s | entities: {} | conns: {} | ingested: {} | applied: {} | delivered: {} | relay pub/recv: {}/{}",
            summary.uptime_secs,
            state.cache.len(),
            state.hub.connection_count(),
            summary.updates_ingested,
            summary.updates_applied,
            state.hub.delivered_count(),
            summary.relay_published,
            summary.relay_received
        );
    }
}

async fn shutdown_signal(state: SharedState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    state.shutdown();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = AppConfig::load(&args.config);
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!("starting matchcast worker");

    let cache = Arc::new(StateCache::new());
    let hub = Arc::new(FanoutHub::new());
    let coalescer = Arc::new(ReadCoalescer::new());
    let stats = Arc::new(ServerStats::new());

    // Cluster relay first, so the cache listener can publish through it.
    let relay = if config.relay.enabled {
        let relay_config = RelayConfig {
            url: config.relay.url.clone(),
            topic: config.relay.topic.clone(),
            required: config.relay.required,
            ..Default::default()
        };
        let handler = relay_handler(cache.clone(), coalescer.clone(), stats.clone());
        match ClusterRelay::start(relay_config, handler).await {
            Ok(relay) => Some(relay),
            Err(e) if config.relay.required => {
                error!("required cluster relay unreachable: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn!("cluster relay unavailable, serving per-worker only: {}", e);
                None
            }
        }
    } else {
        info!("cluster relay disabled");
        None
    };

    wire_broadcast(&cache, hub.clone(), relay.clone(), stats.clone());

    let (router, feed_states, feed_rx) = spawn_feeds(&config);
    let router = Arc::new(router);
    subscribe_always_on(&config, &router).await;

    let state: SharedState = Arc::new(AppState::new(
        config,
        cache.clone(),
        hub,
        router,
        relay,
        coalescer,
        stats,
        feed_states,
    ));

    tokio::spawn(run_ingest(state.clone(), feed_rx));
    tokio::spawn(run_heartbeat(state.clone()));
    tokio::spawn(run_batch_refresh(state.clone()));
    tokio::spawn(run_stats_reporter(state.clone()));
    StateCache::spawn_sweeper(
        cache,
        Duration::from_secs(state.config.cache.sweep_interval_secs.max(1)),
        state.ended_grace(),
    );

    let app = ws_server::create_router(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{} (/ws, /sse, /status)", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchcast_core::EntityState;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_upstream_update_reaches_local_subscriber() {
        let cache = Arc::new(StateCache::new());
        let hub = Arc::new(FanoutHub::new());
        let stats = Arc::new(ServerStats::new());
        wire_broadcast(&cache, hub.clone(), None, stats);

        let key = EntityKey::new("42");
        let (conn, mut rx) = hub.connect(8);
        hub.subscribe_key(conn, &key);

        // The parsed upstream frame: {game_id: 42, score: {...}, live: true}.
        cache.apply_partial(
            &key,
            EntityState::from_fields([
                ("score", json!({"home": 1, "away": 0})),
                ("live", json!(true)),
            ]),
            UpdateOrigin::Local,
        );

        let BroadcastMessage::GameUpdate {
            key: msg_key,
            state,
            partial,
            version,
        } = rx.try_recv().unwrap()
        else {
            panic!("expected game_update");
        };
        assert_eq!(msg_key, key);
        assert_eq!(state.get("score"), Some(&json!({"home": 1, "away": 0})));
        assert!(partial);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_remote_envelope_reaches_local_subscriber() {
        let cache = Arc::new(StateCache::new());
        let hub = Arc::new(FanoutHub::new());
        let coalescer = Arc::new(ReadCoalescer::new());
        let stats = Arc::new(ServerStats::new());
        wire_broadcast(&cache, hub.clone(), None, stats.clone());
        let handler = relay_handler(cache.clone(), coalescer, stats.clone());

        let key = EntityKey::new("42");
        let (conn, mut rx) = hub.connect(8);
        hub.subscribe_key(conn, &key);

        // Another worker ingested the score and relayed it.
        let update = RelayUpdate {
            key: key.clone(),
            state: EntityState::from_fields([("score", json!({"home": 2, "away": 1}))]),
            version: 5,
        };
        handler(RelayEnvelope::partial("worker-b:99", &update).unwrap());

        let BroadcastMessage::GameUpdate { state, .. } = rx.try_recv().unwrap() else {
            panic!("expected game_update");
        };
        assert_eq!(state.get("score"), Some(&json!({"home": 2, "away": 1})));
        // Both replicas converge on the same final score.
        assert_eq!(
            cache.get(&key).unwrap().state.get("score"),
            Some(&json!({"home": 2, "away": 1}))
        );
        assert_eq!(stats.relay_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cache_invalidate_stays_internal() {
        let cache = Arc::new(StateCache::new());
        let hub = Arc::new(FanoutHub::new());
        let coalescer = Arc::new(ReadCoalescer::new());
        let stats = Arc::new(ServerStats::new());
        wire_broadcast(&cache, hub.clone(), None, stats.clone());
        let handler = relay_handler(cache.clone(), coalescer.clone(), stats);

        // Seed a computed read result.
        coalescer
            .get_or_compute("games:index", Duration::from_secs(60), || async {
                Ok(json!([1, 2, 3]))
            })
            .await
            .unwrap();

        let (conn, mut rx) = hub.connect(8);
        hub.subscribe_all(conn);

        let key = EntityKey::new("games:index");
        handler(RelayEnvelope::invalidate("worker-b:99", &key).unwrap());

        // The computed cache was dropped...
        coalescer
            .get_or_compute("games:index", Duration::from_secs(60), || async {
                Ok(json!([4]))
            })
            .await
            .unwrap();
        assert_eq!(coalescer.compute_count(), 2);
        // ...and no browser-facing message was produced.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_envelope_applies_every_entity() {
        let cache = Arc::new(StateCache::new());
        let hub = Arc::new(FanoutHub::new());
        let coalescer = Arc::new(ReadCoalescer::new());
        let stats = Arc::new(ServerStats::new());
        wire_broadcast(&cache, hub.clone(), None, stats.clone());
        let handler = relay_handler(cache.clone(), coalescer, stats);

        let updates = vec![
            RelayUpdate {
                key: EntityKey::new("a"),
                state: EntityState::from_fields([("price", json!(0.5))]),
                version: 1,
            },
            RelayUpdate {
                key: EntityKey::new("b"),
                state: EntityState::from_fields([("price", json!(0.7))]),
                version: 1,
            },
        ];
        handler(RelayEnvelope::batch("worker-b:99", &updates).unwrap());

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get(&EntityKey::new("b")).unwrap().state.get("price"),
            Some(&json!(0.7))
        );
    }
}
