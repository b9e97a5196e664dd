//! Subscription routing: many local watchers, one upstream subscription.
//!
//! The router keeps a reference count per entity key and issues an upstream
//! subscribe only on the 0→1 transition and an unsubscribe only on the 1→0
//! transition, so upstream subscription count is bounded by distinct
//! entities of interest, never by downstream consumer count.

use crate::websocket::SubscriptionChange;
use crate::FeedError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use matchcast_core::{EntityKey, Source};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies one local consumer (a downstream connection).
pub type WatcherId = u64;

/// One upstream connection a source's keys can be pinned to.
pub struct ShardHandle {
    sub_tx: mpsc::Sender<SubscriptionChange>,
    /// Keys currently routed to this shard.
    subscribed: Arc<AtomicUsize>,
    max_subscriptions: usize,
}

impl ShardHandle {
    pub fn new(sub_tx: mpsc::Sender<SubscriptionChange>, max_subscriptions: usize) -> Self {
        Self {
            sub_tx,
            subscribed: Arc::new(AtomicUsize::new(0)),
            max_subscriptions,
        }
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.load(Ordering::Relaxed)
    }
}

struct KeyEntry {
    watchers: HashSet<WatcherId>,
    shard: usize,
}

/// Routes watch/unwatch intents onto shared upstream subscriptions.
///
/// Register every source's shards up front, then share the router behind an
/// `Arc`. A key is pinned to one shard by a deterministic hash for the
/// lifetime of the process, so sharded sources never hold duplicate
/// upstream subscriptions for the same entity.
pub struct SubscriptionRouter {
    shards: HashMap<Source, Vec<ShardHandle>>,
    interest: DashMap<(Source, EntityKey), KeyEntry>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self {
            shards: HashMap::new(),
            interest: DashMap::new(),
        }
    }

    /// Register a source's shard connections. Call once per source at
    /// startup, before the router is shared.
    pub fn register_source(&mut self, source: Source, shards: Vec<ShardHandle>) {
        debug_assert!(!shards.is_empty());
        self.shards.insert(source, shards);
    }

    pub fn is_registered(&self, source: Source) -> bool {
        self.shards.contains_key(&source)
    }

    /// Distinct keys currently subscribed upstream for a source.
    pub fn subscribed_count(&self, source: Source) -> usize {
        self.shards
            .get(&source)
            .map(|shards| shards.iter().map(|s| s.subscribed_count()).sum())
            .unwrap_or(0)
    }

    /// Watchers currently registered for one key.
    pub fn watcher_count(&self, source: Source, key: &EntityKey) -> usize {
        self.interest
            .get(&(source, key.clone()))
            .map(|e| e.watchers.len())
            .unwrap_or(0)
    }

    /// Record `watcher`'s interest in `key`. Issues the upstream subscribe
    /// only if this is the first watcher for the key.
    pub async fn watch(
        &self,
        source: Source,
        key: &EntityKey,
        watcher: WatcherId,
    ) -> Result<(), FeedError> {
        let shards = self
            .shards
            .get(&source)
            .ok_or_else(|| FeedError::SubscriptionFailed(format!("source {source} not registered")))?;

        // Mutate the refcount table without holding its lock across the
        // channel send below.
        let subscribe_shard = match self.interest.entry((source, key.clone())) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().watchers.insert(watcher);
                None
            }
            Entry::Vacant(vacant) => {
                let idx = shard_index(key, shards.len());
                let shard = &shards[idx];
                let prev = shard.subscribed.fetch_add(1, Ordering::SeqCst);
                if prev >= shard.max_subscriptions {
                    shard.subscribed.fetch_sub(1, Ordering::SeqCst);
                    return Err(FeedError::CapacityExceeded {
                        limit: shard.max_subscriptions,
                    });
                }
                let mut watchers = HashSet::new();
                watchers.insert(watcher);
                vacant.insert(KeyEntry { watchers, shard: idx });
                Some(idx)
            }
        };

        if let Some(idx) = subscribe_shard {
            let shard = &shards[idx];
            if let Err(e) = shard
                .sub_tx
                .send(SubscriptionChange::Subscribe(vec![key.to_string()]))
                .await
            {
                // Roll back so a later watch can retry cleanly.
                self.interest.remove(&(source, key.clone()));
                shard.subscribed.fetch_sub(1, Ordering::SeqCst);
                warn!("{}: subscribe channel closed: {}", source, e);
                return Err(FeedError::ChannelClosed);
            }
            debug!("{}: upstream subscribe {} (shard {})", source, key, idx);
        }

        Ok(())
    }

    /// Remove `watcher`'s interest in `key`. Issues the upstream
    /// unsubscribe only when the last watcher leaves, so upstream
    /// subscriptions never outlive local interest.
    pub async fn unwatch(
        &self,
        source: Source,
        key: &EntityKey,
        watcher: WatcherId,
    ) -> Result<(), FeedError> {
        let Some(shards) = self.shards.get(&source) else {
            return Ok(());
        };

        let unsubscribe_shard = match self.interest.entry((source, key.clone())) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().watchers.remove(&watcher);
                if occupied.get().watchers.is_empty() {
                    let idx = occupied.get().shard;
                    occupied.remove();
                    shards[idx].subscribed.fetch_sub(1, Ordering::SeqCst);
                    Some(idx)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        };

        if let Some(idx) = unsubscribe_shard {
            let shard = &shards[idx];
            if let Err(e) = shard
                .sub_tx
                .send(SubscriptionChange::Unsubscribe(vec![key.to_string()]))
                .await
            {
                warn!("{}: unsubscribe channel closed: {}", source, e);
                return Err(FeedError::ChannelClosed);
            }
            debug!("{}: upstream unsubscribe {} (shard {})", source, key, idx);
        }

        Ok(())
    }

    /// Drop every interest a watcher holds. Called when a downstream
    /// connection closes.
    pub async fn drop_watcher(&self, watcher: WatcherId) {
        let held: Vec<(Source, EntityKey)> = self
            .interest
            .iter()
            .filter(|entry| entry.value().watchers.contains(&watcher))
            .map(|entry| entry.key().clone())
            .collect();

        for (source, key) in held {
            let _ = self.unwatch(source, &key, watcher).await;
        }
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic shard pin for a key, stable for the process lifetime.
fn shard_index(key: &EntityKey, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::SUBSCRIPTION_CHANNEL_BUFFER;
    use pretty_assertions::assert_eq;

    fn router_with(
        source: Source,
        shard_count: usize,
        max_subscriptions: usize,
    ) -> (SubscriptionRouter, Vec<mpsc::Receiver<SubscriptionChange>>) {
        let mut router = SubscriptionRouter::new();
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_BUFFER);
            handles.push(ShardHandle::new(tx, max_subscriptions));
            receivers.push(rx);
        }
        router.register_source(source, handles);
        (router, receivers)
    }

    fn drain(rx: &mut mpsc::Receiver<SubscriptionChange>) -> Vec<SubscriptionChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[tokio::test]
    async fn test_refcount_single_upstream_subscription() {
        let (router, mut rxs) = router_with(Source::Scores, 1, 100);
        let key = EntityKey::new("nba-lakers-42");

        for watcher in 1..=1000u64 {
            router.watch(Source::Scores, &key, watcher).await.unwrap();
        }

        // 1000 watchers, exactly one wire subscribe.
        let changes = drain(&mut rxs[0]);
        assert_eq!(
            changes,
            vec![SubscriptionChange::Subscribe(vec![key.to_string()])]
        );
        assert_eq!(router.watcher_count(Source::Scores, &key), 1000);
        assert_eq!(router.subscribed_count(Source::Scores), 1);
    }

    #[tokio::test]
    async fn test_last_unwatch_unsubscribes() {
        let (router, mut rxs) = router_with(Source::Scores, 1, 100);
        let key = EntityKey::new("game-7");

        for watcher in [1u64, 2, 3] {
            router.watch(Source::Scores, &key, watcher).await.unwrap();
        }
        router.unwatch(Source::Scores, &key, 1).await.unwrap();
        router.unwatch(Source::Scores, &key, 2).await.unwrap();

        // One watcher remains: still subscribed, nothing new on the wire.
        assert_eq!(router.watcher_count(Source::Scores, &key), 1);
        assert_eq!(
            drain(&mut rxs[0]),
            vec![SubscriptionChange::Subscribe(vec![key.to_string()])]
        );

        router.unwatch(Source::Scores, &key, 3).await.unwrap();
        assert_eq!(
            drain(&mut rxs[0]),
            vec![SubscriptionChange::Unsubscribe(vec![key.to_string()])]
        );
        assert_eq!(router.subscribed_count(Source::Scores), 0);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_fails_new_keys_only() {
        let (router, mut rxs) = router_with(Source::Ticker, 1, 2);

        router
            .watch(Source::Ticker, &EntityKey::new("a"), 1)
            .await
            .unwrap();
        router
            .watch(Source::Ticker, &EntityKey::new("b"), 1)
            .await
            .unwrap();

        let err = router
            .watch(Source::Ticker, &EntityKey::new("c"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::CapacityExceeded { limit: 2 }));

        // Existing subscriptions were not shed.
        assert_eq!(router.subscribed_count(Source::Ticker), 2);
        assert_eq!(drain(&mut rxs[0]).len(), 2);

        // Another watcher on an existing key is still fine at the ceiling.
        router
            .watch(Source::Ticker, &EntityKey::new("a"), 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shard_pinning_is_deterministic() {
        let (router, mut rxs) = router_with(Source::Book, 4, 1000);

        let keys: Vec<EntityKey> = (0..40).map(|i| EntityKey::new(format!("m{i}"))).collect();
        for key in &keys {
            router.watch(Source::Book, key, 1).await.unwrap();
        }
        // A second watcher for every key must not reach any shard again.
        for key in &keys {
            router.watch(Source::Book, key, 2).await.unwrap();
        }

        let mut seen = HashMap::new();
        for (idx, rx) in rxs.iter_mut().enumerate() {
            for change in drain(rx) {
                let SubscriptionChange::Subscribe(topics) = change else {
                    panic!("unexpected unsubscribe");
                };
                for topic in topics {
                    assert!(
                        seen.insert(topic, idx).is_none(),
                        "key subscribed on two shards"
                    );
                }
            }
        }
        assert_eq!(seen.len(), keys.len());

        // Pinning matches the hash, so re-watching after a full unwatch
        // lands on the same shard.
        for key in &keys {
            assert_eq!(*seen.get(&key.to_string()).unwrap(), shard_index(key, 4));
        }
    }

    #[tokio::test]
    async fn test_drop_watcher_releases_all_interest() {
        let (router, mut rxs) = router_with(Source::Scores, 1, 100);
        let a = EntityKey::new("a");
        let b = EntityKey::new("b");

        router.watch(Source::Scores, &a, 7).await.unwrap();
        router.watch(Source::Scores, &b, 7).await.unwrap();
        router.watch(Source::Scores, &b, 8).await.unwrap();
        drain(&mut rxs[0]);

        router.drop_watcher(7).await;

        // `a` lost its only watcher; `b` still has watcher 8.
        assert_eq!(router.subscribed_count(Source::Scores), 1);
        assert_eq!(
            drain(&mut rxs[0]),
            vec![SubscriptionChange::Unsubscribe(vec!["a".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_watch_unregistered_source_fails() {
        let router = SubscriptionRouter::new();
        let err = router
            .watch(Source::Scores, &EntityKey::new("x"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::SubscriptionFailed(_)));
    }
}
