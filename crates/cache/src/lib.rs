//! Process-local state cache with merge semantics and change listeners.
//!
//! Holds the latest known [`EntityState`] per key. Updates are either full
//! replacements or partial field merges; every accepted (non-no-op) update
//! notifies the registered change listeners synchronously, which is how the
//! broadcast layer and the cluster relay are wired in.

use dashmap::DashMap;
use matchcast_core::{epoch_ms, EntityKey, EntitySnapshot, EntityState, UpdateKind, UpdateOrigin};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Listener invoked synchronously after every accepted update.
pub type ChangeListener =
    Box<dyn Fn(&EntityKey, &EntityState, UpdateKind, UpdateOrigin, u64) + Send + Sync>;

#[derive(Debug, Clone)]
struct CachedEntity {
    state: EntityState,
    version: u64,
    updated_at_ms: u64,
    /// Set when the entity first reports itself concluded; cleared if a
    /// later update brings it back live.
    ended_at_ms: Option<u64>,
}

/// Thread-safe cache of the latest known state per entity.
#[derive(Default)]
pub struct StateCache {
    entries: DashMap<EntityKey, CachedEntity>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change listener. Listeners run synchronously, in
    /// registration order, after the entry is committed; they receive the
    /// key, the resulting state, the update kind, the origin, and the new
    /// version.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&EntityKey, &EntityState, UpdateKind, UpdateOrigin, u64) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Box::new(listener));
    }

    fn notify(
        &self,
        key: &EntityKey,
        state: &EntityState,
        kind: UpdateKind,
        origin: UpdateOrigin,
        version: u64,
    ) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(key, state, kind, origin, version);
        }
    }

    /// Replace the stored state wholesale. Always accepted; bumps the
    /// version and notifies even when the payload is identical (replays are
    /// delivered downstream, idempotently).
    pub fn apply_full(&self, key: &EntityKey, state: EntityState, origin: UpdateOrigin) -> u64 {
        let now = epoch_ms();
        let ended = state.is_ended();

        let (committed, version) = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CachedEntity {
                state: EntityState::new(),
                version: 0,
                updated_at_ms: now,
                ended_at_ms: None,
            });
            entry.state = state;
            entry.version += 1;
            entry.updated_at_ms = now;
            entry.ended_at_ms = if ended {
                entry.ended_at_ms.or(Some(now))
            } else {
                None
            };
            (entry.state.clone(), entry.version)
        };

        trace!("apply_full {} v{}", key, version);
        self.notify(key, &committed, UpdateKind::Full, origin, version);
        version
    }

    /// Merge named fields into the existing state, creating the entry if
    /// absent. Returns the new version, or `None` when the merge was a
    /// no-op (every field already present with an exactly equal value); a
    /// no-op bumps nothing and notifies nobody.
    pub fn apply_partial(
        &self,
        key: &EntityKey,
        fields: EntityState,
        origin: UpdateOrigin,
    ) -> Option<u64> {
        let now = epoch_ms();

        let committed = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CachedEntity {
                state: EntityState::new(),
                version: 0,
                updated_at_ms: now,
                ended_at_ms: None,
            });

            if entry.version > 0 && entry.state.contains_all(&fields) {
                return None;
            }

            entry.state.merge(&fields);
            entry.version += 1;
            entry.updated_at_ms = now;
            entry.ended_at_ms = if entry.state.is_ended() {
                entry.ended_at_ms.or(Some(now))
            } else {
                None
            };
            (entry.state.clone(), entry.version)
        };

        trace!("apply_partial {} v{}", key, committed.1);
        self.notify(key, &committed.0, UpdateKind::Partial, origin, committed.1);
        Some(committed.1)
    }

    /// Latest snapshot for one key.
    pub fn get(&self, key: &EntityKey) -> Option<EntitySnapshot> {
        self.entries.get(key).map(|entry| EntitySnapshot {
            key: key.clone(),
            state: entry.state.clone(),
            version: entry.version,
            updated_at_ms: entry.updated_at_ms,
        })
    }

    /// Snapshot of every entity that is live, or concluded for less than
    /// `ended_grace`. Ended entities are kept around briefly so late
    /// readers still see the final state.
    pub fn snapshot_active(&self, ended_grace: Duration) -> Vec<EntitySnapshot> {
        let now = epoch_ms();
        let grace_ms = ended_grace.as_millis() as u64;

        let mut out: Vec<EntitySnapshot> = self
            .entries
            .iter()
            .filter(|entry| match entry.value().ended_at_ms {
                None => true,
                Some(ended_at) => now.saturating_sub(ended_at) < grace_ms,
            })
            .map(|entry| EntitySnapshot {
                key: entry.key().clone(),
                state: entry.value().state.clone(),
                version: entry.value().version,
                updated_at_ms: entry.value().updated_at_ms,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Physically remove entities concluded longer than `ended_grace` ago.
    /// Returns the number of entries removed.
    pub fn sweep_ended(&self, ended_grace: Duration) -> usize {
        let now = epoch_ms();
        let grace_ms = ended_grace.as_millis() as u64;
        let before = self.entries.len();

        self.entries.retain(|_, entity| match entity.ended_at_ms {
            None => true,
            Some(ended_at) => now.saturating_sub(ended_at) < grace_ms,
        });

        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("swept {} ended entities", removed);
        }
        removed
    }

    /// Background sweeper so memory for ended entities stays bounded
    /// without waiting for a process restart.
    pub fn spawn_sweeper(
        cache: Arc<Self>,
        interval: Duration,
        ended_grace: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // immediate first tick
            loop {
                timer.tick().await;
                cache.sweep_ended(ended_grace);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
