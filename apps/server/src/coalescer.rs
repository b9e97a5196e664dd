//! Read-path request coalescing.
//!
//! On-demand reads of computed results (REST snapshots, derived views) go
//! through here: a fresh cached value is returned immediately, and while a
//! computation for a key is in flight every further caller joins it as a
//! waiter instead of starting another one. For N concurrent callers of one
//! stale key the compute function runs exactly once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Failure outcome of a coalesced computation. Cloneable so every waiter
/// receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("computation failed: {0}")]
    Failed(String),
}

type SharedCompute = Shared<BoxFuture<'static, Result<Value, ComputeError>>>;

enum Slot {
    Ready { value: Value, expires_at: Instant },
    InFlight(SharedCompute),
}

/// Keyed single-flight cache for the read path.
#[derive(Default)]
pub struct ReadCoalescer {
    slots: DashMap<String, Slot>,
    computes: AtomicU64,
    hits: AtomicU64,
    joined: AtomicU64,
}

impl ReadCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key` if younger than `ttl`; otherwise
    /// join the in-flight computation or start `compute`. Successes are
    /// cached for `ttl`. Failures reach every waiter joined to the same
    /// computation and the entry is then cleared, so the next caller
    /// retries.
    ///
    /// `compute` is called (not polled) under an internal shard lock; it
    /// must only build the future, not touch this coalescer.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        let now = Instant::now();

        let (fut, installed) = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready { value, expires_at } if *expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value.clone());
                }
                Slot::InFlight(existing) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    (existing.clone(), false)
                }
                Slot::Ready { .. } => {
                    let fut: SharedCompute = compute().boxed().shared();
                    occupied.insert(Slot::InFlight(fut.clone()));
                    (fut, true)
                }
            },
            Entry::Vacant(vacant) => {
                let fut: SharedCompute = compute().boxed().shared();
                vacant.insert(Slot::InFlight(fut.clone()));
                (fut, true)
            }
        };

        if installed {
            self.computes.fetch_add(1, Ordering::Relaxed);
            trace!("computing {}", key);
        }

        let result = fut.await;

        // Only the caller that installed the computation settles the slot;
        // joiners just take the shared outcome.
        if installed {
            match &result {
                Ok(value) => {
                    self.slots.insert(
                        key.to_string(),
                        Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + ttl,
                        },
                    );
                }
                Err(_) => {
                    self.slots.remove(key);
                }
            }
        }

        result
    }

    /// Drop the cached value for `key`, if any. In-flight computations are
    /// left to settle for the benefit of their current waiters. Wired to
    /// the relay's `cache_invalidate` messages.
    pub fn invalidate(&self, key: &str) -> bool {
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Ready { .. }))
            .is_some()
    }

    pub fn compute_count(&self) -> u64 {
        self.computes.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn joined_count(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let coalescer = Arc::new(ReadCoalescer::new());
        let calls = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let coalescer = coalescer.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    coalescer
                        .get_or_compute("k", Duration::from_secs(60), move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            // Hold the computation open so every caller
                            // arrives before it settles.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(json!({"answer": 42}))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result, json!({"answer": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.compute_count(), 1);
        assert_eq!(coalescer.joined_count(), 99);
    }

    #[tokio::test]
    async fn test_fresh_value_skips_computation() {
        let coalescer = ReadCoalescer::new();
        let ttl = Duration::from_secs(60);

        let first = coalescer
            .get_or_compute("k", ttl, || async { Ok(json!(1)) })
            .await
            .unwrap();
        // A fresh value short-circuits; a recompute would return 999.
        let second = coalescer
            .get_or_compute("k", ttl, || async { Ok(json!(999)) })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second, json!(1));
        assert_eq!(coalescer.compute_count(), 1);
        assert_eq!(coalescer.hit_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_value_recomputes() {
        let coalescer = ReadCoalescer::new();

        coalescer
            .get_or_compute("k", Duration::ZERO, || async { Ok(json!("old")) })
            .await
            .unwrap();
        let result = coalescer
            .get_or_compute("k", Duration::from_secs(60), || async { Ok(json!("new")) })
            .await
            .unwrap();

        assert_eq!(result, json!("new"));
        assert_eq!(coalescer.compute_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters_then_clears() {
        let coalescer = Arc::new(ReadCoalescer::new());

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move {
                    coalescer
                        .get_or_compute("k", Duration::from_secs(60), || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(ComputeError::Failed("backend down".into()))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, ComputeError::Failed("backend down".into()));
        }
        assert_eq!(coalescer.compute_count(), 1);

        // The failure was not cached: the next caller retries and succeeds.
        let result = coalescer
            .get_or_compute("k", Duration::from_secs(60), || async { Ok(json!("ok")) })
            .await
            .unwrap();
        assert_eq!(result, json!("ok"));
        assert_eq!(coalescer.compute_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let coalescer = ReadCoalescer::new();
        let ttl = Duration::from_secs(60);

        coalescer
            .get_or_compute("k", ttl, || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert!(coalescer.invalidate("k"));
        assert!(!coalescer.invalidate("k"));

        let result = coalescer
            .get_or_compute("k", ttl, || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }

    #[tokio::test]
    async fn test_distinct_keys_compute_independently() {
        let coalescer = ReadCoalescer::new();
        let ttl = Duration::from_secs(60);

        let a = coalescer
            .get_or_compute("a", ttl, || async { Ok(json!("a")) })
            .await
            .unwrap();
        let b = coalescer
            .get_or_compute("b", ttl, || async { Ok(json!("b")) })
            .await
            .unwrap();

        assert_eq!(a, json!("a"));
        assert_eq!(b, json!("b"));
        assert_eq!(coalescer.compute_count(), 2);
    }
}
