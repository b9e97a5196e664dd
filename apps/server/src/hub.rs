//! Local fan-out hub: delivers broadcast messages to the downstream
//! connections held by this worker.
//!
//! Delivery is best-effort and at-most-once per publish. Pushes are
//! non-blocking `try_send`s: a connection whose buffer is full or whose
//! receiver is gone is removed from every subscriber set on the spot, so
//! one slow or dead consumer never blocks delivery to the others.

use dashmap::DashMap;
use matchcast_core::{BroadcastMessage, EntityKey};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifies one downstream connection.
pub type ConnId = u64;

struct Subscriber {
    tx: mpsc::Sender<BroadcastMessage>,
    keys: HashSet<EntityKey>,
    all: bool,
}

/// Subscriber registry and push fan-out.
#[derive(Default)]
pub struct FanoutHub {
    next_conn_id: AtomicU64,
    conns: DashMap<ConnId, Subscriber>,
    by_key: DashMap<EntityKey, HashSet<ConnId>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            // Connection ids double as router watcher ids; 0 is reserved
            // for the process's own always-on watches.
            next_conn_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Register a connection and hand back its id and message receiver.
    /// The transport task owns the receiver and writes to the socket.
    pub fn connect(&self, buffer: usize) -> (ConnId, mpsc::Receiver<BroadcastMessage>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);
        self.conns.insert(
            conn_id,
            Subscriber {
                tx,
                keys: HashSet::new(),
                all: false,
            },
        );
        debug!("connection {} registered", conn_id);
        (conn_id, rx)
    }

    /// Subscribe a connection to one entity key.
    pub fn subscribe_key(&self, conn_id: ConnId, key: &EntityKey) {
        let Some(mut sub) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if sub.keys.insert(key.clone()) {
            drop(sub);
            self.by_key.entry(key.clone()).or_default().insert(conn_id);
        }
    }

    /// Subscribe a connection to every entity.
    pub fn subscribe_all(&self, conn_id: ConnId) {
        if let Some(mut sub) = self.conns.get_mut(&conn_id) {
            sub.all = true;
        }
    }

    /// Drop a connection's interest in one key.
    pub fn unsubscribe_key(&self, conn_id: ConnId, key: &EntityKey) {
        let Some(mut sub) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if sub.keys.remove(key) {
            drop(sub);
            if let Some(mut conns) = self.by_key.get_mut(key) {
                conns.remove(&conn_id);
            }
        }
    }

    /// Remove a connection from every subscriber set. Safe to call twice.
    pub fn disconnect(&self, conn_id: ConnId) {
        let Some((_, sub)) = self.conns.remove(&conn_id) else {
            return;
        };
        for key in &sub.keys {
            if let Some(mut conns) = self.by_key.get_mut(key) {
                conns.remove(&conn_id);
            }
        }
        debug!("connection {} removed", conn_id);
    }

    /// Push a message to one connection (initial snapshots, subscribe
    /// acks). Returns false and removes the connection if the push failed.
    pub fn send_to(&self, conn_id: ConnId, msg: BroadcastMessage) -> bool {
        let sent = self
            .conns
            .get(&conn_id)
            .map(|sub| sub.tx.try_send(msg).is_ok())
            .unwrap_or(false);
        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.disconnect(conn_id);
        }
        sent
    }

    /// Push a message to every subscriber of `key`, plus the all-entities
    /// subscribers. Each connection receives the message at most once.
    pub fn publish_key(&self, key: &EntityKey, msg: &BroadcastMessage) {
        let mut targets: HashSet<ConnId> = self
            .by_key
            .get(key)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default();
        for entry in self.conns.iter() {
            if entry.value().all {
                targets.insert(*entry.key());
            }
        }
        self.deliver(targets, msg);
    }

    /// Push a batch message to the all-entities subscribers only; per-key
    /// subscribers get their individual updates instead.
    pub fn publish_batch(&self, msg: &BroadcastMessage) {
        let targets: HashSet<ConnId> = self
            .conns
            .iter()
            .filter(|entry| entry.value().all)
            .map(|entry| *entry.key())
            .collect();
        self.deliver(targets, msg);
    }

    /// Push to every connection regardless of interest (heartbeats).
    pub fn publish_heartbeat(&self, msg: &BroadcastMessage) {
        let targets: HashSet<ConnId> = self.conns.iter().map(|entry| *entry.key()).collect();
        self.deliver(targets, msg);
    }

    fn deliver(&self, targets: HashSet<ConnId>, msg: &BroadcastMessage) {
        let mut failed = Vec::new();
        for conn_id in targets {
            let Some(sub) = self.conns.get(&conn_id) else {
                continue;
            };
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // Full buffer or dropped receiver: the connection is
                    // not keeping up, cut it loose.
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    failed.push(conn_id);
                }
            }
        }
        for conn_id in failed {
            trace!("connection {} failed a push, removing", conn_id);
            self.disconnect(conn_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
