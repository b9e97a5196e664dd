//! Message envelopes for downstream fan-out and the cluster relay.

use crate::{EntityKey, EntityState};
use serde::{Deserialize, Serialize};

/// One entity as shipped to downstream clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub key: EntityKey,
    pub state: EntityState,
    pub version: u64,
    pub updated_at_ms: u64,
}

/// Envelope delivered to downstream subscribers over both transports
/// (WebSocket and SSE). One JSON object per message/event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Snapshot of all active entities, sent once on connect.
    Initial { games: Vec<EntitySnapshot> },
    /// Liveness signal, independent of data updates.
    Heartbeat { ts: u64 },
    /// Batch of changes, amortized to all-entities subscribers.
    GamesUpdate { games: Vec<EntitySnapshot> },
    /// Single entity change.
    GameUpdate {
        key: EntityKey,
        state: EntityState,
        partial: bool,
        version: u64,
    },
    /// Acknowledgement of a subscribe command.
    Subscribed { keys: Vec<EntityKey> },
}

/// Kind tag on a cluster relay envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Full,
    Partial,
    Batch,
    /// Internal-only: drop computed read caches for a key. Never forwarded
    /// to browser-facing connections.
    CacheInvalidate,
}

impl RelayKind {
    /// True for kinds that carry entity data for re-publication to the
    /// local hub (everything except `CacheInvalidate`).
    pub fn is_data(&self) -> bool {
        !matches!(self, RelayKind::CacheInvalidate)
    }
}

/// A single entity change as carried inside a relay envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayUpdate {
    pub key: EntityKey,
    pub state: EntityState,
    pub version: u64,
}

/// Envelope published to the shared cluster channel. `payload` is a JSON
/// string (a `RelayUpdate`, a `Vec<RelayUpdate>` for batches, or a bare key
/// for invalidations) so workers on different versions can skip kinds they
/// do not understand without failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Identity of the publishing worker (hostname:pid). Used to suppress
    /// self-delivery.
    pub origin: String,
    #[serde(rename = "type")]
    pub kind: RelayKind,
    pub payload: String,
}

impl RelayEnvelope {
    pub fn full(origin: impl Into<String>, update: &RelayUpdate) -> serde_json::Result<Self> {
        Ok(Self {
            origin: origin.into(),
            kind: RelayKind::Full,
            payload: serde_json::to_string(update)?,
        })
    }

    pub fn partial(origin: impl Into<String>, update: &RelayUpdate) -> serde_json::Result<Self> {
        Ok(Self {
            origin: origin.into(),
            kind: RelayKind::Partial,
            payload: serde_json::to_string(update)?,
        })
    }

    pub fn batch(origin: impl Into<String>, updates: &[RelayUpdate]) -> serde_json::Result<Self> {
        Ok(Self {
            origin: origin.into(),
            kind: RelayKind::Batch,
            payload: serde_json::to_string(updates)?,
        })
    }

    pub fn invalidate(origin: impl Into<String>, key: &EntityKey) -> serde_json::Result<Self> {
        Ok(Self {
            origin: origin.into(),
            kind: RelayKind::CacheInvalidate,
            payload: serde_json::to_string(key)?,
        })
    }

    /// Decode the payload of a `Full`/`Partial` envelope.
    pub fn decode_update(&self) -> serde_json::Result<RelayUpdate> {
        serde_json::from_str(&self.payload)
    }

    /// Decode the payload of a `Batch` envelope.
    pub fn decode_batch(&self) -> serde_json::Result<Vec<RelayUpdate>> {
        serde_json::from_str(&self.payload)
    }

    /// Decode the payload of a `CacheInvalidate` envelope.
    pub fn decode_key(&self) -> serde_json::Result<EntityKey> {
        serde_json::from_str(&self.payload)
    }
}
