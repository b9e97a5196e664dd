//! Feed message types for communication between runners and the handler.
//!
//! Runners parse raw frames inside this crate; the application handler
//! receives `FeedMessage` and owns cache updates and broadcasting.

use matchcast_core::{EntityKey, EntityState, Source, UpdateKind};
use std::time::Duration;

/// Message sent from feed runners to the application handler.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// Parsed domain update.
    Update(ParsedUpdate),
    /// Connection lifecycle event.
    Event(ConnectionEvent),
}

/// Normalized output of a feed runner: one entity's new fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUpdate {
    pub source: Source,
    pub key: EntityKey,
    pub fields: EntityState,
    /// Full replacement or field merge.
    pub kind: UpdateKind,
}

impl ParsedUpdate {
    pub fn full(source: Source, key: impl Into<EntityKey>, fields: EntityState) -> Self {
        Self {
            source,
            key: key.into(),
            fields,
            kind: UpdateKind::Full,
        }
    }

    pub fn partial(source: Source, key: impl Into<EntityKey>, fields: EntityState) -> Self {
        Self {
            source,
            key: key.into(),
            fields,
            kind: UpdateKind::Partial,
        }
    }
}

/// WebSocket connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Initial connection established.
    Connected(Source),
    /// Connection lost; a reconnect will follow.
    Disconnected(Source),
    /// Reconnected after a drop; subscriptions have been replayed.
    Reconnected(Source),
    /// Attempt budget exhausted; the client sleeps for the given duration
    /// before resuming. Surfaced for operational alerting.
    CircuitBreakerOpen(Source, Duration),
    /// Non-fatal error.
    Error(Source, String),
}

impl From<ParsedUpdate> for FeedMessage {
    fn from(update: ParsedUpdate) -> Self {
        FeedMessage::Update(update)
    }
}

impl From<ConnectionEvent> for FeedMessage {
    fn from(event: ConnectionEvent) -> Self {
        FeedMessage::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parsed_update_constructors() {
        let fields = EntityState::from_fields([("price", json!(0.61))]);
        let update = ParsedUpdate::partial(Source::Ticker, "BTCUSD", fields.clone());
        assert_eq!(update.key.as_str(), "btcusd");
        assert_eq!(update.kind, UpdateKind::Partial);
        assert_eq!(update.fields, fields);

        let update = ParsedUpdate::full(Source::Scores, "42", EntityState::new());
        assert_eq!(update.kind, UpdateKind::Full);
    }

    #[test]
    fn test_feed_message_from() {
        let update = ParsedUpdate::partial(Source::Ticker, "a", EntityState::new());
        let msg: FeedMessage = update.into();
        assert!(matches!(msg, FeedMessage::Update(_)));

        let msg: FeedMessage = ConnectionEvent::Connected(Source::Scores).into();
        assert!(matches!(msg, FeedMessage::Event(_)));
    }
}
