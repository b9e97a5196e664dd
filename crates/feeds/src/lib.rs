//! Real-time upstream feed ingestion.
//!
//! This crate owns the long-lived WebSocket connections to the upstream
//! sources (scores, ticker, order book shards) and the routing of
//! application-level watch intents onto shared upstream subscriptions.
//!
//! ## Architecture
//!
//! - `websocket` - Connection lifecycle: connect, batched subscribe replay,
//!   backoff, heartbeats
//! - `decode` - Frame decoding into typed domain updates
//! - `runner` - Per-source runners that turn raw frames into `FeedMessage`
//! - `router` - Refcounted subscription routing with shard pinning
//! - `message` - Channel message types (`FeedMessage`, `ParsedUpdate`,
//!   `ConnectionEvent`)

pub mod decode;
pub mod error;
pub mod manager;
pub mod message;
pub mod router;
pub mod runner;
pub mod websocket;

pub use decode::{decode_frame, Frame, UpstreamCommand, MAX_TOPICS_PER_COMMAND};
pub use error::FeedError;
pub use manager::{backoff_delay_ms, ConnectionState, FeedConfig, BACKOFF_SCHEDULE_SECS};
pub use message::{ConnectionEvent, FeedMessage, ParsedUpdate};
pub use router::{ShardHandle, SubscriptionRouter, WatcherId};
pub use runner::{run_source, FeedSender};
pub use websocket::{SubscriptionChange, WsClient, WsMessage, SUBSCRIPTION_CHANNEL_BUFFER};
