//! Feed runners: turn raw WebSocket frames into `FeedMessage`.
//!
//! A runner:
//! - Receives `WsMessage` from a connection
//! - Decodes frames with [`crate::decode::decode_frame`]
//! - Emits `FeedMessage` (a `ParsedUpdate` or a `ConnectionEvent`)
//! - Has no application-level dependencies
//!
//! The application handler receives `FeedMessage` and owns cache updates,
//! relay publishing, and broadcasting.

use crate::decode::{decode_frame, Frame};
use crate::message::{ConnectionEvent, FeedMessage};
use crate::websocket::WsMessage;
use matchcast_core::Source;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Sender type for feed messages.
pub type FeedSender = mpsc::Sender<FeedMessage>;

/// Handle connection lifecycle events.
///
/// Returns `true` if the message was a lifecycle event (caller continues to
/// the next message), `false` if it carries data to decode.
pub fn handle_connection_event(msg: &WsMessage, source: Source, tx: &FeedSender) -> bool {
    match msg {
        WsMessage::Connected => {
            let _ = tx.try_send(ConnectionEvent::Connected(source).into());
            true
        }
        WsMessage::Reconnected => {
            let _ = tx.try_send(ConnectionEvent::Reconnected(source).into());
            true
        }
        WsMessage::Disconnected => {
            let _ = tx.try_send(ConnectionEvent::Disconnected(source).into());
            true
        }
        WsMessage::CircuitBreakerOpen(duration) => {
            let _ = tx.try_send(ConnectionEvent::CircuitBreakerOpen(source, *duration).into());
            true
        }
        WsMessage::Error(e) => {
            let _ = tx.try_send(ConnectionEvent::Error(source, e.clone()).into());
            true
        }
        WsMessage::Text(_) | WsMessage::Binary(_) => false,
    }
}

/// Drain buffered messages from the receiver.
///
/// Called on disconnect to clear frames that are stale now that the
/// connection is gone.
pub fn drain_channel(rx: &mut mpsc::Receiver<WsMessage>) {
    while rx.try_recv().is_ok() {}
}

/// Run the feed processor for one source connection.
pub async fn run_source(source: Source, mut rx: mpsc::Receiver<WsMessage>, tx: FeedSender) {
    debug!("starting {} feed runner", source);

    let mut update_count = 0u64;
    let mut drop_count = 0u64;

    while let Some(msg) = rx.recv().await {
        if handle_connection_event(&msg, source, &tx) {
            if matches!(msg, WsMessage::Disconnected) {
                drain_channel(&mut rx);
            }
            continue;
        }

        let WsMessage::Text(text) = msg else {
            // No upstream source of ours speaks binary.
            continue;
        };

        match decode_frame(source, &text) {
            Frame::Update(update) => {
                if tx.try_send(update.into()).is_ok() {
                    update_count += 1;
                    if update_count % 10_000 == 0 {
                        debug!("{}: processed {} updates ({} dropped)", source, update_count, drop_count);
                    }
                }
            }
            Frame::Ack { id, topics } => {
                debug!("{}: subscription ack id={} ({} topics)", source, id, topics.len());
            }
            Frame::Reject { message, fatal } => {
                if fatal {
                    error!("{}: upstream rejected connection: {}", source, message);
                    let _ = tx.try_send(ConnectionEvent::Error(source, message).into());
                } else {
                    warn!("{}: upstream rejected request: {}", source, message);
                }
            }
            // The client answers pings before forwarding, so one arriving
            // here means it raced the forward; nothing to do.
            Frame::Ping | Frame::Pong => {}
            Frame::Unrecognized(raw) => {
                drop_count += 1;
                if drop_count % 100 == 1 {
                    debug!(
                        "{}: dropped unrecognized frame ({} so far): {}",
                        source,
                        drop_count,
                        &raw[..raw.len().min(200)]
                    );
                }
            }
        }
    }

    debug!(
        "{} feed runner stopped ({} updates, {} dropped)",
        source, update_count, drop_count
    );
}
