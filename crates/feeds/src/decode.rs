//! Upstream wire protocol: subscribe commands and frame decoding.
//!
//! Every inbound frame decodes into a typed [`Frame`] or the `Unrecognized`
//! variant carrying the raw payload. Untyped data never travels past this
//! boundary.

use matchcast_core::{EntityState, Source};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::ParsedUpdate;

/// Maximum channel identifiers per subscribe/unsubscribe command. Larger
/// requests are split so no single wire frame grows oversized.
pub const MAX_TOPICS_PER_COMMAND: usize = 50;

/// Application-level pong, answering `{"type":"ping"}` probes.
pub const APP_PONG: &str = r#"{"type":"pong"}"#;

/// Builder for upstream subscribe/unsubscribe commands.
///
/// Commands are JSON objects with an op name, a client-assigned request id,
/// and a topic list:
/// `{"op":"subscribe","id":7,"topics":["nba-lakers-42"]}`.
pub struct UpstreamCommand;

impl UpstreamCommand {
    pub fn subscribe(id: u64, topics: &[String]) -> String {
        Self::command("subscribe", id, topics)
    }

    pub fn unsubscribe(id: u64, topics: &[String]) -> String {
        Self::command("unsubscribe", id, topics)
    }

    fn command(op: &str, id: u64, topics: &[String]) -> String {
        serde_json::json!({ "op": op, "id": id, "topics": topics }).to_string()
    }

    /// Split `topics` into commands of at most [`MAX_TOPICS_PER_COMMAND`],
    /// drawing a fresh request id per command.
    pub fn subscribe_batched(next_id: &AtomicU64, topics: &[String]) -> Vec<String> {
        topics
            .chunks(MAX_TOPICS_PER_COMMAND)
            .map(|chunk| Self::subscribe(next_id.fetch_add(1, Ordering::Relaxed), chunk))
            .collect()
    }

    /// Split `topics` into unsubscribe commands of bounded size.
    pub fn unsubscribe_batched(next_id: &AtomicU64, topics: &[String]) -> Vec<String> {
        topics
            .chunks(MAX_TOPICS_PER_COMMAND)
            .map(|chunk| Self::unsubscribe(next_id.fetch_add(1, Ordering::Relaxed), chunk))
            .collect()
    }
}

/// A decoded upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Typed domain update, ready for the cache.
    Update(ParsedUpdate),
    /// Application-level liveness probe; answer with [`APP_PONG`].
    Ping,
    /// Application-level pong from the upstream; carries no data.
    Pong,
    /// Subscribe/unsubscribe acknowledgement.
    Ack { id: u64, topics: Vec<String> },
    /// Protocol-level rejection. `fatal` means the connection is unusable
    /// (for example an auth failure) and must not be retried blindly.
    Reject { message: String, fatal: bool },
    /// Frame that matched no known schema; kept raw for logging.
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawFrame {
    // Scores feed: complete game state.
    GameSnapshot {
        game_id: Value,
        #[serde(flatten)]
        fields: BTreeMap<String, Value>,
    },
    // Scores feed: changed fields only.
    GameUpdate {
        game_id: Value,
        #[serde(flatten)]
        fields: BTreeMap<String, Value>,
    },
    // Ticker feed.
    Tick {
        symbol: String,
        #[serde(flatten)]
        fields: BTreeMap<String, Value>,
    },
    // Order book feed (sharded).
    Book {
        symbol: String,
        #[serde(flatten)]
        fields: BTreeMap<String, Value>,
    },
    Ping,
    Pong,
    Subscribed {
        id: u64,
        #[serde(default)]
        topics: Vec<String>,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

/// Entity keys arrive as strings or bare numbers depending on the feed.
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode one text frame from `source`. Malformed input is returned as
/// `Unrecognized`, never an error: the caller logs and drops it.
pub fn decode_frame(source: Source, text: &str) -> Frame {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(_) => return Frame::Unrecognized(text.to_string()),
    };

    match raw {
        RawFrame::GameSnapshot { game_id, fields } => match key_string(&game_id) {
            Some(key) => Frame::Update(ParsedUpdate::full(
                source,
                key,
                EntityState::from_fields(fields),
            )),
            None => Frame::Unrecognized(text.to_string()),
        },
        RawFrame::GameUpdate { game_id, fields } => match key_string(&game_id) {
            Some(key) => Frame::Update(ParsedUpdate::partial(
                source,
                key,
                EntityState::from_fields(fields),
            )),
            None => Frame::Unrecognized(text.to_string()),
        },
        RawFrame::Tick { symbol, fields } | RawFrame::Book { symbol, fields } => Frame::Update(
            ParsedUpdate::partial(source, symbol, EntityState::from_fields(fields)),
        ),
        RawFrame::Ping => Frame::Ping,
        RawFrame::Pong => Frame::Pong,
        RawFrame::Subscribed { id, topics } => Frame::Ack { id, topics },
        RawFrame::Error { message, fatal } => Frame::Reject { message, fatal },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchcast_core::UpdateKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_subscribe_command_shape() {
        let cmd = UpstreamCommand::subscribe(7, &["nba-lakers-42".to_string()]);
        let parsed: Value = serde_json::from_str(&cmd).unwrap();
        assert_eq!(parsed["op"], "subscribe");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["topics"], json!(["nba-lakers-42"]));
    }

    #[test]
    fn test_batched_commands_respect_topic_cap() {
        let topics: Vec<String> = (0..120).map(|i| format!("game-{i}")).collect();
        let next_id = AtomicU64::new(1);
        let cmds = UpstreamCommand::subscribe_batched(&next_id, &topics);

        assert_eq!(cmds.len(), 3);
        for cmd in &cmds {
            let parsed: Value = serde_json::from_str(cmd).unwrap();
            assert!(parsed["topics"].as_array().unwrap().len() <= MAX_TOPICS_PER_COMMAND);
        }
        // Each command drew its own request id.
        let ids: Vec<u64> = cmds
            .iter()
            .map(|c| serde_json::from_str::<Value>(c).unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_game_update() {
        let text = r#"{"type":"game_update","game_id":42,"score":{"home":1,"away":0},"live":true}"#;
        let frame = decode_frame(Source::Scores, text);

        let Frame::Update(update) = frame else {
            panic!("expected update, got {frame:?}");
        };
        assert_eq!(update.key.as_str(), "42");
        assert_eq!(update.kind, UpdateKind::Partial);
        assert_eq!(update.fields.get("score"), Some(&json!({"home":1,"away":0})));
        assert_eq!(update.fields.flag("live"), Some(true));
    }

    #[test]
    fn test_decode_game_snapshot_is_full() {
        let text = r#"{"type":"game_snapshot","game_id":"NBA-LAKERS-42","period":"Q4","live":false}"#;
        let Frame::Update(update) = decode_frame(Source::Scores, text) else {
            panic!("expected update");
        };
        assert_eq!(update.key.as_str(), "nba-lakers-42");
        assert_eq!(update.kind, UpdateKind::Full);
        assert!(update.fields.is_ended());
    }

    #[test]
    fn test_decode_tick() {
        let text = r#"{"type":"tick","symbol":"BTCUSD","price":0.42,"ts":1700000000000}"#;
        let Frame::Update(update) = decode_frame(Source::Ticker, text) else {
            panic!("expected update");
        };
        assert_eq!(update.source, Source::Ticker);
        assert_eq!(update.key.as_str(), "btcusd");
        assert_eq!(update.fields.get("price"), Some(&json!(0.42)));
    }

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(decode_frame(Source::Scores, r#"{"type":"ping"}"#), Frame::Ping);
        assert_eq!(
            decode_frame(Source::Scores, r#"{"type":"subscribed","id":3,"topics":["a"]}"#),
            Frame::Ack {
                id: 3,
                topics: vec!["a".to_string()]
            }
        );
        assert_eq!(
            decode_frame(Source::Scores, r#"{"type":"error","message":"bad token","fatal":true}"#),
            Frame::Reject {
                message: "bad token".to_string(),
                fatal: true
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_unrecognized() {
        for text in ["not json", "{}", r#"{"type":"mystery"}"#, r#"{"type":"game_update"}"#] {
            match decode_frame(Source::Scores, text) {
                Frame::Unrecognized(raw) => assert_eq!(raw, text),
                other => panic!("expected unrecognized for {text:?}, got {other:?}"),
            }
        }
        // A game_update whose id is a JSON object is dropped, not a crash.
        let text = r#"{"type":"game_update","game_id":{"oops":1}}"#;
        assert!(matches!(
            decode_frame(Source::Scores, text),
            Frame::Unrecognized(_)
        ));
    }
}
