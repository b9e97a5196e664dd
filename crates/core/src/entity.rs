//! Entity keys and denormalized entity state.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Opaque identifier for a trackable thing (a game slug, a token id, a
/// market ticker). Keys are case-normalized at construction so lookups from
/// different feeds agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(CompactString);

impl EntityKey {
    /// Build a key from raw upstream input, trimming and lowercasing.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(CompactString::from(raw.as_ref().trim().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Whether an update replaced the whole state or merged named fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Full,
    Partial,
}

impl UpdateKind {
    pub fn is_partial(&self) -> bool {
        matches!(self, UpdateKind::Partial)
    }
}

/// Where an update entered this process: parsed from an upstream feed on
/// this worker, or received from another worker via the cluster relay.
/// Listeners use this to avoid re-publishing remote changes back to the
/// relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Latest known denormalized snapshot for one entity: a mapping of named
/// fields (scores, prices, period, live/ended flags, timestamps) to values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityState {
    fields: BTreeMap<String, Value>,
}

impl EntityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from an iterator of (field, value) pairs.
    pub fn from_fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Merge `other` into `self`, field-wise. Fields absent from `other`
    /// are left untouched; overlapping fields take `other`'s value.
    pub fn merge(&mut self, other: &EntityState) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// True if merging `other` would change nothing: every field of `other`
    /// is already present with an identical value. Exact equality only.
    pub fn contains_all(&self, other: &EntityState) -> bool {
        other
            .fields
            .iter()
            .all(|(k, v)| self.fields.get(k) == Some(v))
    }

    /// Boolean field accessor; non-boolean values read as absent.
    pub fn flag(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    /// An entity is concluded when it says so: `ended: true`, or an
    /// explicit `live: false`.
    pub fn is_ended(&self) -> bool {
        self.flag("ended").unwrap_or(false) || self.flag("live") == Some(false)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_key_is_case_normalized() {
        assert_eq!(EntityKey::new("  NBA-Lakers-42 "), EntityKey::new("nba-lakers-42"));
        assert_eq!(EntityKey::from("BTCUSD").as_str(), "btcusd");
    }

    #[test]
    fn test_merge_overwrites_overlap_only() {
        let mut state = EntityState::from_fields([
            ("home_score", json!(1)),
            ("away_score", json!(0)),
            ("period", json!("Q1")),
        ]);
        let patch = EntityState::from_fields([("home_score", json!(2))]);

        state.merge(&patch);

        assert_eq!(state.get("home_score"), Some(&json!(2)));
        assert_eq!(state.get("away_score"), Some(&json!(0)));
        assert_eq!(state.get("period"), Some(&json!("Q1")));
    }

    #[test]
    fn test_contains_all_is_exact() {
        let state = EntityState::from_fields([("score", json!(3)), ("live", json!(true))]);

        assert!(state.contains_all(&EntityState::from_fields([("score", json!(3))])));
        // Same field, different value.
        assert!(!state.contains_all(&EntityState::from_fields([("score", json!(4))])));
        // 3 and 3.0 are distinct JSON values; no heuristic equality.
        assert!(!state.contains_all(&EntityState::from_fields([("score", json!(3.0))])));
        // Missing field.
        assert!(!state.contains_all(&EntityState::from_fields([("period", json!("Q4"))])));
    }

    #[test]
    fn test_is_ended() {
        assert!(!EntityState::from_fields([("live", json!(true))]).is_ended());
        assert!(EntityState::from_fields([("live", json!(false))]).is_ended());
        assert!(EntityState::from_fields([("ended", json!(true))]).is_ended());
        assert!(!EntityState::new().is_ended());
    }

    #[test]
    fn test_state_serde_is_transparent() {
        let state = EntityState::from_fields([("price", json!(0.42))]);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"price":0.42}"#);
        let back: EntityState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
