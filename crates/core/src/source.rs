//! Upstream source identifiers.

use serde::{Deserialize, Serialize};

/// An upstream real-time source we ingest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Live game score feed.
    Scores,
    /// Market ticker feed.
    Ticker,
    /// Order book feed (sharded across connections).
    Book,
}

impl Source {
    /// All known sources.
    pub const ALL: [Source; 3] = [Source::Scores, Source::Ticker, Source::Book];

    /// Stable lowercase name, used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Scores => "scores",
            Source::Ticker => "ticker",
            Source::Book => "book",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_names() {
        assert_eq!(Source::Scores.as_str(), "scores");
        assert_eq!(Source::Ticker.to_string(), "ticker");
        assert_eq!(Source::ALL.len(), 3);
    }

    #[test]
    fn test_source_serde_roundtrip() {
        let json = serde_json::to_string(&Source::Book).unwrap();
        assert_eq!(json, "\"book\"");
        let back: Source = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Source::Book);
    }
}
