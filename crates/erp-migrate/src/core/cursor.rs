//! Pagination cursors for legacy extraction.
//!
//! A [`Cursor`] records where extraction left off. It is persisted in the
//! step checkpoint after every committed batch, so every variant must
//! round-trip through JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where extraction left off. Exactly one variant is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Nothing has been read yet.
    #[default]
    Start,

    /// Row offset (for sources without a stable key).
    Offset { offset: u64 },

    /// Keyset pagination on the legacy id.
    LastId { id: String },

    /// Keyset pagination on (modified timestamp, id).
    Composite { timestamp: DateTime<Utc>, id: String },

    /// Opaque continuation token issued by the source.
    Token { token: String },

    /// The source is exhausted.
    End,
}

impl Cursor {
    /// Check if the source has been fully read.
    pub fn is_end(&self) -> bool {
        matches!(self, Cursor::End)
    }

    /// Check if extraction has not started.
    pub fn is_start(&self) -> bool {
        matches!(self, Cursor::Start)
    }

    /// Variant name, used in logs and for compatibility checks.
    pub fn kind(&self) -> &'static str {
        match self {
            Cursor::Start => "start",
            Cursor::Offset { .. } => "offset",
            Cursor::LastId { .. } => "last_id",
            Cursor::Composite { .. } => "composite",
            Cursor::Token { .. } => "token",
            Cursor::End => "end",
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("start"),
            Cursor::Offset { offset } => write!(f, "offset:{}", offset),
            Cursor::LastId { id } => write!(f, "id>{}", id),
            Cursor::Composite { timestamp, id } => {
                write!(f, "({},{})>", timestamp.to_rfc3339(), id)
            }
            Cursor::Token { token } => write!(f, "token:{}", token),
            Cursor::End => f.write_str("end"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_json_is_kind_tagged() {
        let cursor = Cursor::LastId { id: "C-100".into() };
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json["kind"], "last_id");
        assert_eq!(json["id"], "C-100");
    }

    #[test]
    fn test_composite_cursor_survives_persistence() {
        let cursor = Cursor::Composite {
            timestamp: Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap(),
            id: "42".into(),
        };
        let json = serde_json::to_string(&cursor).unwrap();
        let back: Cursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
        assert_eq!(back.kind(), "composite");
    }

    #[test]
    fn test_start_and_end_are_distinct() {
        assert!(Cursor::default().is_start());
        assert!(!Cursor::default().is_end());
        assert!(Cursor::End.is_end());
    }
}
