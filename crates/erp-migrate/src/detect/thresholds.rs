//! Score thresholds and the decision policy.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MigrateError, Result};

/// Cutoffs that turn a detector score into a decision.
///
/// Persisted with every job and audit report so a later audit can tell which
/// policy produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictThresholds {
    /// Scores at or above this merge automatically.
    pub auto_merge: f64,
    /// Scores at or above this (and below `auto_merge`) go to manual review.
    pub manual_review: f64,
}

impl Default for ConflictThresholds {
    fn default() -> Self {
        Self {
            auto_merge: 90.0,
            manual_review: 60.0,
        }
    }
}

/// Bucket a score falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Treat as a new record.
    Create,
    /// Hold for a human.
    ManualReview,
    /// Merge into the matched target.
    Merge,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Create => "create",
            Decision::ManualReview => "manual_review",
            Decision::Merge => "merge",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConflictThresholds {
    /// Build validated thresholds.
    pub fn new(auto_merge: f64, manual_review: f64) -> Result<Self> {
        let thresholds = Self {
            auto_merge,
            manual_review,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Require `0 <= manual_review <= auto_merge <= 100`.
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_range(self.auto_merge) || !in_range(self.manual_review) {
            return Err(MigrateError::Config(format!(
                "thresholds must be within 0..=100 (auto_merge={}, manual_review={})",
                self.auto_merge, self.manual_review
            )));
        }
        if self.manual_review > self.auto_merge {
            return Err(MigrateError::Config(format!(
                "manual_review threshold ({}) must not exceed auto_merge ({})",
                self.manual_review, self.auto_merge
            )));
        }
        Ok(())
    }

    /// Classify a score. Monotonic: a higher score never lands in a lower bucket.
    pub fn classify(&self, score: f64) -> Decision {
        if score >= self.auto_merge {
            Decision::Merge
        } else if score >= self.manual_review {
            Decision::ManualReview
        } else {
            Decision::Create
        }
    }
}
