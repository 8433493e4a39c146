//! Per-record results written by the pipeline.
//!
//! A [`RecordOutcome`] is the terminal status of one legacy record. Exactly
//! one exists per `(entity_type, legacy_id)` in a job store and it is never
//! rewritten. [`Snapshot`]s capture target state before each write so a job
//! can be rolled back; [`QuarantineEntry`]s keep the raw legacy fields of
//! failed records for repair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::value::Record;
use crate::detect::{ConflictThresholds, Decision, MatchExplanation};
use crate::error::{ErrorClass, FailureStage, MigrateError};

/// Terminal status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Loaded,
    Quarantined,
    ManualReview,
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Loaded => "loaded",
            RecordStatus::Quarantined => "quarantined",
            RecordStatus::ManualReview => "manual_review",
            RecordStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action taken against the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadAction {
    Create,
    Update,
    Merge,
    Skip,
}

impl LoadAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadAction::Create => "create",
            LoadAction::Update => "update",
            LoadAction::Merge => "merge",
            LoadAction::Skip => "skip",
        }
    }
}

impl fmt::Display for LoadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result for one legacy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub job_id: String,
    pub entity_type: String,
    pub legacy_id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<LoadAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Identifies the processing attempt that produced this outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RecordOutcome {
    fn base(job_id: &str, entity_type: &str, legacy_id: &str, status: RecordStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            entity_type: entity_type.to_string(),
            legacy_id: legacy_id.to_string(),
            status,
            action: None,
            target_id: None,
            score: None,
            attempt_id: None,
            failure_stage: None,
            error_code: None,
            error_class: None,
            message: None,
            recorded_at: Utc::now(),
        }
    }

    /// Record written to the target.
    pub fn loaded(
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        action: LoadAction,
        target_id: &str,
        score: Option<f64>,
    ) -> Self {
        Self {
            action: Some(action),
            target_id: Some(target_id.to_string()),
            score,
            ..Self::base(job_id, entity_type, legacy_id, RecordStatus::Loaded)
        }
    }

    /// Target already held the record's data; nothing was written.
    pub fn skipped(
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: &str,
        score: Option<f64>,
    ) -> Self {
        Self {
            action: Some(LoadAction::Skip),
            target_id: Some(target_id.to_string()),
            score,
            ..Self::base(job_id, entity_type, legacy_id, RecordStatus::Skipped)
        }
    }

    /// Held for a human decision.
    pub fn manual_review(
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: Option<&str>,
        score: Option<f64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.map(str::to_string),
            score,
            message: Some(message.into()),
            ..Self::base(job_id, entity_type, legacy_id, RecordStatus::ManualReview)
        }
    }

    /// Failed at `stage`.
    pub fn quarantined(
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        stage: FailureStage,
        error: &MigrateError,
    ) -> Self {
        Self {
            failure_stage: Some(stage),
            error_code: Some(error.code().to_string()),
            error_class: Some(error.error_class()),
            message: Some(error.to_string()),
            ..Self::base(job_id, entity_type, legacy_id, RecordStatus::Quarantined)
        }
    }

    /// Attach the attempt identifier.
    pub fn with_attempt(mut self, attempt_id: impl Into<String>) -> Self {
        self.attempt_id = Some(attempt_id.into());
        self
    }
}

/// Target state captured around a write, replayed by rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store-assigned, strictly increasing per store.
    pub seq: u64,
    pub job_id: String,
    pub entity_type: String,
    pub legacy_id: String,
    pub target_id: String,
    pub action: LoadAction,
    /// Fields before the write; `None` when the write created the record.
    pub before: Option<Record>,
    pub after: Record,
    pub recorded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: &str,
        action: LoadAction,
        before: Option<Record>,
        after: Record,
    ) -> Self {
        Self {
            seq: 0,
            job_id: job_id.to_string(),
            entity_type: entity_type.to_string(),
            legacy_id: legacy_id.to_string(),
            target_id: target_id.to_string(),
            action,
            before,
            after,
            recorded_at: Utc::now(),
        }
    }
}

/// A failed record kept for repair and re-submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub job_id: String,
    pub entity_type: String,
    pub legacy_id: String,
    pub failure_stage: FailureStage,
    pub error_class: ErrorClass,
    pub error_code: String,
    pub message: String,
    /// Raw legacy columns as extracted.
    pub raw: Record,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl QuarantineEntry {
    pub fn from_outcome(outcome: &RecordOutcome, raw: Record, attempts: u32) -> Option<Self> {
        Some(Self {
            job_id: outcome.job_id.clone(),
            entity_type: outcome.entity_type.clone(),
            legacy_id: outcome.legacy_id.clone(),
            failure_stage: outcome.failure_stage?,
            error_class: outcome.error_class?,
            error_code: outcome.error_code.clone()?,
            message: outcome.message.clone().unwrap_or_default(),
            raw,
            attempts,
            recorded_at: outcome.recorded_at,
        })
    }
}

/// Why a record was merged or sent to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeExplanationEntry {
    pub job_id: String,
    pub entity_type: String,
    pub legacy_id: String,
    pub target_id: String,
    pub score: f64,
    pub decision: Decision,
    pub thresholds: ConflictThresholds,
    pub explanations: Vec<MatchExplanation>,
    pub recorded_at: DateTime<Utc>,
}
