//! Error types for the migration library.
//!
//! Every error carries an [`ErrorClass`] that drives retry policy: transient
//! errors (lock contention, unreachable collaborators, reservation races) are
//! retried by the worker, permanent errors quarantine the record.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::traits::ReservationOwner;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record pipeline stage at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Extract,
    Transform,
    Detect,
    Reserve,
    Load,
    Snapshot,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Extract => "extract",
            FailureStage::Transform => "transform",
            FailureStage::Detect => "detect",
            FailureStage::Reserve => "reserve",
            FailureStage::Load => "load",
            FailureStage::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Legacy connector failure (introspection or page fetch).
    #[error("Legacy connector error: {message}")]
    Connector { message: String, class: ErrorClass },

    /// A field value could not be normalized or coerced.
    #[error("Transform failed for field '{field}' in step {step}: {message}")]
    Transform {
        field: String,
        step: String,
        message: String,
    },

    /// Conflict detection or candidate lookup failed.
    #[error("Detection failed for {entity_type}: {message}")]
    Detection {
        entity_type: String,
        message: String,
        class: ErrorClass,
    },

    /// Another owner already holds the target identity.
    #[error("Target {entity_type}/{target_id} is reserved by {holder}")]
    ReservationConflict {
        entity_type: String,
        target_id: String,
        holder: ReservationOwner,
    },

    /// Target write failure.
    #[error("Load failed for {entity_type}/{target_id}: {message}")]
    Load {
        entity_type: String,
        target_id: String,
        message: String,
        class: ErrorClass,
    },

    /// Preflight or postflight gate failed.
    #[error("Gate {gate} failed: {message}")]
    GateFailure { gate: String, message: String },

    /// Job persistence error
    #[error("State error: {0}")]
    State(String),

    /// An outcome was already recorded for this record.
    #[error("Outcome already recorded for {entity_type}/{legacy_id}")]
    DuplicateOutcome {
        entity_type: String,
        legacy_id: String,
    },

    /// Transform version or plan fingerprint changed since the checkpoint.
    #[error("Migration plan has changed since last run ({0}) - cannot resume. Use --force to override.")]
    PlanChanged(String),

    /// Audit signature could not be produced or did not verify.
    #[error("Signature error: {0}")]
    Signature(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a transient connector error.
    pub fn connector(message: impl Into<String>) -> Self {
        MigrateError::Connector {
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    /// Create a Transform error
    pub fn transform(
        field: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::Transform {
            field: field.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a Detection error with the given class.
    pub fn detection(
        entity_type: impl Into<String>,
        message: impl Into<String>,
        class: ErrorClass,
    ) -> Self {
        MigrateError::Detection {
            entity_type: entity_type.into(),
            message: message.into(),
            class,
        }
    }

    /// Create a Load error with the given class.
    pub fn load(
        entity_type: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
        class: ErrorClass,
    ) -> Self {
        MigrateError::Load {
            entity_type: entity_type.into(),
            target_id: target_id.into(),
            message: message.into(),
            class,
        }
    }

    /// Create a GateFailure error
    pub fn gate(gate: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::GateFailure {
            gate: gate.into(),
            message: message.into(),
        }
    }

    /// Retry classification for this error.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            MigrateError::Connector { class, .. }
            | MigrateError::Detection { class, .. }
            | MigrateError::Load { class, .. } => *class,
            MigrateError::ReservationConflict { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether the worker should retry after this error.
    pub fn is_transient(&self) -> bool {
        self.error_class() == ErrorClass::Transient
    }

    /// Per-record stage this error belongs to, if it is a record-level failure.
    pub fn failure_stage(&self) -> Option<FailureStage> {
        match self {
            MigrateError::Connector { .. } => Some(FailureStage::Extract),
            MigrateError::Transform { .. } => Some(FailureStage::Transform),
            MigrateError::Detection { .. } => Some(FailureStage::Detect),
            MigrateError::ReservationConflict { .. } => Some(FailureStage::Reserve),
            MigrateError::Load { .. } => Some(FailureStage::Load),
            _ => None,
        }
    }

    /// Stable machine-readable code recorded in outcomes and quarantine entries.
    pub fn code(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "CONFIG",
            MigrateError::Connector { .. } => "CONNECTOR",
            MigrateError::Transform { .. } => "TRANSFORM_FAILED",
            MigrateError::Detection { .. } => "DETECTION_FAILED",
            MigrateError::ReservationConflict { .. } => "RESERVATION_CONFLICT",
            MigrateError::Load { .. } => "LOAD_FAILED",
            MigrateError::GateFailure { .. } => "GATE_FAILED",
            MigrateError::State(_) => "STATE",
            MigrateError::DuplicateOutcome { .. } => "DUPLICATE_OUTCOME",
            MigrateError::PlanChanged(_) => "PLAN_CHANGED",
            MigrateError::Signature(_) => "SIGNATURE",
            MigrateError::Io(_) => "IO",
            MigrateError::Yaml(_) => "YAML",
            MigrateError::Json(_) => "JSON",
            MigrateError::Cancelled => "CANCELLED",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::GateFailure { .. } => 3,
            MigrateError::PlanChanged(_) => 4,
            MigrateError::Signature(_) => 5,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_conflict_is_transient() {
        let err = MigrateError::ReservationConflict {
            entity_type: "contacts".into(),
            target_id: "t-1".into(),
            holder: ReservationOwner::new("job-a", "L1"),
        };
        assert!(err.to_string().ends_with("reserved by job-a/L1"));
        assert!(err.is_transient());
        assert_eq!(err.code(), "RESERVATION_CONFLICT");
    }

    #[test]
    fn test_transform_error_is_permanent() {
        let err = MigrateError::transform("email", "normalize_email", "missing @");
        assert_eq!(err.error_class(), ErrorClass::Permanent);
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_load_error_keeps_class() {
        let err = MigrateError::load("invoices", "t-9", "lock timeout", ErrorClass::Transient);
        assert!(err.is_transient());
        let err = MigrateError::load("invoices", "t-9", "constraint", ErrorClass::Permanent);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::gate("mapping", "x").exit_code(), 3);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&FailureStage::Snapshot).unwrap();
        assert_eq!(json, "\"snapshot\"");
        let json = serde_json::to_string(&ErrorClass::Transient).unwrap();
        assert_eq!(json, "\"transient\"");
    }
}
