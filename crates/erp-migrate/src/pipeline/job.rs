//! Migration job definition and run result.
//!
//! A [`MigrationJob`] carries everything needed to migrate one entity type:
//! the mapping, the thresholds and the locale. It can be queued, serialized
//! and re-executed; re-execution resumes from the job's checkpoint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::stats::PipelineStats;
use crate::core::cursor::Cursor;
use crate::core::identifier::validate_identifier;
use crate::core::schema::EntityMapping;
use crate::detect::ConflictThresholds;
use crate::error::{MigrateError, Result};
use crate::transform::TransformChain;

fn default_locale() -> String {
    "en-US".to_string()
}

/// One entity type migrated under fixed thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub job_id: String,
    pub mapping: EntityMapping,
    #[serde(default)]
    pub thresholds: ConflictThresholds,
    /// Locale used by transforms (date order, phone country code).
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Resume even if the plan fingerprint changed.
    #[serde(default)]
    pub force: bool,
}

impl MigrationJob {
    pub fn new(job_id: impl Into<String>, mapping: EntityMapping) -> Self {
        Self {
            job_id: job_id.into(),
            mapping,
            thresholds: ConflictThresholds::default(),
            locale: default_locale(),
            force: false,
        }
    }

    pub fn with_thresholds(mut self, thresholds: ConflictThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.mapping.entity_type
    }

    /// Check the job before anything touches a collaborator.
    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(MigrateError::Config("job_id must not be empty".into()));
        }
        self.thresholds.validate()?;
        validate_identifier(&self.mapping.table)?;
        validate_identifier(&self.mapping.id_column)?;
        for field in &self.mapping.fields {
            validate_identifier(&field.source)?;
        }
        Ok(())
    }

    /// Hash of everything that changes what a record turns into.
    ///
    /// Stored in the checkpoint; resuming under a different fingerprint
    /// fails unless forced.
    pub fn plan_fingerprint(&self, chain: &TransformChain) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&self.mapping)?);
        hasher.update(serde_json::to_vec(&self.thresholds)?);
        hasher.update(self.locale.as_bytes());
        hasher.update(chain.fingerprint().as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub entity_type: String,
    pub stats: PipelineStats,
    pub final_cursor: Cursor,
    /// The source was exhausted.
    pub completed: bool,
}
