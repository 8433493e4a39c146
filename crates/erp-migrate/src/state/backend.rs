//! Job store trait.
//!
//! The pipeline, orchestrator, rollback engine and control plane work with
//! `Arc<dyn JobStore>` without knowing where the data lives.

use async_trait::async_trait;

use super::{JobRecord, StepCheckpoint};
use crate::error::Result;
use crate::pipeline::outcome::{MergeExplanationEntry, QuarantineEntry, RecordOutcome, Snapshot};

/// Persistence for job progress and per-record results.
///
/// # Invariants
///
/// - At most one [`RecordOutcome`] per `(entity_type, legacy_id)`; a second
///   write fails with [`MigrateError::DuplicateOutcome`](crate::MigrateError::DuplicateOutcome).
/// - One [`StepCheckpoint`] per `(job_id, entity_type)`, always upserted.
/// - Snapshots get strictly increasing sequence numbers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Outcome already recorded for a legacy record, by any job.
    async fn get_outcome(&self, entity_type: &str, legacy_id: &str) -> Result<Option<RecordOutcome>>;

    /// Record a terminal outcome. Never overwrites.
    async fn record_outcome(&self, outcome: &RecordOutcome) -> Result<()>;

    /// Outcomes written by a job, oldest first.
    async fn outcomes(&self, job_id: &str) -> Result<Vec<RecordOutcome>>;

    async fn load_checkpoint(&self, job_id: &str, entity_type: &str) -> Result<Option<StepCheckpoint>>;

    /// Upsert the checkpoint for `(job_id, entity_type)`.
    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<()>;

    async fn checkpoints(&self, job_id: &str) -> Result<Vec<StepCheckpoint>>;

    /// Append a snapshot and return its assigned sequence number.
    async fn record_snapshot(&self, snapshot: Snapshot) -> Result<u64>;

    /// Snapshots of a job in sequence order.
    async fn snapshots(&self, job_id: &str) -> Result<Vec<Snapshot>>;

    /// Earliest snapshot a job recorded for one record and target.
    async fn find_snapshot(
        &self,
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: &str,
    ) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots(job_id)
            .await?
            .into_iter()
            .find(|s| s.entity_type == entity_type && s.legacy_id == legacy_id && s.target_id == target_id))
    }

    async fn record_quarantine(&self, entry: &QuarantineEntry) -> Result<()>;

    async fn quarantine(&self, job_id: &str) -> Result<Vec<QuarantineEntry>>;

    async fn record_explanation(&self, entry: &MergeExplanationEntry) -> Result<()>;

    async fn explanations(&self, job_id: &str) -> Result<Vec<MergeExplanationEntry>>;

    /// Insert or replace a job record.
    async fn save_job(&self, job: &JobRecord) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}
