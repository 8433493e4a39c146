//! Job persistence: checkpoints, outcomes, snapshots and job records.
//!
//! The [`JobStore`] trait is the persistence port used by the pipeline,
//! orchestrator, rollback engine and control plane. Two implementations ship
//! with the crate:
//!
//! - [`MemoryJobStore`]: process-local, for tests and embedding
//! - [`FileJobStore`]: a signed JSON document rewritten at each checkpoint,
//!   plus a signed append-only journal of snapshots in between

mod backend;
mod file;
mod memory;

pub use backend::JobStore;
pub use file::FileJobStore;
pub use memory::MemoryJobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::cursor::Cursor;
use crate::detect::ConflictThresholds;
use crate::error::{MigrateError, Result};
use crate::gates::ReadinessReport;
use crate::pipeline::outcome::{MergeExplanationEntry, QuarantineEntry, RecordOutcome, Snapshot};
use crate::pipeline::PipelineStats;

/// Progress of one `(job, entity type)` pipeline. Upserted after every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub job_id: String,
    pub entity_type: String,
    /// Resume point: the first row not yet committed.
    pub cursor: Cursor,
    /// Batches committed so far.
    pub batch_index: u64,
    /// Rows in committed batches.
    pub processed_count: u64,
    /// Rows loaded (created, updated or merged) in committed batches.
    pub loaded_count: u64,
    /// Rows whose outcome was recorded by an earlier job.
    #[serde(default)]
    pub previously_recorded: u64,
    pub transform_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepCheckpoint {
    /// Fresh checkpoint at the start of the source.
    pub fn new(job_id: &str, entity_type: &str, transform_version: &str, plan_fingerprint: Option<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            entity_type: entity_type.to_string(),
            cursor: Cursor::Start,
            batch_index: 0,
            processed_count: 0,
            loaded_count: 0,
            previously_recorded: 0,
            transform_version: transform_version.to_string(),
            plan_fingerprint,
            updated_at: Utc::now(),
        }
    }

    /// Move past a committed batch.
    pub fn advance(&mut self, cursor: Cursor, processed: u64, loaded: u64, previously_recorded: u64) {
        self.cursor = cursor;
        self.batch_index += 1;
        self.processed_count += processed;
        self.loaded_count += loaded;
        self.previously_recorded += previously_recorded;
        self.updated_at = Utc::now();
    }

    /// Whether the source has been exhausted.
    pub fn is_complete(&self) -> bool {
        self.cursor.is_end()
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Preflight failed; nothing was extracted.
    Blocked,
    Completed,
    /// Finished, but postflight flagged an invariant.
    NeedsReview,
    Failed,
    Cancelled,
    RolledBack,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Blocked => "blocked",
            JobStatus::Completed => "completed",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the job can still make progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::NeedsReview | JobStatus::RolledBack
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one job: one entity type migrated under fixed thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub entity_type: String,
    pub status: JobStatus,
    pub thresholds: ConflictThresholds,
    pub transform_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<ReadinessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postflight: Option<ReadinessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PipelineStats>,
    /// Pipeline runs started for this job (first run plus retries and resumes).
    #[serde(default)]
    pub runs: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: &str, entity_type: &str, thresholds: ConflictThresholds, transform_version: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            entity_type: entity_type.to_string(),
            status: JobStatus::Pending,
            thresholds,
            transform_version: transform_version.to_string(),
            plan_fingerprint: None,
            preflight: None,
            postflight: None,
            stats: None,
            runs: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Mark a new pipeline run as started.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.runs += 1;
        self.completed_at = None;
        self.error = None;
    }

    /// Mark the job finished with `status`.
    pub fn mark_finished(&mut self, status: JobStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the job failed with an error message.
    pub fn mark_failed(&mut self, error: &MigrateError) {
        self.status = match error {
            MigrateError::Cancelled => JobStatus::Cancelled,
            MigrateError::GateFailure { .. } => JobStatus::Blocked,
            _ => JobStatus::Failed,
        };
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// Everything a job store holds, in a serializable form.
///
/// Shared by the memory and file stores so both enforce the same rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct JobData {
    /// Keyed by `entity_type/legacy_id`.
    #[serde(default)]
    outcomes: BTreeMap<String, RecordOutcome>,
    /// Keyed by `job_id/entity_type`.
    #[serde(default)]
    checkpoints: BTreeMap<String, StepCheckpoint>,
    #[serde(default)]
    snapshots: Vec<Snapshot>,
    #[serde(default)]
    quarantine: Vec<QuarantineEntry>,
    #[serde(default)]
    explanations: Vec<MergeExplanationEntry>,
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    next_seq: u64,
}

fn key(a: &str, b: &str) -> String {
    format!("{}/{}", a, b)
}

impl JobData {
    pub(crate) fn get_outcome(&self, entity_type: &str, legacy_id: &str) -> Option<RecordOutcome> {
        self.outcomes.get(&key(entity_type, legacy_id)).cloned()
    }

    pub(crate) fn record_outcome(&mut self, outcome: &RecordOutcome) -> Result<()> {
        let k = key(&outcome.entity_type, &outcome.legacy_id);
        if self.outcomes.contains_key(&k) {
            return Err(MigrateError::DuplicateOutcome {
                entity_type: outcome.entity_type.clone(),
                legacy_id: outcome.legacy_id.clone(),
            });
        }
        self.outcomes.insert(k, outcome.clone());
        Ok(())
    }

    pub(crate) fn outcomes(&self, job_id: &str) -> Vec<RecordOutcome> {
        let mut out: Vec<RecordOutcome> = self
            .outcomes
            .values()
            .filter(|o| o.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.entity_type.cmp(&b.entity_type))
                .then_with(|| a.legacy_id.cmp(&b.legacy_id))
        });
        out
    }

    pub(crate) fn load_checkpoint(&self, job_id: &str, entity_type: &str) -> Option<StepCheckpoint> {
        self.checkpoints.get(&key(job_id, entity_type)).cloned()
    }

    pub(crate) fn save_checkpoint(&mut self, checkpoint: &StepCheckpoint) {
        self.checkpoints
            .insert(key(&checkpoint.job_id, &checkpoint.entity_type), checkpoint.clone());
    }

    pub(crate) fn checkpoints(&self, job_id: &str) -> Vec<StepCheckpoint> {
        self.checkpoints
            .values()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }

    pub(crate) fn record_snapshot(&mut self, mut snapshot: Snapshot) -> u64 {
        self.next_seq += 1;
        snapshot.seq = self.next_seq;
        self.snapshots.push(snapshot);
        self.next_seq
    }

    /// Sequence number the next snapshot will receive.
    pub(crate) fn next_snapshot_seq(&self) -> u64 {
        self.next_seq + 1
    }

    /// Apply a snapshot that already carries its sequence number. Returns
    /// false when the snapshot is already part of the data.
    pub(crate) fn replay_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.seq <= self.next_seq {
            return false;
        }
        self.next_seq = snapshot.seq;
        self.snapshots.push(snapshot);
        true
    }

    pub(crate) fn snapshots(&self, job_id: &str) -> Vec<Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect()
    }

    pub(crate) fn find_snapshot(
        &self,
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: &str,
    ) -> Option<Snapshot> {
        self.snapshots
            .iter()
            .find(|s| {
                s.job_id == job_id
                    && s.entity_type == entity_type
                    && s.legacy_id == legacy_id
                    && s.target_id == target_id
            })
            .cloned()
    }

    pub(crate) fn record_quarantine(&mut self, entry: &QuarantineEntry) {
        self.quarantine.push(entry.clone());
    }

    pub(crate) fn quarantine(&self, job_id: &str) -> Vec<QuarantineEntry> {
        self.quarantine
            .iter()
            .filter(|q| q.job_id == job_id)
            .cloned()
            .collect()
    }

    pub(crate) fn record_explanation(&mut self, entry: &MergeExplanationEntry) {
        self.explanations.push(entry.clone());
    }

    pub(crate) fn explanations(&self, job_id: &str) -> Vec<MergeExplanationEntry> {
        self.explanations
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub(crate) fn save_job(&mut self, job: &JobRecord) {
        self.jobs.insert(job.job_id.clone(), job.clone());
    }

    pub(crate) fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).cloned()
    }

    pub(crate) fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::outcome::LoadAction;

    #[test]
    fn test_checkpoint_advance_accumulates() {
        let mut cp = StepCheckpoint::new("j1", "contacts", "std-v3", Some("fp".into()));
        assert_eq!(cp.cursor, Cursor::Start);
        cp.advance(Cursor::LastId { id: "10".into() }, 10, 8, 1);
        cp.advance(Cursor::End, 5, 5, 0);
        assert_eq!(cp.batch_index, 2);
        assert_eq!(cp.processed_count, 15);
        assert_eq!(cp.loaded_count, 13);
        assert_eq!(cp.previously_recorded, 1);
        assert!(cp.is_complete());
    }

    #[test]
    fn test_job_data_rejects_second_outcome() {
        let mut data = JobData::default();
        let first = RecordOutcome::loaded("j1", "contacts", "L1", LoadAction::Create, "t1", None);
        data.record_outcome(&first).unwrap();
        let second = RecordOutcome::skipped("j2", "contacts", "L1", "t1", None);
        let err = data.record_outcome(&second).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateOutcome { .. }));
        assert_eq!(data.get_outcome("contacts", "L1").unwrap().job_id, "j1");
    }

    #[test]
    fn test_checkpoint_upsert_keeps_one_row() {
        let mut data = JobData::default();
        let mut cp = StepCheckpoint::new("j1", "contacts", "std-v3", None);
        data.save_checkpoint(&cp);
        cp.advance(Cursor::Offset { offset: 50 }, 50, 50, 0);
        data.save_checkpoint(&cp);
        let all = data.checkpoints("j1");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cursor, Cursor::Offset { offset: 50 });
    }

    #[test]
    fn test_snapshot_sequence_increases() {
        let mut data = JobData::default();
        let snap = Snapshot::new("j1", "contacts", "L1", "t1", LoadAction::Create, None, Default::default());
        let a = data.record_snapshot(snap.clone());
        let b = data.record_snapshot(snap);
        assert!(b > a);
        assert_eq!(data.snapshots("j1")[1].seq, b);
    }

    #[test]
    fn test_job_record_failure_status() {
        let mut job = JobRecord::new("j1", "contacts", ConflictThresholds::default(), "std-v3");
        job.mark_running();
        assert_eq!(job.runs, 1);
        job.mark_failed(&MigrateError::gate("preflight", "mapping"));
        assert_eq!(job.status, JobStatus::Blocked);
        job.mark_failed(&MigrateError::Cancelled);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!job.status.is_terminal());
    }
}
