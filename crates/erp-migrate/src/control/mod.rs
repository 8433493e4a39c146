//! Read-only operator queries over persisted job state.
//!
//! Nothing here writes to the [`JobStore`]; every view is derived from what
//! the pipeline and orchestrator persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ErrorClass, FailureStage, MigrateError, Result};
use crate::pipeline::outcome::{MergeExplanationEntry, QuarantineEntry, RecordStatus};
use crate::pipeline::PipelineStats;
use crate::state::{JobRecord, JobStatus, JobStore, StepCheckpoint};

/// Default page size for paginated queries.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl PageQuery {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T: Serialize> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Quarantine filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarantineFilter {
    pub entity_type: Option<String>,
    pub failure_stage: Option<FailureStage>,
    pub error_class: Option<ErrorClass>,
    pub error_code: Option<String>,
}

impl QuarantineFilter {
    pub fn matches(&self, entry: &QuarantineEntry) -> bool {
        self.entity_type.as_ref().map_or(true, |e| *e == entry.entity_type)
            && self.failure_stage.map_or(true, |s| s == entry.failure_stage)
            && self.error_class.map_or(true, |c| c == entry.error_class)
            && self.error_code.as_ref().map_or(true, |c| *c == entry.error_code)
    }
}

/// Checkpoint progress of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointProgress {
    pub entity_type: String,
    pub cursor: String,
    pub batch_index: u64,
    pub processed_count: u64,
    pub complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&StepCheckpoint> for CheckpointProgress {
    fn from(cp: &StepCheckpoint) -> Self {
        Self {
            entity_type: cp.entity_type.clone(),
            cursor: cp.cursor.to_string(),
            batch_index: cp.batch_index,
            processed_count: cp.processed_count,
            complete: cp.is_complete(),
            updated_at: cp.updated_at,
        }
    }
}

/// Operator overview of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub entity_type: String,
    pub status: JobStatus,
    pub runs: u32,
    pub loaded: u64,
    pub skipped: u64,
    pub manual_review: u64,
    pub quarantined: u64,
    pub checkpoints: Vec<CheckpointProgress>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Aggregate statistics over a job's outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStats {
    pub job_id: String,
    pub total_outcomes: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_action: BTreeMap<String, u64>,
    pub by_failure_stage: BTreeMap<String, u64>,
    /// Mean score over outcomes that carry one.
    pub average_score: Option<f64>,
    pub quarantine_rate: f64,
    pub manual_review_rate: f64,
    /// Statistics of the job's most recent pipeline run.
    pub last_run: Option<PipelineStats>,
}

pub struct ControlPlane {
    jobs: Arc<dyn JobStore>,
}

impl ControlPlane {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    async fn job(&self, job_id: &str) -> Result<JobRecord> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| MigrateError::State(format!("job '{}' not found", job_id)))
    }

    pub async fn job_summary(&self, job_id: &str) -> Result<JobSummary> {
        let job = self.job(job_id).await?;
        let outcomes = self.jobs.outcomes(job_id).await?;
        let count = |status: RecordStatus| outcomes.iter().filter(|o| o.status == status).count() as u64;
        let checkpoints = self.jobs.checkpoints(job_id).await?;

        Ok(JobSummary {
            loaded: count(RecordStatus::Loaded),
            skipped: count(RecordStatus::Skipped),
            manual_review: count(RecordStatus::ManualReview),
            quarantined: count(RecordStatus::Quarantined),
            checkpoints: checkpoints.iter().map(CheckpointProgress::from).collect(),
            job_id: job.job_id,
            entity_type: job.entity_type,
            status: job.status,
            runs: job.runs,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
        })
    }

    /// Quarantined records of a job, filtered, in recording order.
    pub async fn quarantine_entries(
        &self,
        job_id: &str,
        filter: &QuarantineFilter,
        page: PageQuery,
    ) -> Result<Paginated<QuarantineEntry>> {
        let matching: Vec<QuarantineEntry> = self
            .jobs
            .quarantine(job_id)
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        let total = matching.len();
        let data = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Paginated {
            data,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn checkpoint_entries(&self, job_id: &str) -> Result<Vec<StepCheckpoint>> {
        self.jobs.checkpoints(job_id).await
    }

    /// Merge explanations of a job, optionally for one legacy record.
    pub async fn merge_explanations(
        &self,
        job_id: &str,
        legacy_id: Option<&str>,
    ) -> Result<Vec<MergeExplanationEntry>> {
        let entries = self.jobs.explanations(job_id).await?;
        Ok(match legacy_id {
            Some(id) => entries.into_iter().filter(|e| e.legacy_id == id).collect(),
            None => entries,
        })
    }

    pub async fn job_stats(&self, job_id: &str) -> Result<JobStats> {
        let job = self.job(job_id).await?;
        let outcomes = self.jobs.outcomes(job_id).await?;

        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_action: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_failure_stage: BTreeMap<String, u64> = BTreeMap::new();
        let mut score_sum = 0.0;
        let mut scored = 0u64;
        for outcome in &outcomes {
            *by_status.entry(outcome.status.as_str().to_string()).or_default() += 1;
            if let Some(action) = outcome.action {
                *by_action.entry(action.as_str().to_string()).or_default() += 1;
            }
            if let Some(stage) = outcome.failure_stage {
                *by_failure_stage.entry(stage.to_string()).or_default() += 1;
            }
            if let Some(score) = outcome.score {
                score_sum += score;
                scored += 1;
            }
        }

        let total = outcomes.len() as u64;
        let rate = |status: RecordStatus| {
            if total == 0 {
                0.0
            } else {
                by_status.get(status.as_str()).copied().unwrap_or(0) as f64 / total as f64
            }
        };

        Ok(JobStats {
            job_id: job.job_id,
            total_outcomes: total,
            quarantine_rate: rate(RecordStatus::Quarantined),
            manual_review_rate: rate(RecordStatus::ManualReview),
            average_score: (scored > 0).then(|| score_sum / scored as f64),
            by_status,
            by_action,
            by_failure_stage,
            last_run: job.stats,
        })
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.jobs.list_jobs().await
    }
}
