//! Migration orchestrator - per-job workflow coordinator.
//!
//! A job runs through five phases:
//!
//! 1. Introspect the legacy table
//! 2. Preflight gates (first run only; a resumed job already passed them)
//! 3. Pipeline run from the checkpoint
//! 4. Postflight gates
//! 5. Persist the [`JobRecord`]
//!
//! Calling [`Orchestrator::execute`] again for the same job resumes from the
//! checkpoint. The orchestrator shares one [`PipelineEngine`], so repeated
//! runs share its per-record attempt budget.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{MigrateError, Result};
use crate::gates::{PostflightGateChain, PostflightInput, PreflightGateChain, ReadinessInput, ReadinessReport};
use crate::pipeline::{JobResult, MigrationJob, PipelineEngine};
use crate::state::{JobRecord, JobStatus};

/// Result of one [`Orchestrator::execute`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub entity_type: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<ReadinessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postflight: Option<ReadinessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub(crate) fn from_record(record: &JobRecord, result: Option<JobResult>) -> Self {
        Self {
            job_id: record.job_id.clone(),
            entity_type: record.entity_type.clone(),
            status: record.status,
            result,
            preflight: record.preflight.clone(),
            postflight: record.postflight.clone(),
            error: record.error.clone(),
        }
    }

    /// Report for a job that never produced a record (e.g. invalid job).
    pub fn failed(job: &MigrationJob, error: &MigrateError) -> Self {
        Self {
            job_id: job.job_id.clone(),
            entity_type: job.entity_type().to_string(),
            status: JobStatus::Failed,
            result: None,
            preflight: None,
            postflight: None,
            error: Some(error.to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    engine: Arc<PipelineEngine>,
    preflight: PreflightGateChain,
    postflight: PostflightGateChain,
    preflight_overrides: Vec<String>,
}

impl Orchestrator {
    /// Orchestrator with the standard gate chains and default limits.
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self {
            engine,
            preflight: PreflightGateChain::standard(0.5, 0.05),
            postflight: PostflightGateChain::standard(),
            preflight_overrides: Vec::new(),
        }
    }

    pub fn with_preflight(mut self, chain: PreflightGateChain) -> Self {
        self.preflight = chain;
        self
    }

    pub fn with_postflight(mut self, chain: PostflightGateChain) -> Self {
        self.postflight = chain;
        self
    }

    /// Preflight gates allowed to fail without blocking.
    pub fn with_preflight_overrides(mut self, overrides: Vec<String>) -> Self {
        self.preflight_overrides = overrides;
        self
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Run or resume `job`.
    ///
    /// `Err` means the run aborted; the job record has been persisted with
    /// the failure and the checkpoint still points at the last committed
    /// batch. Gate failures are errors as well (status `blocked`), but a
    /// failing postflight is not: it finishes the job as `needs_review`.
    pub async fn execute(&self, job: &MigrationJob, cancel: &CancellationToken) -> Result<JobReport> {
        job.validate()?;
        let jobs = self.engine.job_store();
        let entity_type = job.entity_type();

        let mut record = match jobs.get_job(&job.job_id).await? {
            Some(existing) => {
                if existing.status == JobStatus::RolledBack {
                    return Err(MigrateError::State(format!(
                        "job '{}' was rolled back; start a new job instead",
                        job.job_id
                    )));
                }
                if existing.entity_type != entity_type {
                    return Err(MigrateError::State(format!(
                        "job '{}' belongs to entity type '{}', not '{}'",
                        job.job_id, existing.entity_type, entity_type
                    )));
                }
                existing
            }
            None => JobRecord::new(
                &job.job_id,
                entity_type,
                job.thresholds,
                self.engine.chain().version(),
            ),
        };
        if job.force {
            record.thresholds = job.thresholds;
            record.transform_version = self.engine.chain().version().to_string();
        }
        record.plan_fingerprint = Some(job.plan_fingerprint(self.engine.chain())?);
        record.mark_running();
        jobs.save_job(&record).await?;

        info!(
            "Starting job {} ({}), run {}",
            job.job_id, entity_type, record.runs
        );

        match self.run_phases(job, &mut record, cancel).await {
            Ok(result) => {
                // Phase 5: Persist
                info!("Phase 5: Persisting job record ({})", record.status);
                record.stats = Some(result.stats.clone());
                jobs.save_job(&record).await?;
                Ok(JobReport::from_record(&record, Some(result)))
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Job {} aborted (transient): {}", job.job_id, e);
                } else {
                    error!("Job {} failed: {}", job.job_id, e);
                }
                record.mark_failed(&e);
                if let Err(save_err) = jobs.save_job(&record).await {
                    error!("Failed to persist job {} after error: {}", job.job_id, save_err);
                }
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        job: &MigrationJob,
        record: &mut JobRecord,
        cancel: &CancellationToken,
    ) -> Result<JobResult> {
        let jobs = self.engine.job_store();
        let entity_type = job.entity_type();

        // Phase 1: Introspect
        info!("Phase 1: Introspecting legacy table {}", job.mapping.table);
        let schema = self.engine.connector().introspect(&job.mapping.table).await?;
        info!("Found {} legacy columns", schema.columns.len());

        // Phase 2: Preflight
        match jobs.load_checkpoint(&job.job_id, entity_type).await? {
            Some(checkpoint) => {
                info!(
                    "Phase 2: Preflight skipped (resuming at {}, batch {})",
                    checkpoint.cursor, checkpoint.batch_index
                );
            }
            None => {
                info!("Phase 2: Running preflight gates");
                let report = self.preflight_report(job, &schema).await?;
                let verdict = report.ensure_passed("preflight");
                record.preflight = Some(report);
                // A failure is persisted as `blocked` by the caller.
                verdict?;
            }
        }

        // Phase 3: Pipeline
        info!("Phase 3: Migrating records");
        let result = self.engine.run(job, cancel).await?;

        // Phase 4: Postflight
        info!("Phase 4: Running postflight gates");
        let outcomes: Vec<_> = jobs
            .outcomes(&job.job_id)
            .await?
            .into_iter()
            .filter(|o| o.entity_type == entity_type)
            .collect();
        let (processed_count, previously_recorded) = jobs
            .load_checkpoint(&job.job_id, entity_type)
            .await?
            .map(|cp| (cp.processed_count, cp.previously_recorded))
            .unwrap_or((0, 0));
        let postflight = self.postflight.run(&PostflightInput {
            job_id: &job.job_id,
            entity_type,
            outcomes: &outcomes,
            processed_count,
            previously_recorded,
        });
        let status = if postflight.passed {
            JobStatus::Completed
        } else {
            for check in postflight.blocking() {
                warn!("Postflight {} failed: {}", check.gate, check.diagnostic);
            }
            JobStatus::NeedsReview
        };
        record.postflight = Some(postflight);
        record.mark_finished(status);

        Ok(result)
    }

    async fn preflight_report(
        &self,
        job: &MigrationJob,
        schema: &crate::core::schema::LegacySchema,
    ) -> Result<ReadinessReport> {
        let detector = self.engine.detectors().get(job.entity_type())?;
        let sample = self
            .engine
            .connector()
            .sample(
                &job.mapping.table,
                &job.mapping.id_column,
                &job.mapping.filters,
                self.engine.config().sample_size,
            )
            .await?;
        let match_keys = detector.match_keys();
        let report = self.preflight.run(
            &ReadinessInput {
                schema,
                mapping: &job.mapping,
                sample: &sample,
                chain: self.engine.chain(),
                match_keys: &match_keys,
                locale: &job.locale,
            },
            &self.preflight_overrides,
        );
        for check in &report.checks {
            if check.is_blocking() {
                warn!("Preflight {} failed: {}", check.gate, check.diagnostic);
            } else if !check.passed {
                warn!("Preflight {} failed but is overridden: {}", check.gate, check.diagnostic);
            }
        }
        Ok(report)
    }

    /// Run the preflight gates only, without touching job state.
    pub async fn preflight_only(&self, job: &MigrationJob) -> Result<ReadinessReport> {
        job.validate()?;
        let schema = self.engine.connector().introspect(&job.mapping.table).await?;
        self.preflight_report(job, &schema).await
    }
}
