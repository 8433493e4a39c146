//! Batch pipeline: extract, transform, detect, reserve, load, snapshot.
//!
//! One engine run walks a single entity type from its checkpoint to the end
//! of the legacy source. Every record ends in exactly one [`RecordOutcome`];
//! the checkpoint is upserted only after all outcomes of a batch are written.
//!
//! Failure handling per record:
//!
//! - permanent errors quarantine the record and the batch continues
//! - transient errors abort the batch (checkpoint untouched) until the
//!   record's attempt budget is spent, then it is quarantined with
//!   `error_class: transient`; an exhausted reservation conflict goes to
//!   manual review instead
//! - a reservation held by a record that already has an outcome can never
//!   clear, so the conflicting record goes to manual review at once
//!
//! Each target write is preceded by a durable snapshot of its pre-image, so a
//! replay after a crash finds the snapshot and rollback can always undo it.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{JobResult, MigrationJob};
use super::outcome::{LoadAction, MergeExplanationEntry, QuarantineEntry, RecordOutcome, RecordStatus, Snapshot};
use super::stats::{PipelineConfig, PipelineStats};
use crate::core::cursor::Cursor;
use crate::core::traits::{
    CandidateLookup, CreateOutcome, LegacyConnector, PageRequest, ReservationOwner, TargetStore,
};
use crate::core::value::{LegacyRecord, Record, TargetRecord};
use crate::detect::{select_best, Conflict, ConflictDetector, Decision, DetectionContext, DetectorRegistry};
use crate::error::{ErrorClass, FailureStage, MigrateError, Result};
use crate::state::{JobStore, StepCheckpoint};
use crate::transform::{TransformChain, TransformContext};
use crate::worker::TokenBucket;

/// Deterministic target id for a record created from `legacy_id`.
///
/// Re-running a create after a crash hits the same id, so the target never
/// receives two copies of one legacy record.
pub fn deterministic_target_id(entity_type: &str, legacy_id: &str) -> String {
    let name = format!("erp-migrate:{}:{}", entity_type, legacy_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Why a single record attempt stopped.
enum AttemptError {
    /// Record-level failure at a stage.
    Record { stage: FailureStage, error: MigrateError },
    /// Infrastructure failure (job store); aborts the batch.
    Abort(MigrateError),
}

impl From<MigrateError> for AttemptError {
    fn from(error: MigrateError) -> Self {
        AttemptError::Abort(error)
    }
}

trait StageExt<T> {
    fn at(self, stage: FailureStage) -> std::result::Result<T, AttemptError>;
}

impl<T> StageExt<T> for Result<T> {
    fn at(self, stage: FailureStage) -> std::result::Result<T, AttemptError> {
        self.map_err(|error| AttemptError::Record { stage, error })
    }
}

/// Counters for the batch being processed; folded into the checkpoint.
#[derive(Debug, Default)]
struct BatchCounts {
    processed: u64,
    loaded: u64,
    previously_recorded: u64,
}

/// Runs migration jobs against injected collaborators.
pub struct PipelineEngine {
    connector: Arc<dyn LegacyConnector>,
    lookup: Arc<dyn CandidateLookup>,
    target: Arc<dyn TargetStore>,
    jobs: Arc<dyn JobStore>,
    detectors: DetectorRegistry,
    chain: Arc<TransformChain>,
    config: PipelineConfig,
    limiter: Option<Arc<TokenBucket>>,
    /// Failed attempts per `(entity_type, legacy_id)`, kept across runs.
    attempts: Mutex<HashMap<(String, String), u32>>,
}

impl PipelineEngine {
    pub fn new(
        connector: Arc<dyn LegacyConnector>,
        lookup: Arc<dyn CandidateLookup>,
        target: Arc<dyn TargetStore>,
        jobs: Arc<dyn JobStore>,
        detectors: DetectorRegistry,
    ) -> Self {
        Self {
            connector,
            lookup,
            target,
            jobs,
            detectors,
            chain: Arc::new(TransformChain::standard()),
            config: PipelineConfig::default(),
            limiter: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_chain(mut self, chain: Arc<TransformChain>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Throttle page fetches through a shared bucket.
    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detectors(&self) -> &DetectorRegistry {
        &self.detectors
    }

    pub fn connector(&self) -> &Arc<dyn LegacyConnector> {
        &self.connector
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Run `job` from its checkpoint until the source is exhausted.
    ///
    /// Returns `Err` when a batch aborts (transient failure, job-store
    /// failure, cancellation); the checkpoint then still points at the last
    /// committed batch and the run can be repeated.
    pub async fn run(&self, job: &MigrationJob, cancel: &CancellationToken) -> Result<JobResult> {
        let started = Instant::now();
        job.validate()?;
        let entity_type = job.entity_type();
        let detector = self.detectors.get(entity_type)?;
        let fingerprint = job.plan_fingerprint(&self.chain)?;
        let mut checkpoint = self.resume_point(job, &fingerprint).await?;

        info!(
            "Pipeline {} for {}: starting at {} (batch {}, detector {})",
            job.job_id,
            entity_type,
            checkpoint.cursor,
            checkpoint.batch_index,
            detector.name()
        );

        let mut stats = PipelineStats::new();
        while !checkpoint.cursor.is_end() {
            if cancel.is_cancelled() {
                warn!("Pipeline {} for {} cancelled at {}", job.job_id, entity_type, checkpoint.cursor);
                return Err(MigrateError::Cancelled);
            }
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let request = PageRequest {
                table: job.mapping.table.clone(),
                id_column: job.mapping.id_column.clone(),
                cursor: checkpoint.cursor.clone(),
                filters: job.mapping.filters.clone(),
                limit: self.config.batch_size,
            };
            let page = self.connector.fetch_page(&request).await?;

            let mut counts = BatchCounts::default();
            for row in &page.rows {
                self.process_record(job, detector.as_ref(), row, &mut counts, &mut stats)
                    .await?;
            }

            let next = if page.rows.is_empty() {
                Cursor::End
            } else {
                page.next_cursor
            };
            if next == checkpoint.cursor {
                return Err(MigrateError::Connector {
                    message: format!(
                        "{} returned a page for {} without advancing past {}",
                        self.connector.name(),
                        job.mapping.table,
                        next
                    ),
                    class: ErrorClass::Permanent,
                });
            }
            checkpoint.advance(next, counts.processed, counts.loaded, counts.previously_recorded);
            self.jobs.save_checkpoint(&checkpoint).await?;
            stats.batches += 1;
            debug!(
                "Batch {} committed for {}/{}: {} rows, cursor {}",
                checkpoint.batch_index, job.job_id, entity_type, counts.processed, checkpoint.cursor
            );
        }

        stats.finalize(started.elapsed());
        info!("Pipeline {} for {}: {}", job.job_id, entity_type, stats.summary());
        Ok(JobResult {
            job_id: job.job_id.clone(),
            entity_type: entity_type.to_string(),
            stats,
            final_cursor: checkpoint.cursor,
            completed: true,
        })
    }

    async fn resume_point(&self, job: &MigrationJob, fingerprint: &str) -> Result<StepCheckpoint> {
        let entity_type = job.entity_type();
        let Some(mut checkpoint) = self.jobs.load_checkpoint(&job.job_id, entity_type).await? else {
            let checkpoint = StepCheckpoint::new(
                &job.job_id,
                entity_type,
                self.chain.version(),
                Some(fingerprint.to_string()),
            );
            self.jobs.save_checkpoint(&checkpoint).await?;
            return Ok(checkpoint);
        };

        let mut changes = Vec::new();
        if checkpoint.transform_version != self.chain.version() {
            changes.push(format!(
                "transform version {} -> {}",
                checkpoint.transform_version,
                self.chain.version()
            ));
        }
        if checkpoint
            .plan_fingerprint
            .as_deref()
            .is_some_and(|fp| fp != fingerprint)
        {
            changes.push("mapping or thresholds changed".to_string());
        }
        if !changes.is_empty() {
            let reason = changes.join(", ");
            if !job.force {
                return Err(MigrateError::PlanChanged(reason));
            }
            warn!("Resuming {} for {} despite plan change: {}", job.job_id, entity_type, reason);
            checkpoint.transform_version = self.chain.version().to_string();
            checkpoint.plan_fingerprint = Some(fingerprint.to_string());
            self.jobs.save_checkpoint(&checkpoint).await?;
        }
        Ok(checkpoint)
    }

    async fn process_record(
        &self,
        job: &MigrationJob,
        detector: &dyn ConflictDetector,
        row: &LegacyRecord,
        counts: &mut BatchCounts,
        stats: &mut PipelineStats,
    ) -> Result<()> {
        let entity_type = job.entity_type();
        counts.processed += 1;

        if let Some(existing) = self.jobs.get_outcome(entity_type, &row.legacy_id).await? {
            self.count_already_done(job, &existing, counts, stats);
            return Ok(());
        }

        let attempt_id = Uuid::new_v4().to_string();
        let outcome = match self.attempt(job, detector, row).await {
            Ok(outcome) => outcome.with_attempt(&attempt_id),
            Err(AttemptError::Abort(error)) => return Err(error),
            Err(AttemptError::Record { stage, error }) => {
                let attempts = self.bump_attempts(entity_type, &row.legacy_id).await;
                let settled = self.holder_settled(&error).await?;
                if error.is_transient() && !settled && attempts < self.config.max_record_attempts {
                    warn!(
                        "Transient failure for {}/{} at {} (attempt {}/{}): {}",
                        entity_type, row.legacy_id, stage, attempts, self.config.max_record_attempts, error
                    );
                    return Err(error);
                }
                self.failure_outcome(job, row, stage, &error, attempts, &attempt_id)
                    .await?
            }
        };

        match self.jobs.record_outcome(&outcome).await {
            Ok(()) => {
                debug!(
                    "{}/{} -> {}{}",
                    entity_type,
                    row.legacy_id,
                    outcome.status,
                    outcome.action.map(|a| format!(" ({})", a)).unwrap_or_default()
                );
                if outcome.status == RecordStatus::Loaded {
                    counts.loaded += 1;
                }
                stats.record(&outcome);
                self.attempts
                    .lock()
                    .await
                    .remove(&(entity_type.to_string(), row.legacy_id.clone()));
                Ok(())
            }
            Err(MigrateError::DuplicateOutcome { .. }) => {
                // Another worker finished the record first.
                match self.jobs.get_outcome(entity_type, &row.legacy_id).await? {
                    Some(existing) => self.count_already_done(job, &existing, counts, stats),
                    None => stats.record_already_done(),
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn count_already_done(
        &self,
        job: &MigrationJob,
        existing: &RecordOutcome,
        counts: &mut BatchCounts,
        stats: &mut PipelineStats,
    ) {
        if existing.job_id != job.job_id {
            counts.previously_recorded += 1;
        } else if existing.status == RecordStatus::Loaded {
            // Loaded by an earlier, aborted run of this batch.
            counts.loaded += 1;
        }
        stats.record_already_done();
        debug!(
            "{}/{} already {} by job {}",
            existing.entity_type, existing.legacy_id, existing.status, existing.job_id
        );
    }

    /// Whether a reservation conflict is held by a record that is already
    /// finished. Such a reservation is never released by the pipeline.
    async fn holder_settled(&self, error: &MigrateError) -> Result<bool> {
        let MigrateError::ReservationConflict { entity_type, holder, .. } = error else {
            return Ok(false);
        };
        Ok(self
            .jobs
            .get_outcome(entity_type, &holder.legacy_id)
            .await?
            .is_some())
    }

    async fn bump_attempts(&self, entity_type: &str, legacy_id: &str) -> u32 {
        let mut attempts = self.attempts.lock().await;
        let n = attempts
            .entry((entity_type.to_string(), legacy_id.to_string()))
            .or_insert(0);
        *n += 1;
        *n
    }

    /// Terminal outcome for a record that could not be loaded.
    async fn failure_outcome(
        &self,
        job: &MigrationJob,
        row: &LegacyRecord,
        stage: FailureStage,
        error: &MigrateError,
        attempts: u32,
        attempt_id: &str,
    ) -> Result<RecordOutcome> {
        let entity_type = job.entity_type();
        if let MigrateError::ReservationConflict { target_id, holder, .. } = error {
            warn!(
                "{}/{}: target {} reserved by {} (attempt {}), sending to manual review",
                entity_type, row.legacy_id, target_id, holder, attempts
            );
            return Ok(RecordOutcome::manual_review(
                &job.job_id,
                entity_type,
                &row.legacy_id,
                Some(target_id.as_str()),
                None,
                error.to_string(),
            )
            .with_attempt(attempt_id));
        }

        warn!(
            "Quarantining {}/{} at {} after {} attempt(s): {}",
            entity_type, row.legacy_id, stage, attempts, error
        );
        let outcome = RecordOutcome::quarantined(&job.job_id, entity_type, &row.legacy_id, stage, error)
            .with_attempt(attempt_id);
        if let Some(entry) = QuarantineEntry::from_outcome(&outcome, row.fields.clone(), attempts) {
            self.jobs.record_quarantine(&entry).await?;
        }
        Ok(outcome)
    }

    /// One pass over a record. Writes target state, snapshots and
    /// explanations, but not the outcome.
    async fn attempt(
        &self,
        job: &MigrationJob,
        detector: &dyn ConflictDetector,
        row: &LegacyRecord,
    ) -> std::result::Result<RecordOutcome, AttemptError> {
        let entity_type = job.entity_type();
        let ctx = TransformContext::new(entity_type, &job.locale);
        let record = self
            .chain
            .apply_record(row, &job.mapping, &ctx)
            .map_err(MigrateError::from)
            .at(FailureStage::Transform)?;

        let detection = DetectionContext {
            job_id: &job.job_id,
            entity_type,
            legacy_id: &row.legacy_id,
            record: &record,
        };
        let conflicts = detector
            .detect(&detection, self.lookup.as_ref())
            .await
            .at(FailureStage::Detect)?;
        let best = select_best(&conflicts);
        let decision = best
            .map(|c| job.thresholds.classify(c.score))
            .unwrap_or(Decision::Create);
        let owner = ReservationOwner::new(&job.job_id, &row.legacy_id);

        match (decision, best) {
            (Decision::Merge, Some(best)) => self.merge(job, row, record, best, &owner).await,
            (Decision::ManualReview, Some(best)) => {
                self.explain(job, row, best, decision).await?;
                Ok(RecordOutcome::manual_review(
                    &job.job_id,
                    entity_type,
                    &row.legacy_id,
                    Some(best.target_id.as_str()),
                    Some(best.score),
                    format!(
                        "score {:.2} is between manual_review {} and auto_merge {}",
                        best.score, job.thresholds.manual_review, job.thresholds.auto_merge
                    ),
                ))
            }
            _ => self.create(job, row, record, best.map(|c| c.score), &owner).await,
        }
    }

    async fn create(
        &self,
        job: &MigrationJob,
        row: &LegacyRecord,
        record: Record,
        score: Option<f64>,
        owner: &ReservationOwner,
    ) -> std::result::Result<RecordOutcome, AttemptError> {
        let entity_type = job.entity_type();
        let target_id = deterministic_target_id(entity_type, &row.legacy_id);
        self.target
            .reserve(entity_type, &target_id, owner)
            .await
            .at(FailureStage::Reserve)?;

        if self.prior_snapshot(job, row, &target_id).await?.is_none() {
            self.snapshot(job, row, &target_id, LoadAction::Create, None, record.clone())
                .await?;
        }

        let created = self
            .target
            .create(entity_type, &target_id, &record)
            .await
            .at(FailureStage::Load)?;
        if created == CreateOutcome::AlreadyExists {
            // The id is derived from the legacy id and reserved by `owner`, so
            // the record is this owner's own create from an earlier attempt.
            let existing = self.fetch_target(entity_type, &target_id).await?;
            if existing.fields != record {
                self.target
                    .update(entity_type, &target_id, &record)
                    .await
                    .at(FailureStage::Load)?;
            }
            debug!("{}/{}: replayed create of {}", entity_type, row.legacy_id, target_id);
        }
        Ok(RecordOutcome::loaded(
            &job.job_id,
            entity_type,
            &row.legacy_id,
            LoadAction::Create,
            &target_id,
            score,
        ))
    }

    async fn merge(
        &self,
        job: &MigrationJob,
        row: &LegacyRecord,
        record: Record,
        best: &Conflict,
        owner: &ReservationOwner,
    ) -> std::result::Result<RecordOutcome, AttemptError> {
        let entity_type = job.entity_type();
        let target_id = best.target_id.as_str();
        self.target
            .reserve(entity_type, target_id, owner)
            .await
            .at(FailureStage::Reserve)?;

        let existing = self.fetch_target(entity_type, target_id).await?;
        let mut merged = existing.fields.clone();
        for (field, value) in record {
            if !value.is_null() {
                merged.insert(field, value);
            }
        }

        if self.prior_snapshot(job, row, target_id).await?.is_none() {
            if merged == existing.fields {
                self.explain(job, row, best, Decision::Merge).await?;
                return Ok(RecordOutcome::skipped(
                    &job.job_id,
                    entity_type,
                    &row.legacy_id,
                    target_id,
                    Some(best.score),
                ));
            }
            self.snapshot(
                job,
                row,
                target_id,
                LoadAction::Merge,
                Some(existing.fields.clone()),
                merged.clone(),
            )
            .await?;
        }

        if merged != existing.fields {
            self.target
                .update(entity_type, target_id, &merged)
                .await
                .at(FailureStage::Load)?;
        }
        self.explain(job, row, best, Decision::Merge).await?;
        Ok(RecordOutcome::loaded(
            &job.job_id,
            entity_type,
            &row.legacy_id,
            LoadAction::Merge,
            target_id,
            Some(best.score),
        ))
    }

    /// Snapshot journaled for this record and target by an earlier attempt.
    async fn prior_snapshot(
        &self,
        job: &MigrationJob,
        row: &LegacyRecord,
        target_id: &str,
    ) -> std::result::Result<Option<Snapshot>, AttemptError> {
        Ok(self
            .jobs
            .find_snapshot(&job.job_id, job.entity_type(), &row.legacy_id, target_id)
            .await?)
    }

    async fn fetch_target(
        &self,
        entity_type: &str,
        target_id: &str,
    ) -> std::result::Result<TargetRecord, AttemptError> {
        self.target
            .get(entity_type, target_id)
            .await
            .at(FailureStage::Load)?
            .ok_or_else(|| MigrateError::load(entity_type, target_id, "target record not found", ErrorClass::Permanent))
            .at(FailureStage::Load)
    }

    async fn snapshot(
        &self,
        job: &MigrationJob,
        row: &LegacyRecord,
        target_id: &str,
        action: LoadAction,
        before: Option<Record>,
        after: Record,
    ) -> std::result::Result<u64, AttemptError> {
        let snapshot = Snapshot::new(
            &job.job_id,
            job.entity_type(),
            &row.legacy_id,
            target_id,
            action,
            before,
            after,
        );
        self.jobs
            .record_snapshot(snapshot)
            .await
            .at(FailureStage::Snapshot)
    }

    async fn explain(&self, job: &MigrationJob, row: &LegacyRecord, best: &Conflict, decision: Decision) -> Result<()> {
        let entry = MergeExplanationEntry {
            job_id: job.job_id.clone(),
            entity_type: job.entity_type().to_string(),
            legacy_id: row.legacy_id.clone(),
            target_id: best.target_id.clone(),
            score: best.score,
            decision,
            thresholds: job.thresholds,
            explanations: best.explanations.clone(),
            recorded_at: Utc::now(),
        };
        self.jobs.record_explanation(&entry).await
    }
}
