//! Pipeline options and run statistics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::outcome::{LoadAction, RecordOutcome, RecordStatus};

/// Tunables for a pipeline run that are not part of the job definition.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per page fetch.
    pub batch_size: usize,

    /// Attempts per record before a transient failure is quarantined.
    pub max_record_attempts: u32,

    /// Legacy rows sampled for preflight checks.
    pub sample_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_record_attempts: 3,
            sample_size: 200,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_record_attempts(mut self, attempts: u32) -> Self {
        self.max_record_attempts = attempts.max(1);
        self
    }

    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size.max(1);
        self
    }

    /// Scale the batch size with available memory.
    ///
    /// Assumes roughly 2KB per in-flight record and targets 1% of memory.
    pub fn auto_tune(mut self, available_memory_mb: usize) -> Self {
        let rows = available_memory_mb * 1024 / 2 / 100;
        self.batch_size = rows.clamp(100, 5_000);
        self
    }
}

/// Counts and throughput for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Rows walked in this run, including already-done rows.
    pub processed: u64,
    pub created: u64,
    pub merged: u64,
    pub updated: u64,
    pub skipped: u64,
    pub manual_review: u64,
    pub quarantined: u64,
    /// Rows skipped because an outcome already existed.
    pub already_done: u64,
    /// Batches committed in this run.
    pub batches: u64,
    pub elapsed_secs: f64,
    pub records_per_second: f64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows written to the target.
    pub fn loaded(&self) -> u64 {
        self.created + self.merged + self.updated
    }

    /// Count a freshly recorded outcome.
    pub fn record(&mut self, outcome: &RecordOutcome) {
        self.processed += 1;
        match outcome.status {
            RecordStatus::Loaded => match outcome.action {
                Some(LoadAction::Create) => self.created += 1,
                Some(LoadAction::Merge) => self.merged += 1,
                Some(LoadAction::Update) => self.updated += 1,
                Some(LoadAction::Skip) | None => self.skipped += 1,
            },
            RecordStatus::Skipped => self.skipped += 1,
            RecordStatus::ManualReview => self.manual_review += 1,
            RecordStatus::Quarantined => self.quarantined += 1,
        }
    }

    /// Count a row whose outcome was recorded earlier.
    pub fn record_already_done(&mut self) {
        self.processed += 1;
        self.already_done += 1;
    }

    /// Add another run's counts (timings are recomputed by `finalize`).
    pub fn merge(&mut self, other: &PipelineStats) {
        self.processed += other.processed;
        self.created += other.created;
        self.merged += other.merged;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.manual_review += other.manual_review;
        self.quarantined += other.quarantined;
        self.already_done += other.already_done;
        self.batches += other.batches;
    }

    pub fn finalize(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
        if self.elapsed_secs > 0.0 {
            self.records_per_second = self.processed as f64 / self.elapsed_secs;
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Processed {} records in {:.1}s ({:.0} records/sec): {} created, {} merged, {} updated, {} skipped, {} manual review, {} quarantined, {} already done.",
            self.processed,
            self.elapsed_secs,
            self.records_per_second,
            self.created,
            self.merged,
            self.updated,
            self.skipped,
            self.manual_review,
            self.quarantined,
            self.already_done
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureStage, MigrateError};

    #[test]
    fn test_record_counts_by_action() {
        let mut stats = PipelineStats::new();
        stats.record(&RecordOutcome::loaded("j", "contacts", "1", LoadAction::Create, "t1", None));
        stats.record(&RecordOutcome::loaded("j", "contacts", "2", LoadAction::Merge, "t2", Some(95.0)));
        stats.record(&RecordOutcome::skipped("j", "contacts", "3", "t2", Some(99.0)));
        let err = MigrateError::transform("email", "normalize_email", "bad");
        stats.record(&RecordOutcome::quarantined("j", "contacts", "4", FailureStage::Transform, &err));
        stats.record_already_done();

        assert_eq!(stats.processed, 5);
        assert_eq!(stats.loaded(), 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.already_done, 1);
    }

    #[test]
    fn test_finalize_and_summary() {
        let mut stats = PipelineStats::new();
        stats.processed = 100;
        stats.finalize(Duration::from_secs(4));
        assert_eq!(stats.records_per_second, 25.0);
        assert!(stats.summary().contains("Processed 100 records"));
    }

    #[test]
    fn test_auto_tune_clamps() {
        assert_eq!(PipelineConfig::new().auto_tune(1).batch_size, 100);
        assert_eq!(PipelineConfig::new().auto_tune(1_000_000).batch_size, 5_000);
    }
}
