//! Rollback engine.
//!
//! Undoes a job by replaying its snapshots newest-first through a
//! [`TargetMutator`]: records the job updated or merged get their `before`
//! fields back, records it created are deleted. A failure on one record is
//! itemized in the [`RollbackResult`] and the replay continues.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::traits::{Mutation, TargetMutator};
use crate::error::{MigrateError, Result};
use crate::pipeline::outcome::Snapshot;
use crate::state::{JobStatus, JobStore};

/// A snapshot that was reverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertedItem {
    pub seq: u64,
    pub entity_type: String,
    pub legacy_id: String,
    pub target_id: String,
    /// `restore` or `delete`.
    pub mutation: String,
}

/// A snapshot whose inverse mutation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub seq: u64,
    pub entity_type: String,
    pub legacy_id: String,
    pub target_id: String,
    pub error: String,
}

/// Result of rolling back one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub job_id: String,
    pub reverted: Vec<RevertedItem>,
    pub failed: Vec<RollbackFailure>,
}

impl RollbackResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Inverse of a snapshot's write.
fn inverse(snapshot: &Snapshot) -> Mutation {
    match &snapshot.before {
        Some(before) => Mutation::Restore {
            entity_type: snapshot.entity_type.clone(),
            id: snapshot.target_id.clone(),
            fields: before.clone(),
        },
        None => Mutation::Delete {
            entity_type: snapshot.entity_type.clone(),
            id: snapshot.target_id.clone(),
        },
    }
}

fn mutation_kind(mutation: &Mutation) -> &'static str {
    match mutation {
        Mutation::Restore { .. } => "restore",
        Mutation::Delete { .. } => "delete",
    }
}

pub struct RollbackEngine {
    jobs: Arc<dyn JobStore>,
    mutator: Arc<dyn TargetMutator>,
}

impl RollbackEngine {
    pub fn new(jobs: Arc<dyn JobStore>, mutator: Arc<dyn TargetMutator>) -> Self {
        Self { jobs, mutator }
    }

    /// Undo every recorded write of `job_id`.
    ///
    /// A job already marked `rolled_back` is refused; replaying its
    /// snapshots again would clobber writes made after the rollback.
    pub async fn rollback(&self, job_id: &str) -> Result<RollbackResult> {
        let mut record = self.jobs.get_job(job_id).await?;
        if let Some(job) = &record {
            if job.status == JobStatus::RolledBack {
                return Err(MigrateError::State(format!(
                    "job '{}' is already rolled back",
                    job_id
                )));
            }
            if job.status == JobStatus::Running {
                warn!("Rolling back job {} while it is marked running", job_id);
            }
        }

        let mut snapshots = self.jobs.snapshots(job_id).await?;
        snapshots.sort_by(|a, b| b.seq.cmp(&a.seq));
        info!("Rolling back job {}: {} snapshots", job_id, snapshots.len());

        let mut result = RollbackResult {
            job_id: job_id.to_string(),
            ..Default::default()
        };
        for snapshot in &snapshots {
            let mutation = inverse(snapshot);
            match self.mutator.mutate(&mutation).await {
                Ok(()) => result.reverted.push(RevertedItem {
                    seq: snapshot.seq,
                    entity_type: snapshot.entity_type.clone(),
                    legacy_id: snapshot.legacy_id.clone(),
                    target_id: snapshot.target_id.clone(),
                    mutation: mutation_kind(&mutation).to_string(),
                }),
                Err(e) => {
                    error!(
                        "Failed to revert {}/{} (snapshot {}): {}",
                        snapshot.entity_type, snapshot.target_id, snapshot.seq, e
                    );
                    result.failed.push(RollbackFailure {
                        seq: snapshot.seq,
                        entity_type: snapshot.entity_type.clone(),
                        legacy_id: snapshot.legacy_id.clone(),
                        target_id: snapshot.target_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(job) = record.as_mut() {
            if result.is_complete() {
                job.mark_finished(JobStatus::RolledBack);
                self.jobs.save_job(job).await?;
            }
        }

        info!(
            "Rollback of {} finished: {} reverted, {} failed",
            job_id,
            result.reverted.len(),
            result.failed.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryTargetStore;
    use crate::core::traits::TargetStore;
    use crate::core::value::{FieldValue, Record};
    use crate::detect::ConflictThresholds;
    use crate::error::ErrorClass;
    use crate::pipeline::outcome::LoadAction;
    use crate::state::{JobRecord, MemoryJobStore};
    use async_trait::async_trait;
    use chrono::Utc;

    fn fields(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    async fn seeded() -> (Arc<MemoryTargetStore>, Arc<MemoryJobStore>) {
        let target = Arc::new(MemoryTargetStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let original = fields(&[("name", "Jon Smith")]);
        target
            .seed("contacts", "t-1", original.clone(), Utc::now())
            .await
            .unwrap();

        // job-1 merged into t-1, then created t-2
        let merged = fields(&[("name", "Jon Smith"), ("phone", "+15551234567")]);
        target.update("contacts", "t-1", &merged).await.unwrap();
        jobs.record_snapshot(Snapshot::new(
            "job-1", "contacts", "1", "t-1", LoadAction::Merge, Some(original), merged,
        ))
        .await
        .unwrap();

        let created = fields(&[("name", "Ann Lee")]);
        target
            .seed("contacts", "t-2", created.clone(), Utc::now())
            .await
            .unwrap();
        jobs.record_snapshot(Snapshot::new(
            "job-1", "contacts", "2", "t-2", LoadAction::Create, None, created,
        ))
        .await
        .unwrap();

        let mut record = JobRecord::new("job-1", "contacts", ConflictThresholds::default(), "v1");
        record.mark_finished(JobStatus::Completed);
        jobs.save_job(&record).await.unwrap();
        (target, jobs)
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_job_state() {
        let (target, jobs) = seeded().await;
        let engine = RollbackEngine::new(jobs.clone(), target.clone());
        let result = engine.rollback("job-1").await.unwrap();

        assert!(result.is_complete());
        assert_eq!(result.reverted.len(), 2);
        // newest first
        assert_eq!(result.reverted[0].target_id, "t-2");
        assert_eq!(result.reverted[0].mutation, "delete");
        assert_eq!(result.reverted[1].mutation, "restore");

        let records = target.records("contacts").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields, fields(&[("name", "Jon Smith")]));

        let job = jobs.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::RolledBack);
        assert!(engine.rollback("job-1").await.is_err());
    }

    struct FailingOn {
        inner: Arc<MemoryTargetStore>,
        id: &'static str,
    }

    #[async_trait]
    impl TargetMutator for FailingOn {
        async fn mutate(&self, mutation: &Mutation) -> Result<()> {
            if mutation.target_id() == self.id {
                return Err(MigrateError::Load {
                    entity_type: "contacts".into(),
                    target_id: self.id.into(),
                    message: "locked".into(),
                    class: ErrorClass::Transient,
                });
            }
            self.inner.mutate(mutation).await
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_rollback() {
        let (target, jobs) = seeded().await;
        let mutator = Arc::new(FailingOn {
            inner: target.clone(),
            id: "t-2",
        });
        let result = RollbackEngine::new(jobs.clone(), mutator)
            .rollback("job-1")
            .await
            .unwrap();

        assert!(!result.is_complete());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].target_id, "t-2");
        assert!(result.failed[0].error.contains("locked"));
        assert_eq!(result.reverted.len(), 1);
        assert_eq!(result.reverted[0].target_id, "t-1");

        let job = jobs.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_rollback_of_unknown_job_is_empty() {
        let engine = RollbackEngine::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryTargetStore::new()),
        );
        let result = engine.rollback("nope").await.unwrap();
        assert!(result.reverted.is_empty() && result.failed.is_empty());
    }
}
