//! In-memory job store.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{JobData, JobRecord, JobStore, StepCheckpoint};
use crate::error::Result;
use crate::pipeline::outcome::{MergeExplanationEntry, QuarantineEntry, RecordOutcome, Snapshot};

/// Job store held in process memory. Lost on exit.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    data: RwLock<JobData>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_outcome(&self, entity_type: &str, legacy_id: &str) -> Result<Option<RecordOutcome>> {
        Ok(self.data.read().await.get_outcome(entity_type, legacy_id))
    }

    async fn record_outcome(&self, outcome: &RecordOutcome) -> Result<()> {
        self.data.write().await.record_outcome(outcome)
    }

    async fn outcomes(&self, job_id: &str) -> Result<Vec<RecordOutcome>> {
        Ok(self.data.read().await.outcomes(job_id))
    }

    async fn load_checkpoint(&self, job_id: &str, entity_type: &str) -> Result<Option<StepCheckpoint>> {
        Ok(self.data.read().await.load_checkpoint(job_id, entity_type))
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<()> {
        self.data.write().await.save_checkpoint(checkpoint);
        Ok(())
    }

    async fn checkpoints(&self, job_id: &str) -> Result<Vec<StepCheckpoint>> {
        Ok(self.data.read().await.checkpoints(job_id))
    }

    async fn record_snapshot(&self, snapshot: Snapshot) -> Result<u64> {
        Ok(self.data.write().await.record_snapshot(snapshot))
    }

    async fn snapshots(&self, job_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self.data.read().await.snapshots(job_id))
    }

    async fn find_snapshot(
        &self,
        job_id: &str,
        entity_type: &str,
        legacy_id: &str,
        target_id: &str,
    ) -> Result<Option<Snapshot>> {
        Ok(self
            .data
            .read()
            .await
            .find_snapshot(job_id, entity_type, legacy_id, target_id))
    }

    async fn record_quarantine(&self, entry: &QuarantineEntry) -> Result<()> {
        self.data.write().await.record_quarantine(entry);
        Ok(())
    }

    async fn quarantine(&self, job_id: &str) -> Result<Vec<QuarantineEntry>> {
        Ok(self.data.read().await.quarantine(job_id))
    }

    async fn record_explanation(&self, entry: &MergeExplanationEntry) -> Result<()> {
        self.data.write().await.record_explanation(entry);
        Ok(())
    }

    async fn explanations(&self, job_id: &str) -> Result<Vec<MergeExplanationEntry>> {
        Ok(self.data.read().await.explanations(job_id))
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        self.data.write().await.save_job(job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.data.read().await.get_job(job_id))
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.data.read().await.list_jobs())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;
    use crate::pipeline::outcome::LoadAction;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_outcome_writes_keep_first() {
        let store = Arc::new(MemoryJobStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let outcome = RecordOutcome::loaded(
                    &format!("j{}", i),
                    "contacts",
                    "L1",
                    LoadAction::Create,
                    "t1",
                    None,
                );
                store.record_outcome(&outcome).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(MigrateError::DuplicateOutcome { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert!(store.get_outcome("contacts", "L1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let store = MemoryJobStore::new();
        assert!(store.load_checkpoint("j1", "contacts").await.unwrap().is_none());
        let cp = StepCheckpoint::new("j1", "contacts", "std-v3", None);
        store.save_checkpoint(&cp).await.unwrap();
        assert_eq!(store.load_checkpoint("j1", "contacts").await.unwrap(), Some(cp));
        assert_eq!(store.backend_type(), "memory");
    }
}
