//! JSON file job store with HMAC integrity.
//!
//! The store is one JSON document, rewritten atomically (temp file then
//! rename) and signed with HMAC-SHA256 keyed by the configured state key.
//! Loading a document whose signature does not match fails; a document with
//! no signature is accepted with a warning.
//!
//! The document is only rewritten when a checkpoint or job record is saved.
//! Outcomes, quarantine entries and merge explanations recorded in between
//! live in memory until that rewrite; the pipeline replays the batch if the
//! process dies first. Snapshots must survive that window, so each one is
//! appended to a journal next to the document (`<name>.journal`), one signed
//! JSON line per snapshot, and folded into the document on the next rewrite.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{JobData, JobRecord, JobStore, StepCheckpoint};
use crate::error::{MigrateError, Result};
use crate::pipeline::outcome::{MergeExplanationEntry, QuarantineEntry, RecordOutcome, Snapshot};

type HmacSha256 = Hmac<Sha256>;

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    data: JobData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

const DOCUMENT_VERSION: u32 = 1;

impl StateDocument {
    fn compute_hmac(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;
        sign(key, &content)
    }
}

/// One journal line.
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    snapshot: Snapshot,
    hmac: String,
}

fn sign(key: &str, content: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl JournalEntry {
    fn signed(snapshot: Snapshot, key: &str) -> Result<Self> {
        let content = serde_json::to_string(&snapshot)
            .map_err(|e| MigrateError::State(format!("Failed to serialize snapshot: {}", e)))?;
        let hmac = sign(key, &content)?;
        Ok(Self { snapshot, hmac })
    }

    fn verify(&self, key: &str) -> Result<bool> {
        let content = serde_json::to_string(&self.snapshot)
            .map_err(|e| MigrateError::State(format!("Failed to serialize snapshot: {}", e)))?;
        Ok(sign(key, &content)? == self.hmac)
    }
}

/// Job store persisted to a signed JSON file and a snapshot journal.
pub struct FileJobStore {
    path: PathBuf,
    journal: PathBuf,
    key: String,
    data: Mutex<JobData>,
}

impl std::fmt::Debug for FileJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJobStore")
            .field("path", &self.path)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl FileJobStore {
    /// Open the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>, key: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let key = key.into();
        if key.is_empty() {
            return Err(MigrateError::Config("state HMAC key must not be empty".into()));
        }
        let journal = path.with_extension("journal");
        let mut data = if path.exists() {
            Self::load(&path, &key)?
        } else {
            debug!("No state file at {}, starting empty", path.display());
            JobData::default()
        };
        if journal.exists() {
            Self::replay_journal(&journal, &key, &mut data)?;
        }
        Ok(Self {
            path,
            journal,
            key,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path, key: &str) -> Result<JobData> {
        let content = std::fs::read_to_string(path)?;
        let doc: StateDocument = serde_json::from_str(&content)?;

        if let Some(stored) = &doc.hmac {
            let expected = doc.compute_hmac(key)?;
            if stored != &expected {
                return Err(MigrateError::State(format!(
                    "State file {} failed integrity check: HMAC mismatch",
                    path.display()
                )));
            }
        } else {
            warn!("State file {} has no HMAC signature, integrity cannot be verified", path.display());
        }
        if doc.version != DOCUMENT_VERSION {
            return Err(MigrateError::State(format!(
                "Unsupported state file version {} (expected {})",
                doc.version, DOCUMENT_VERSION
            )));
        }
        Ok(doc.data)
    }

    /// Apply journaled snapshots newer than the document. A torn final line
    /// (crash mid-append) is dropped; any other unreadable or unsigned line
    /// fails the load.
    fn replay_journal(journal: &Path, key: &str, data: &mut JobData) -> Result<()> {
        let content = std::fs::read_to_string(journal)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut replayed = 0;
        for (idx, line) in lines.iter().enumerate() {
            let entry: JournalEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) if idx + 1 == lines.len() => {
                    warn!("Dropping torn last line of journal {}: {}", journal.display(), e);
                    break;
                }
                Err(e) => {
                    return Err(MigrateError::State(format!(
                        "Journal {} line {} is unreadable: {}",
                        journal.display(),
                        idx + 1,
                        e
                    )))
                }
            };
            if !entry.verify(key)? {
                return Err(MigrateError::State(format!(
                    "Journal {} line {} failed integrity check: HMAC mismatch",
                    journal.display(),
                    idx + 1
                )));
            }
            if data.replay_snapshot(entry.snapshot) {
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!("Replayed {} snapshot(s) from {}", replayed, journal.display());
        }
        Ok(())
    }

    fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| MigrateError::State(format!("Failed to serialize journal entry: {}", e)))?;
        line.push('\n');
        if let Some(parent) = self.journal.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn persist(&self, data: &JobData) -> Result<()> {
        let mut doc = StateDocument {
            version: DOCUMENT_VERSION,
            data: data.clone(),
            hmac: None,
        };
        doc.hmac = Some(doc.compute_hmac(&self.key)?);

        let content = serde_json::to_string_pretty(&doc)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;

        // Every journaled snapshot is now in the document.
        match std::fs::remove_file(&self.journal) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a mutation and rewrite the document. The in-memory copy is only
    /// replaced once the file write succeeds.
    async fn mutate<T>(&self, f: impl FnOnce(&mut JobData) -> Result<T>) -> Result<T> {
        let mut guard = self.data.lock().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(value)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get_outcome(&self, entity_type: &str, legacy_id: &str) -> Result<Option<RecordOutcome>> {
        Ok(self.data.lock().await.get_outcome(entity_type, legacy_id))
    }

    async fn record_outcome(&self, outcome: &RecordOutcome) -> Result<()> {
        self.data.lock().await.record_outcome(outcome)
    }

    async fn outcomes(&self, job_id: &str) -> Result<Vec<RecordOutcome>> {
        Ok(self.data.lock().await.outcomes(job_id))
    }

    async fn load_checkpoint(&self, job_id: &str, entity_type: &str) -> Result<Option<StepCheckpoint>> {
        Ok(self.data.lock().await.load_checkpoint(job_id, entity_type))
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<()> {
        self.mutate(|d| {
            d.save_checkpoint(checkpoint);
            Ok(())
        })
        .await
    }

    async fn checkpoints(&self, job_id: &str) -> Result<Vec<StepCheckpoint>> {
        Ok(self.data.lock().await.checkpoints(job_id))
    }

    async fn record_snapshot(&self, mut snapshot: Snapshot) -> Result<u64> {
        let mut data = self.data.lock().await;
        let seq = data.next_snapshot_seq();
        snapshot.seq = seq;
        let entry = JournalEntry::signed(snapshot, &self.key)?;
        self.append_journal(&entry)?;
        data.replay_snapshot(entry.snapshot);
        Ok(seq)
    }

    async fn snapshots(&self, job_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self.data.lock().await.snapshots(job_id))
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
            .lock()
            .await
            .find_snapshot(job_id, entity_type, legacy_id, target_id))
    }

    async fn record_quarantine(&self, entry: &QuarantineEntry) -> Result<()> {
        self.data.lock().await.record_quarantine(entry);
        Ok(())
    }

    async fn quarantine(&self, job_id: &str) -> Result<Vec<QuarantineEntry>> {
        Ok(self.data.lock().await.quarantine(job_id))
    }

    async fn record_explanation(&self, entry: &MergeExplanationEntry) -> Result<()> {
        self.data.lock().await.record_explanation(entry);
        Ok(())
    }

    async fn explanations(&self, job_id: &str) -> Result<Vec<MergeExplanationEntry>> {
        Ok(self.data.lock().await.explanations(job_id))
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        self.mutate(|d| {
            d.save_job(job);
            Ok(())
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.data.lock().await.get_job(job_id))
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.data.lock().await.list_jobs())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cursor::Cursor;
    use crate::pipeline::outcome::LoadAction;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileJobStore::open(&path, "secret").unwrap();
            let outcome = RecordOutcome::loaded("j1", "contacts", "L1", LoadAction::Create, "t1", None);
            store.record_outcome(&outcome).await.unwrap();
            let mut cp = StepCheckpoint::new("j1", "contacts", "std-v3", None);
            cp.advance(Cursor::LastId { id: "L9".into() }, 9, 9, 0);
            store.save_checkpoint(&cp).await.unwrap();
        }
        let store = FileJobStore::open(&path, "secret").unwrap();
        let cp = store.load_checkpoint("j1", "contacts").await.unwrap().unwrap();
        assert_eq!(cp.cursor, Cursor::LastId { id: "L9".into() });
        assert!(store.get_outcome("contacts", "L1").await.unwrap().is_some());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_tampered_state_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileJobStore::open(&path, "secret").unwrap();
        store
            .save_checkpoint(&StepCheckpoint::new("j1", "contacts", "std-v3", None))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("contacts", "invoices")).unwrap();

        let err = FileJobStore::open(&path, "secret").unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileJobStore::open(&path, "secret").unwrap();
        store
            .save_checkpoint(&StepCheckpoint::new("j1", "contacts", "std-v3", None))
            .await
            .unwrap();
        assert!(FileJobStore::open(&path, "other").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_outcome_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileJobStore::open(&path, "secret").unwrap();
        let outcome = RecordOutcome::loaded("j1", "contacts", "L1", LoadAction::Create, "t1", None);
        store.record_outcome(&outcome).await.unwrap();
        let dup = RecordOutcome::skipped("j2", "contacts", "L1", "t1", None);
        assert!(store.record_outcome(&dup).await.is_err());
        assert!(store.outcomes("j2").await.unwrap().is_empty());
    }

    fn snapshot(legacy_id: &str) -> Snapshot {
        let mut after = crate::core::value::Record::new();
        after.insert("name".into(), crate::core::value::FieldValue::from("Ann Lee"));
        Snapshot::new("j1", "contacts", legacy_id, "t1", LoadAction::Create, None, after)
    }

    #[tokio::test]
    async fn test_batch_writes_deferred_until_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileJobStore::open(&path, "secret").unwrap();
            store
                .save_checkpoint(&StepCheckpoint::new("j1", "contacts", "std-v3", None))
                .await
                .unwrap();
            let before = std::fs::read_to_string(&path).unwrap();

            assert_eq!(store.record_snapshot(snapshot("L1")).await.unwrap(), 1);
            let outcome = RecordOutcome::loaded("j1", "contacts", "L1", LoadAction::Create, "t1", None);
            store.record_outcome(&outcome).await.unwrap();

            // Only the journal grew; the document is untouched mid-batch.
            assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
            assert!(path.with_extension("journal").exists());
            assert!(store.get_outcome("contacts", "L1").await.unwrap().is_some());
        }
        // Dropped without a checkpoint: the snapshot survives, the outcome does not.
        let store = FileJobStore::open(&path, "secret").unwrap();
        assert_eq!(store.snapshots("j1").await.unwrap().len(), 1);
        assert!(store.get_outcome("contacts", "L1").await.unwrap().is_none());
        assert_eq!(store.record_snapshot(snapshot("L2")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_folds_journal_into_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileJobStore::open(&path, "secret").unwrap();
            store.record_snapshot(snapshot("L1")).await.unwrap();
            store.record_snapshot(snapshot("L2")).await.unwrap();
            store
                .save_checkpoint(&StepCheckpoint::new("j1", "contacts", "std-v3", None))
                .await
                .unwrap();
            assert!(!path.with_extension("journal").exists());
        }
        let store = FileJobStore::open(&path, "secret").unwrap();
        let seqs: Vec<u64> = store.snapshots("j1").await.unwrap().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_tampered_journal_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileJobStore::open(&path, "secret").unwrap();
        store.record_snapshot(snapshot("L1")).await.unwrap();
        store.record_snapshot(snapshot("L2")).await.unwrap();
        drop(store);

        let journal = path.with_extension("journal");
        let content = std::fs::read_to_string(&journal).unwrap();
        std::fs::write(&journal, content.replacen("Ann Lee", "Eve", 1)).unwrap();

        let err = FileJobStore::open(&path, "secret").unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[tokio::test]
    async fn test_torn_journal_tail_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileJobStore::open(&path, "secret").unwrap();
        store.record_snapshot(snapshot("L1")).await.unwrap();
        drop(store);

        let journal = path.with_extension("journal");
        let mut content = std::fs::read_to_string(&journal).unwrap();
        content.push_str("{\"snapshot\":{\"seq\":2,");
        std::fs::write(&journal, content).unwrap();

        let store = FileJobStore::open(&path, "secret").unwrap();
        assert_eq!(store.snapshots("j1").await.unwrap().len(), 1);
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(FileJobStore::open(dir.path().join("s.json"), "").is_err());
    }
}
