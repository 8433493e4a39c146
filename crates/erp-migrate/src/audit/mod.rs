//! Audit reports.
//!
//! An [`AuditReport`] captures what happened to every record of a job, the
//! thresholds and transform version that decided it, and the gate results.
//! Its canonical encoding (see [`canonical`]) is byte-identical for the same
//! persisted job state, so reports can be signed, verified and diffed.

pub mod canonical;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::detect::ConflictThresholds;
use crate::error::{MigrateError, Result};
use crate::gates::ReadinessReport;
use crate::pipeline::outcome::RecordOutcome;
use crate::state::{JobStatus, JobStore};

type HmacSha256 = Hmac<Sha256>;

/// Report format version.
pub const AUDIT_FORMAT_VERSION: u32 = 1;

/// Canonical body of a job's audit report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub format_version: u32,
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
    /// Outcome count per status.
    pub totals: BTreeMap<String, u64>,
    /// Outcomes ordered by legacy id.
    pub outcomes: Vec<RecordOutcome>,
}

impl AuditReport {
    /// Build the report for `job_id` from persisted state.
    pub async fn build(jobs: &dyn JobStore, job_id: &str) -> Result<Self> {
        let job = jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| MigrateError::State(format!("job '{}' not found", job_id)))?;

        let mut outcomes = jobs.outcomes(job_id).await?;
        outcomes.sort_by(|a, b| {
            (a.entity_type.as_str(), a.legacy_id.as_str())
                .cmp(&(b.entity_type.as_str(), b.legacy_id.as_str()))
        });

        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for outcome in &outcomes {
            *totals.entry(outcome.status.as_str().to_string()).or_default() += 1;
        }

        debug!("Built audit report for {}: {} outcomes", job_id, outcomes.len());
        Ok(Self {
            format_version: AUDIT_FORMAT_VERSION,
            job_id: job.job_id,
            entity_type: job.entity_type,
            status: job.status,
            thresholds: job.thresholds,
            transform_version: job.transform_version,
            plan_fingerprint: job.plan_fingerprint,
            preflight: job.preflight,
            postflight: job.postflight,
            totals,
            outcomes,
        })
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::to_canonical_bytes(self)
    }

    /// SHA-256 of the canonical bytes, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Wrap the report with its digest and, when a key is given, an
    /// HMAC-SHA256 signature over the canonical bytes.
    pub fn sign(self, key: Option<&str>, key_id: &str) -> Result<SignedAuditReport> {
        let digest = self.digest()?;
        let (signature, key_id) = match key {
            Some(key) => (
                Some(hmac_hex(key, &self.canonical_bytes()?)?),
                Some(key_id.to_string()),
            ),
            None => (None, None),
        };
        Ok(SignedAuditReport {
            report: self,
            digest,
            signature,
            key_id,
            generated_at: Utc::now(),
        })
    }
}

fn new_mac(key: &str) -> Result<HmacSha256> {
    if key.is_empty() {
        return Err(MigrateError::Signature("signing key is empty".into()));
    }
    HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| MigrateError::Signature(format!("invalid signing key: {}", e)))
}

fn hmac_hex(key: &str, bytes: &[u8]) -> Result<String> {
    let mut mac = new_mac(key)?;
    mac.update(bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// A report with its integrity data. `generated_at` is not covered by the
/// digest or signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedAuditReport {
    pub report: AuditReport,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl SignedAuditReport {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Check the digest, and the signature when `key` is given.
    pub fn verify(&self, key: Option<&str>) -> Result<()> {
        let digest = self.report.digest()?;
        if digest != self.digest {
            return Err(MigrateError::Signature(format!(
                "digest mismatch for job '{}': report was modified",
                self.report.job_id
            )));
        }
        let Some(key) = key else {
            return Ok(());
        };
        let signature = self.signature.as_deref().ok_or_else(|| {
            MigrateError::Signature(format!("report for job '{}' is not signed", self.report.job_id))
        })?;
        let expected = hex::decode(signature)
            .map_err(|e| MigrateError::Signature(format!("malformed signature: {}", e)))?;
        let mut mac = new_mac(key)?;
        mac.update(&self.report.canonical_bytes()?);
        mac.verify_slice(&expected).map_err(|_| {
            MigrateError::Signature(format!(
                "signature mismatch for job '{}'",
                self.report.job_id
            ))
        })?;
        info!("Audit report for {} verified", self.report.job_id);
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::ReadinessCheckResult;
    use crate::pipeline::outcome::LoadAction;
    use crate::state::{JobRecord, MemoryJobStore};

    async fn store() -> MemoryJobStore {
        let jobs = MemoryJobStore::new();
        let mut record = JobRecord::new("job-1", "contacts", ConflictThresholds::default(), "v1");
        record.preflight = Some(ReadinessReport::from_checks(vec![ReadinessCheckResult::pass(
            "mapping_completeness",
            "all columns mapped",
        )]));
        record.mark_finished(JobStatus::Completed);
        jobs.save_job(&record).await.unwrap();

        // written out of order on purpose
        jobs.record_outcome(&RecordOutcome::loaded(
            "job-1", "contacts", "2", LoadAction::Merge, "t-9", Some(72.0),
        ))
        .await
        .unwrap();
        jobs.record_outcome(&RecordOutcome::loaded(
            "job-1", "contacts", "1", LoadAction::Create, "t-1", None,
        ))
        .await
        .unwrap();
        jobs
    }

    #[tokio::test]
    async fn test_same_state_same_bytes() {
        let jobs = store().await;
        let a = AuditReport::build(&jobs, "job-1").await.unwrap();
        let b = AuditReport::build(&jobs, "job-1").await.unwrap();
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
        assert_eq!(a.outcomes[0].legacy_id, "1");
        assert_eq!(a.totals.get("loaded"), Some(&2));

        let text = String::from_utf8(a.canonical_bytes().unwrap()).unwrap();
        assert!(text.contains(r#""auto_merge":90"#));
        assert!(text.contains(r#""score":72"#));
        assert!(!text.contains(' '));
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let jobs = store().await;
        let report = AuditReport::build(&jobs, "job-1").await.unwrap();
        let signed = report.sign(Some("audit-key"), "k1").unwrap();
        assert!(signed.is_signed());
        assert_eq!(signed.key_id.as_deref(), Some("k1"));
        signed.verify(Some("audit-key")).unwrap();
        signed.verify(None).unwrap();

        let err = signed.verify(Some("other-key")).unwrap_err();
        assert!(err.to_string().contains("signature mismatch"));

        let mut tampered = signed.clone();
        tampered.report.thresholds.auto_merge = 50.0;
        let err = tampered.verify(Some("audit-key")).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_generated_at_not_signed() {
        let jobs = store().await;
        let report = AuditReport::build(&jobs, "job-1").await.unwrap();
        let mut signed = report.sign(Some("audit-key"), "k1").unwrap();
        signed.generated_at = signed.generated_at + chrono::Duration::days(1);
        signed.verify(Some("audit-key")).unwrap();
    }

    #[tokio::test]
    async fn test_unsigned_report_fails_keyed_verify() {
        let jobs = store().await;
        let signed = AuditReport::build(&jobs, "job-1")
            .await
            .unwrap()
            .sign(None, "k1")
            .unwrap();
        assert!(!signed.is_signed());
        signed.verify(None).unwrap();
        assert!(signed.verify(Some("audit-key")).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        let jobs = store().await;
        let signed = AuditReport::build(&jobs, "job-1")
            .await
            .unwrap()
            .sign(Some("audit-key"), "k1")
            .unwrap();
        signed.save(&path).unwrap();
        let loaded = SignedAuditReport::load(&path).unwrap();
        loaded.verify(Some("audit-key")).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let jobs = MemoryJobStore::new();
        assert!(AuditReport::build(&jobs, "nope").await.is_err());
    }
}
