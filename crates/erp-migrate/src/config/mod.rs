//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use crate::pipeline::{MigrationJob, PipelineConfig};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Pipeline tunables from the migration section.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_batch_size(self.migration.get_batch_size())
            .with_max_record_attempts(self.migration.max_record_attempts)
            .with_sample_size(self.migration.sample_size)
    }

    /// Fresh run identifier.
    pub fn new_run_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("run-{}", &id[..8])
    }

    /// Build the jobs for a run: one per configured entity type, or only
    /// `entity_type` when given. Job ids are `<run_id>-<entity_type>`.
    pub fn jobs(&self, run_id: &str, entity_type: Option<&str>, force: bool) -> Result<Vec<MigrationJob>> {
        let mappings: Vec<_> = match entity_type {
            Some(name) => vec![self.entity(name).ok_or_else(|| {
                crate::error::MigrateError::Config(format!(
                    "entity type '{}' is not configured",
                    name
                ))
            })?],
            None => self.entities.iter().collect(),
        };
        Ok(mappings
            .into_iter()
            .map(|mapping| {
                MigrationJob::new(format!("{}-{}", run_id, mapping.entity_type), mapping.clone())
                    .with_thresholds(self.migration.thresholds)
                    .with_locale(self.migration.locale.clone())
                    .with_force(force)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  path: legacy.json
target:
  path: target.json
state:
  path: state.json
  hmac_key: state-secret
migration:
  batch_size: 100
  thresholds:
    auto_merge: 85
    manual_review: 55
audit:
  signing_key: audit-secret
  key_id: k1
entities:
  - entity_type: contacts
    table: legacy_contacts
    fields:
      - source: email_addr
        target: email
        data_type: email
  - entity_type: products
    table: legacy_items
"#;

    #[test]
    fn test_load_and_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.migration.get_batch_size(), 100);
        assert_eq!(config.migration.max_record_attempts, 3);
        assert_eq!(config.migration.locale, "en-US");
        assert_eq!(config.migration.retry.max_attempts, 5);
        assert_eq!(config.pipeline_config().batch_size, 100);
    }

    #[test]
    fn test_jobs_per_entity() {
        let config = Config::from_yaml(YAML).unwrap();
        let jobs = config.jobs("run1", None, false).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "run1-contacts");
        assert_eq!(jobs[0].thresholds.auto_merge, 85.0);

        let only = config.jobs("run1", Some("products"), true).unwrap();
        assert_eq!(only.len(), 1);
        assert!(only[0].force);
        assert!(config.jobs("run1", Some("widgets"), false).is_err());
    }

    #[test]
    fn test_new_run_ids_differ() {
        let a = Config::new_run_id();
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, Config::new_run_id());
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_yaml(YAML).unwrap();
        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("state-secret"));
        assert!(!debug_output.contains("audit-secret"));
    }
}
