//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

use crate::core::schema::EntityMapping;
use crate::detect::ConflictThresholds;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }

    pub fn available_memory_mb(&self) -> usize {
        (self.total_memory_bytes / (1024 * 1024)) as usize
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy source (JSON fixture for the bundled connector).
    pub source: SourceConfig,

    /// Target store.
    pub target: TargetConfig,

    /// Job persistence.
    pub state: StateConfig,

    /// Migration behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Audit report signing.
    #[serde(default)]
    pub audit: AuditConfig,

    /// One mapping per entity type to migrate.
    #[serde(default)]
    pub entities: Vec<EntityMapping>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }

    /// Mapping for an entity type.
    pub fn entity(&self, entity_type: &str) -> Option<&EntityMapping> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}

/// Legacy source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Fixture file with legacy tables.
    pub path: PathBuf,
}

/// Target store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// File the target store is persisted to.
    pub path: PathBuf,
}

/// Job persistence configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// State file.
    pub path: PathBuf,

    /// HMAC key protecting the state file.
    pub hmac_key: String,
}

impl fmt::Debug for StateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateConfig")
            .field("path", &self.path)
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// Audit signing configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// HMAC key for signing audit reports. Reports are unsigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    /// Identifier of the signing key, recorded in the report.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfig")
            .field(
                "signing_key",
                &self.signing_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Retry policy for transient job failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Runs per job before giving up (default: 5).
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds (default: 200).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds (default: 10000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Migration behavior configuration.
/// Performance fields use Option<T> to distinguish "not set" (auto-tuned)
/// from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per page. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Jobs run concurrently by the worker. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,

    /// Page fetches per second across all jobs. Unlimited if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_per_second: Option<u64>,

    /// Attempts per record before a transient failure is quarantined (default: 3).
    #[serde(default = "default_record_attempts")]
    pub max_record_attempts: u32,

    /// Job-level retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Match thresholds.
    #[serde(default)]
    pub thresholds: ConflictThresholds,

    /// Locale for transforms (default: en-US).
    #[serde(default = "default_locale")]
    pub locale: String,

    /// Legacy rows sampled by preflight (default: 200).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Maximum null rate of a match key in the sample (default: 0.5).
    #[serde(default = "default_max_null_rate")]
    pub max_null_rate: f64,

    /// Maximum transform error rate in the sample (default: 0.05).
    #[serde(default = "default_max_transform_error_rate")]
    pub max_transform_error_rate: f64,

    /// Preflight gates allowed to fail without blocking.
    #[serde(default)]
    pub preflight_overrides: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_concurrent_jobs: None,
            pages_per_second: None,
            max_record_attempts: default_record_attempts(),
            retry: RetryConfig::default(),
            thresholds: ConflictThresholds::default(),
            locale: default_locale(),
            sample_size: default_sample_size(),
            max_null_rate: default_max_null_rate(),
            max_transform_error_rate: default_max_transform_error_rate(),
            preflight_overrides: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Jobs are I/O bound against the target; half the cores, 1-8.
        if self.max_concurrent_jobs.is_none() {
            self.max_concurrent_jobs = Some((cores / 2).clamp(1, 8));
        }

        // Batch size: 250 rows per GB of RAM, 100-5000.
        if self.batch_size.is_none() {
            let batch = ((ram_gb * 250.0) as usize).clamp(100, 5_000);
            self.batch_size = Some(batch);
        }

        info!(
            "Auto-tuned config: batch_size={}, max_concurrent_jobs={}",
            self.get_batch_size(),
            self.get_max_concurrent_jobs()
        );

        self
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(500)
    }

    pub fn get_max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.unwrap_or(2)
    }
}

fn default_key_id() -> String {
    "default".to_string()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_record_attempts() -> u32 {
    3
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_sample_size() -> usize {
    200
}

fn default_max_null_rate() -> f64 {
    0.5
}

fn default_max_transform_error_rate() -> f64 {
    0.05
}
