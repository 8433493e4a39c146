//! # erp-migrate
//!
//! Resumable, auditable migration of legacy records into an ERP.
//!
//! Each record moves through `extract → transform → detect → reserve → load
//! → snapshot` and ends in exactly one outcome:
//!
//! - **Idempotent resume** from per-batch checkpoints
//! - **Conflict detection** with fuzzy matching and configurable thresholds
//! - **Quarantine and manual review** instead of failing the job
//! - **Preflight and postflight gates** around every run
//! - **Signed audit reports** in a canonical encoding
//! - **Rollback** by replaying snapshots in reverse
//!
//! ## Example
//!
//! ```rust,no_run
//! use erp_migrate::{Config, LocalRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> erp_migrate::Result<()> {
//!     let config = Config::load("migrate.yaml")?.with_auto_tuning();
//!     let jobs = config.jobs("run-1", None, false)?;
//!     let runtime = LocalRuntime::open(config)?;
//!     let worker = runtime.worker();
//!     for job in jobs {
//!         worker.submit(job).await;
//!     }
//!     for report in worker.run_until_idle(&CancellationToken::new()).await {
//!         println!("{}: {}", report.job_id, report.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod audit;
pub mod config;
pub mod control;
pub mod core;
pub mod detect;
pub mod error;
pub mod gates;
pub mod orchestrator;
pub mod pipeline;
pub mod rollback;
pub mod state;
pub mod transform;
pub mod worker;

// Re-exports for convenient access
pub use adapters::{JsonFileConnector, LocalRuntime, MemoryTargetStore};
pub use audit::{AuditReport, SignedAuditReport};
pub use config::{Config, MigrationConfig};
pub use control::{ControlPlane, JobStats, JobSummary, PageQuery, QuarantineFilter};
pub use detect::{ConflictDetector, ConflictThresholds, Decision, DetectorRegistry};
pub use error::{ErrorClass, FailureStage, MigrateError, Result};
pub use orchestrator::{JobReport, Orchestrator};
pub use pipeline::{JobResult, MigrationJob, PipelineConfig, PipelineEngine, PipelineStats};
pub use rollback::{RollbackEngine, RollbackResult};
pub use state::{FileJobStore, JobRecord, JobStatus, JobStore, MemoryJobStore, StepCheckpoint};
pub use transform::{TransformChain, STANDARD_TRANSFORM_VERSION};
pub use worker::{RetryPolicy, TokenBucket, Worker};
