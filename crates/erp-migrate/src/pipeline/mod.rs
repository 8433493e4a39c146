//! Migration pipeline.
//!
//! - [`MigrationJob`]: what to migrate (mapping, thresholds, locale)
//! - [`PipelineEngine`]: runs a job batch by batch against the collaborators
//! - [`PipelineConfig`] / [`PipelineStats`]: tunables and run statistics
//! - [`outcome`]: per-record outcomes, snapshots, quarantine and merge
//!   explanation entries
//!
//! The job says *what*, the engine says *how*; a job can be serialized,
//! queued, and re-run to resume from its checkpoint.

mod engine;
mod job;
pub mod outcome;
mod stats;

pub use engine::{deterministic_target_id, PipelineEngine};
pub use job::{JobResult, MigrationJob};
pub use outcome::{LoadAction, MergeExplanationEntry, QuarantineEntry, RecordOutcome, RecordStatus, Snapshot};
pub use stats::{PipelineConfig, PipelineStats};
