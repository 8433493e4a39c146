//! Readiness gates run before and after a pipeline.
//!
//! Preflight gates inspect the legacy schema, the mapping and a sample of
//! rows before anything is extracted; postflight gates check aggregate
//! invariants once loading finishes. Both produce a [`ReadinessReport`]
//! that is persisted with the job and included in the audit report.

pub mod postflight;
pub mod preflight;

pub use postflight::{
    NoDuplicateTargetsCheck, OutcomeReconciliationCheck, PostflightGate, PostflightGateChain,
    PostflightInput,
};
pub use preflight::{
    MappingCompletenessCheck, MatchKeyNullRateCheck, PreflightGateChain, ReadinessGate,
    ReadinessInput, TransformSampleCheck,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MigrateError, Result};

/// Result of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheckResult {
    pub gate: String,
    pub passed: bool,
    /// Failed, but an operator override let the job proceed.
    #[serde(default)]
    pub overridden: bool,
    pub diagnostic: String,
    /// Measured values (rates, counts) behind the verdict.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl ReadinessCheckResult {
    pub fn pass(gate: &str, diagnostic: impl Into<String>) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            overridden: false,
            diagnostic: diagnostic.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn fail(gate: &str, diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(gate, diagnostic)
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Whether this result blocks the job.
    pub fn is_blocking(&self) -> bool {
        !self.passed && !self.overridden
    }
}

/// Aggregate of a gate chain. Fails closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub checks: Vec<ReadinessCheckResult>,
    pub passed: bool,
}

impl ReadinessReport {
    pub fn from_checks(checks: Vec<ReadinessCheckResult>) -> Self {
        let passed = !checks.iter().any(ReadinessCheckResult::is_blocking);
        Self { checks, passed }
    }

    /// Failed checks that were not overridden.
    pub fn blocking(&self) -> impl Iterator<Item = &ReadinessCheckResult> {
        self.checks.iter().filter(|c| c.is_blocking())
    }

    /// Turn a failing report into a [`MigrateError::GateFailure`].
    pub fn ensure_passed(&self, phase: &str) -> Result<()> {
        if self.passed {
            return Ok(());
        }
        let failures: Vec<String> = self
            .blocking()
            .map(|c| format!("{}: {}", c.gate, c.diagnostic))
            .collect();
        Err(MigrateError::gate(phase, failures.join("; ")))
    }
}
