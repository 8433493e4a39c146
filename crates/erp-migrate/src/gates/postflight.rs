//! Postflight validation of a finished pipeline run.
//!
//! A failing postflight flags the job for review; it never rolls anything back.

use std::collections::HashMap;

use tracing::{info, warn};

use super::{ReadinessCheckResult, ReadinessReport};
use crate::pipeline::outcome::{LoadAction, RecordOutcome, RecordStatus};

/// Aggregates a postflight gate may inspect.
#[derive(Debug, Clone, Copy)]
pub struct PostflightInput<'a> {
    pub job_id: &'a str,
    pub entity_type: &'a str,
    /// Outcomes written by this job for this entity type.
    pub outcomes: &'a [RecordOutcome],
    /// Legacy rows the pipeline walked past, per the final checkpoint.
    pub processed_count: u64,
    /// Of those, rows that already had an outcome from an earlier job.
    pub previously_recorded: u64,
}

/// A check run after loading completes.
pub trait PostflightGate: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, input: &PostflightInput<'_>) -> ReadinessCheckResult;
}

/// No two records were created as, or merged into, the same target.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDuplicateTargetsCheck;

impl PostflightGate for NoDuplicateTargetsCheck {
    fn name(&self) -> &'static str {
        "no_duplicate_targets"
    }

    fn check(&self, input: &PostflightInput<'_>) -> ReadinessCheckResult {
        let mut writers: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut legacy_seen: HashMap<&str, usize> = HashMap::new();
        for outcome in input.outcomes {
            *legacy_seen.entry(outcome.legacy_id.as_str()).or_default() += 1;
            let writes = matches!(
                outcome.action,
                Some(LoadAction::Create | LoadAction::Merge | LoadAction::Update)
            );
            if outcome.status == RecordStatus::Loaded && writes {
                if let Some(target) = &outcome.target_id {
                    writers.entry(target.as_str()).or_default().push(&outcome.legacy_id);
                }
            }
        }

        let mut duplicates: Vec<String> = writers
            .iter()
            .filter(|(_, legacy)| legacy.len() > 1)
            .map(|(target, legacy)| format!("{} <- [{}]", target, legacy.join(", ")))
            .collect();
        duplicates.sort();
        let mut repeated: Vec<&str> = legacy_seen
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(id, _)| *id)
            .collect();
        repeated.sort_unstable();

        let result = if duplicates.is_empty() && repeated.is_empty() {
            ReadinessCheckResult::pass(
                self.name(),
                format!("{} distinct targets written", writers.len()),
            )
        } else {
            let mut problems = Vec::new();
            if !duplicates.is_empty() {
                problems.push(format!("targets written by several records: {}", duplicates.join("; ")));
            }
            if !repeated.is_empty() {
                problems.push(format!("legacy ids with several outcomes: {}", repeated.join(", ")));
            }
            ReadinessCheckResult::fail(self.name(), problems.join("; "))
        };
        result
            .with_metric("duplicate_targets", duplicates.len() as f64)
            .with_metric("repeated_outcomes", repeated.len() as f64)
    }
}

/// Outcome counts add up to the number of rows walked.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeReconciliationCheck;

impl PostflightGate for OutcomeReconciliationCheck {
    fn name(&self) -> &'static str {
        "outcome_reconciliation"
    }

    fn check(&self, input: &PostflightInput<'_>) -> ReadinessCheckResult {
        let mut by_status: HashMap<RecordStatus, u64> = HashMap::new();
        for outcome in input.outcomes {
            *by_status.entry(outcome.status).or_default() += 1;
        }
        let recorded = input.outcomes.len() as u64;
        let accounted = recorded + input.previously_recorded;

        let breakdown = [
            RecordStatus::Loaded,
            RecordStatus::Skipped,
            RecordStatus::ManualReview,
            RecordStatus::Quarantined,
        ]
        .iter()
        .map(|s| format!("{} {}", by_status.get(s).copied().unwrap_or(0), s))
        .collect::<Vec<_>>()
        .join(", ");

        let result = if accounted == input.processed_count {
            ReadinessCheckResult::pass(
                self.name(),
                format!(
                    "{} rows processed: {}, {} previously recorded",
                    input.processed_count, breakdown, input.previously_recorded
                ),
            )
        } else {
            ReadinessCheckResult::fail(
                self.name(),
                format!(
                    "{} rows processed but {} accounted for ({}, {} previously recorded)",
                    input.processed_count, accounted, breakdown, input.previously_recorded
                ),
            )
        };
        result
            .with_metric("processed", input.processed_count as f64)
            .with_metric("accounted", accounted as f64)
    }
}

/// Ordered postflight gates.
pub struct PostflightGateChain {
    gates: Vec<Box<dyn PostflightGate>>,
}

impl Default for PostflightGateChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl PostflightGateChain {
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    /// Duplicate-target and reconciliation checks.
    pub fn standard() -> Self {
        Self::new()
            .with_gate(NoDuplicateTargetsCheck)
            .with_gate(OutcomeReconciliationCheck)
    }

    pub fn with_gate(mut self, gate: impl PostflightGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn run(&self, input: &PostflightInput<'_>) -> ReadinessReport {
        let checks = self
            .gates
            .iter()
            .map(|gate| {
                let result = gate.check(input);
                if result.passed {
                    info!("Postflight gate {} passed for {}: {}", gate.name(), input.entity_type, result.diagnostic);
                } else {
                    warn!("Postflight gate {} failed for {}: {}", gate.name(), input.entity_type, result.diagnostic);
                }
                result
            })
            .collect();
        ReadinessReport::from_checks(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureStage, MigrateError};

    fn input<'a>(outcomes: &'a [RecordOutcome], processed: u64, previous: u64) -> PostflightInput<'a> {
        PostflightInput {
            job_id: "j1",
            entity_type: "contacts",
            outcomes,
            processed_count: processed,
            previously_recorded: previous,
        }
    }

    fn loaded(legacy: &str, action: LoadAction, target: &str) -> RecordOutcome {
        RecordOutcome::loaded("j1", "contacts", legacy, action, target, None)
    }

    #[test]
    fn test_distinct_targets_pass() {
        let outcomes = vec![
            loaded("L1", LoadAction::Create, "t1"),
            loaded("L2", LoadAction::Merge, "t2"),
            RecordOutcome::skipped("j1", "contacts", "L3", "t2", Some(99.0)),
        ];
        let result = NoDuplicateTargetsCheck.check(&input(&outcomes, 3, 0));
        assert!(result.passed, "{}", result.diagnostic);
    }

    #[test]
    fn test_two_merges_into_one_target_fail() {
        let outcomes = vec![loaded("L1", LoadAction::Merge, "t1"), loaded("L2", LoadAction::Merge, "t1")];
        let result = NoDuplicateTargetsCheck.check(&input(&outcomes, 2, 0));
        assert!(!result.passed);
        assert!(result.diagnostic.contains("t1"));
    }

    #[test]
    fn test_reconciliation_counts_previous_outcomes() {
        let err = MigrateError::transform("email", "normalize_email", "bad");
        let outcomes = vec![
            loaded("L1", LoadAction::Create, "t1"),
            RecordOutcome::quarantined("j1", "contacts", "L2", FailureStage::Transform, &err),
        ];
        assert!(OutcomeReconciliationCheck.check(&input(&outcomes, 3, 1)).passed);
        let result = OutcomeReconciliationCheck.check(&input(&outcomes, 4, 1));
        assert!(!result.passed);
        assert!(result.diagnostic.contains("1 quarantined"));
    }

    #[test]
    fn test_chain_reports_both() {
        let report = PostflightGateChain::standard().run(&input(&[], 0, 0));
        assert!(report.passed);
        assert_eq!(report.checks.len(), 2);
    }
}
