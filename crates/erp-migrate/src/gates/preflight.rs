//! Preflight readiness checks.

use tracing::{info, warn};

use super::{ReadinessCheckResult, ReadinessReport};
use crate::core::schema::{EntityMapping, LegacySchema};
use crate::core::value::{FieldValue, LegacyRecord};
use crate::transform::{TransformChain, TransformContext};

/// Maximum number of offending items quoted in a diagnostic.
const MAX_LISTED: usize = 5;

/// Everything a preflight gate may inspect.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessInput<'a> {
    pub schema: &'a LegacySchema,
    pub mapping: &'a EntityMapping,
    pub sample: &'a [LegacyRecord],
    pub chain: &'a TransformChain,
    /// Target fields the entity's detector matches on.
    pub match_keys: &'a [&'static str],
    pub locale: &'a str,
}

/// A check run before extraction begins.
pub trait ReadinessGate: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, input: &ReadinessInput<'_>) -> ReadinessCheckResult;
}

/// Every legacy column is mapped or explicitly ignored, and every mapped
/// column exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingCompletenessCheck;

impl ReadinessGate for MappingCompletenessCheck {
    fn name(&self) -> &'static str {
        "mapping_completeness"
    }

    fn check(&self, input: &ReadinessInput<'_>) -> ReadinessCheckResult {
        let unmapped: Vec<&str> = input
            .schema
            .column_names()
            .into_iter()
            .filter(|c| !input.mapping.covers(c))
            .collect();
        let mut missing: Vec<&str> = input
            .mapping
            .fields
            .iter()
            .map(|f| f.source.as_str())
            .filter(|c| !input.schema.has_column(c))
            .collect();
        if !input.schema.has_column(&input.mapping.id_column) {
            missing.push(&input.mapping.id_column);
        }

        let result = if unmapped.is_empty() && missing.is_empty() {
            ReadinessCheckResult::pass(
                self.name(),
                format!("all {} columns of {} accounted for", input.schema.columns.len(), input.schema.table),
            )
        } else {
            let mut problems = Vec::new();
            if !unmapped.is_empty() {
                problems.push(format!("unmapped columns: {}", list(&unmapped)));
            }
            if !missing.is_empty() {
                problems.push(format!("mapped columns missing from {}: {}", input.schema.table, list(&missing)));
            }
            ReadinessCheckResult::fail(self.name(), problems.join("; "))
        };
        result
            .with_metric("unmapped_columns", unmapped.len() as f64)
            .with_metric("missing_columns", missing.len() as f64)
    }
}

/// Match keys are not null above `max_null_rate` in the legacy sample.
#[derive(Debug, Clone, Copy)]
pub struct MatchKeyNullRateCheck {
    pub max_null_rate: f64,
}

impl MatchKeyNullRateCheck {
    pub fn new(max_null_rate: f64) -> Self {
        Self { max_null_rate }
    }
}

fn is_blank(value: &FieldValue) -> bool {
    match value {
        FieldValue::Null => true,
        FieldValue::Text(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl ReadinessGate for MatchKeyNullRateCheck {
    fn name(&self) -> &'static str {
        "match_key_null_rate"
    }

    fn check(&self, input: &ReadinessInput<'_>) -> ReadinessCheckResult {
        if input.match_keys.is_empty() {
            return ReadinessCheckResult::pass(self.name(), "detector has no match keys");
        }

        let mapped: Vec<(&str, &str)> = input
            .match_keys
            .iter()
            .filter_map(|key| input.mapping.field_for_target(key).map(|f| (*key, f.source.as_str())))
            .collect();
        if mapped.is_empty() {
            return ReadinessCheckResult::fail(
                self.name(),
                format!("none of the match keys ({}) is mapped", input.match_keys.join(", ")),
            );
        }
        if input.sample.is_empty() {
            return ReadinessCheckResult::pass(self.name(), "empty sample, nothing to measure");
        }

        let total = input.sample.len() as f64;
        let mut result = ReadinessCheckResult::pass(self.name(), "");
        let mut offenders = Vec::new();
        for (key, source) in &mapped {
            let nulls = input.sample.iter().filter(|r| is_blank(r.get(source))).count();
            let rate = nulls as f64 / total;
            result = result.with_metric(key, rate);
            if rate > self.max_null_rate {
                offenders.push(format!("{} ({:.0}% null)", key, rate * 100.0));
            }
        }

        if offenders.is_empty() {
            result.diagnostic = format!(
                "match keys within {:.0}% null over {} sampled rows",
                self.max_null_rate * 100.0,
                input.sample.len()
            );
        } else {
            result.passed = false;
            result.diagnostic = format!(
                "match keys above {:.0}% null: {}",
                self.max_null_rate * 100.0,
                offenders.join(", ")
            );
        }
        result
    }
}

/// The transform chain fails on at most `max_error_rate` of sampled rows.
#[derive(Debug, Clone, Copy)]
pub struct TransformSampleCheck {
    pub max_error_rate: f64,
}

impl TransformSampleCheck {
    pub fn new(max_error_rate: f64) -> Self {
        Self { max_error_rate }
    }
}

impl ReadinessGate for TransformSampleCheck {
    fn name(&self) -> &'static str {
        "transform_sample"
    }

    fn check(&self, input: &ReadinessInput<'_>) -> ReadinessCheckResult {
        if input.sample.is_empty() {
            return ReadinessCheckResult::pass(self.name(), "empty sample, nothing to transform");
        }
        let ctx = TransformContext::new(&input.mapping.entity_type, input.locale);
        let errors: Vec<String> = input
            .sample
            .iter()
            .filter_map(|row| {
                input
                    .chain
                    .apply_record(row, input.mapping, &ctx)
                    .err()
                    .map(|e| format!("{}: {}", row.legacy_id, e))
            })
            .collect();
        let rate = errors.len() as f64 / input.sample.len() as f64;

        let result = if rate > self.max_error_rate {
            ReadinessCheckResult::fail(
                self.name(),
                format!(
                    "{} of {} sampled rows fail to transform ({})",
                    errors.len(),
                    input.sample.len(),
                    errors.iter().take(MAX_LISTED).cloned().collect::<Vec<_>>().join("; ")
                ),
            )
        } else {
            ReadinessCheckResult::pass(
                self.name(),
                format!("{} of {} sampled rows fail to transform", errors.len(), input.sample.len()),
            )
        };
        result.with_metric("error_rate", rate)
    }
}

/// Ordered preflight gates.
pub struct PreflightGateChain {
    gates: Vec<Box<dyn ReadinessGate>>,
}

impl Default for PreflightGateChain {
    fn default() -> Self {
        Self::standard(0.5, 0.05)
    }
}

impl PreflightGateChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    /// Mapping completeness, match-key null rate and transform sample.
    pub fn standard(max_null_rate: f64, max_transform_error_rate: f64) -> Self {
        Self::new()
            .with_gate(MappingCompletenessCheck)
            .with_gate(MatchKeyNullRateCheck::new(max_null_rate))
            .with_gate(TransformSampleCheck::new(max_transform_error_rate))
    }

    pub fn with_gate(mut self, gate: impl ReadinessGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// Run every gate. Failing gates named in `overrides` are marked
    /// overridden instead of blocking.
    pub fn run(&self, input: &ReadinessInput<'_>, overrides: &[String]) -> ReadinessReport {
        let checks = self
            .gates
            .iter()
            .map(|gate| {
                let mut result = gate.check(input);
                if !result.passed && overrides.iter().any(|o| o == gate.name()) {
                    warn!("Preflight gate {} failed but is overridden: {}", gate.name(), result.diagnostic);
                    result.overridden = true;
                } else if result.passed {
                    info!("Preflight gate {} passed: {}", gate.name(), result.diagnostic);
                } else {
                    warn!("Preflight gate {} failed: {}", gate.name(), result.diagnostic);
                }
                result
            })
            .collect();
        ReadinessReport::from_checks(checks)
    }
}

fn list(items: &[&str]) -> String {
    let mut out = items.iter().take(MAX_LISTED).copied().collect::<Vec<_>>().join(", ");
    if items.len() > MAX_LISTED {
        out.push_str(&format!(" (+{} more)", items.len() - MAX_LISTED));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::LegacyColumn;
    use crate::core::value::{DataType, Record};

    fn schema() -> LegacySchema {
        LegacySchema::new(
            "tblContacts",
            vec![
                LegacyColumn::new("id", "int"),
                LegacyColumn::new("FullName", "varchar"),
                LegacyColumn::new("Email", "varchar"),
                LegacyColumn::new("Fax", "varchar"),
            ],
        )
    }

    fn mapping() -> EntityMapping {
        EntityMapping::new("contacts", "tblContacts")
            .map("FullName", "name", DataType::Text)
            .map("Email", "email", DataType::Email)
            .ignore("Fax")
    }

    fn row(id: &str, name: &str, email: &str) -> LegacyRecord {
        let mut fields = Record::new();
        fields.insert("FullName".into(), name.into());
        fields.insert("Email".into(), email.into());
        LegacyRecord::new(id, fields)
    }

    fn run_gate(gate: &dyn ReadinessGate, mapping: &EntityMapping, sample: &[LegacyRecord]) -> ReadinessCheckResult {
        let schema = schema();
        let chain = TransformChain::standard();
        gate.check(&ReadinessInput {
            schema: &schema,
            mapping,
            sample,
            chain: &chain,
            match_keys: &["email", "phone", "name"],
            locale: "en-US",
        })
    }

    #[test]
    fn test_mapping_complete() {
        let result = run_gate(&MappingCompletenessCheck, &mapping(), &[]);
        assert!(result.passed, "{}", result.diagnostic);
    }

    #[test]
    fn test_mapping_reports_unmapped_and_missing() {
        let mapping = EntityMapping::new("contacts", "tblContacts")
            .map("FullName", "name", DataType::Text)
            .map("Mobile", "phone", DataType::Phone);
        let result = run_gate(&MappingCompletenessCheck, &mapping, &[]);
        assert!(!result.passed);
        assert!(result.diagnostic.contains("Email"));
        assert!(result.diagnostic.contains("Fax"));
        assert!(result.diagnostic.contains("Mobile"));
        assert_eq!(result.metrics["unmapped_columns"], 2.0);
    }

    #[test]
    fn test_null_rate_over_threshold_fails() {
        let sample = vec![row("1", "Jon", ""), row("2", "Ann", "  "), row("3", "Bo", "bo@x.com")];
        let result = run_gate(&MatchKeyNullRateCheck::new(0.5), &mapping(), &sample);
        assert!(!result.passed);
        assert!(result.diagnostic.contains("email"));
        assert!((result.metrics["email"] - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.metrics["name"], 0.0);
    }

    #[test]
    fn test_null_rate_within_threshold_passes() {
        let sample = vec![row("1", "Jon", "jon@x.com"), row("2", "Ann", "")];
        let result = run_gate(&MatchKeyNullRateCheck::new(0.5), &mapping(), &sample);
        assert!(result.passed, "{}", result.diagnostic);
    }

    #[test]
    fn test_null_rate_no_mapped_keys_fails() {
        let mapping = EntityMapping::new("contacts", "tblContacts").map("Fax", "fax", DataType::Text);
        let result = run_gate(&MatchKeyNullRateCheck::new(0.5), &mapping, &[]);
        assert!(!result.passed);
    }

    #[test]
    fn test_transform_sample_counts_failures() {
        let sample = vec![row("1", "Jon", "not-an-email"), row("2", "Ann", "ann@x.com")];
        let result = run_gate(&TransformSampleCheck::new(0.1), &mapping(), &sample);
        assert!(!result.passed);
        assert!(result.diagnostic.contains("1:"));
        assert_eq!(result.metrics["error_rate"], 0.5);
    }

    #[test]
    fn test_chain_overrides_named_gate() {
        let schema = schema();
        let chain = TransformChain::standard();
        let mapping = EntityMapping::new("contacts", "tblContacts").map("FullName", "name", DataType::Text);
        let input = ReadinessInput {
            schema: &schema,
            mapping: &mapping,
            sample: &[],
            chain: &chain,
            match_keys: &["name"],
            locale: "en-US",
        };
        let gates = PreflightGateChain::default();
        assert_eq!(gates.gate_names(), vec!["mapping_completeness", "match_key_null_rate", "transform_sample"]);

        let blocked = gates.run(&input, &[]);
        assert!(!blocked.passed);

        let overridden = gates.run(&input, &["mapping_completeness".to_string()]);
        assert!(overridden.passed);
        assert!(overridden.checks[0].overridden);
    }
}
