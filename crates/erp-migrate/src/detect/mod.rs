//! Conflict detection.
//!
//! A [`ConflictDetector`] looks up candidate target records for a transformed
//! legacy record and scores each one in `[0, 100]`, explaining the score field
//! by field. Detectors are selected per entity type through a
//! [`DetectorRegistry`] that is built explicitly and injected into the
//! pipeline.

mod detectors;
pub mod fuzzy;
pub mod thresholds;

pub use detectors::{
    ContactsConflictDetector, InvoicesConflictDetector, NoConflictDetector,
    ProductsConflictDetector,
};
pub use fuzzy::{batch_fuzzy_match_names, fuzzy_match_name, FuzzyMatchConfig, FuzzyMatchResult};
pub use thresholds::{ConflictThresholds, Decision};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::traits::CandidateLookup;
use crate::core::value::Record;
use crate::error::{MigrateError, Result};

/// How a field contributed to a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Normalized,
    Fuzzy,
}

/// One field's contribution to a conflict score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchExplanation {
    pub field: String,
    pub match_type: MatchType,
    pub contribution: f64,
    pub legacy_value: String,
    pub candidate_value: String,
}

/// A candidate target record that may be the same entity as the legacy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub target_id: String,
    /// Confidence in `[0, 100]`.
    pub score: f64,
    pub explanations: Vec<MatchExplanation>,
    pub candidate_created_at: DateTime<Utc>,
}

/// Pick the winning candidate: highest score, then earliest created, then
/// lowest target id.
pub fn select_best(conflicts: &[Conflict]) -> Option<&Conflict> {
    conflicts.iter().min_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.candidate_created_at.cmp(&b.candidate_created_at))
            .then(a.target_id.cmp(&b.target_id))
    })
}

/// What a detector sees about the record being matched.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub job_id: &'a str,
    pub entity_type: &'a str,
    pub legacy_id: &'a str,
    /// Transformed fields, keyed by target field name.
    pub record: &'a Record,
}

/// Per-entity-type matcher.
#[async_trait]
pub trait ConflictDetector: Send + Sync {
    /// Detector name for logs and explanations.
    fn name(&self) -> &'static str;

    /// Target fields this detector keys on; preflight checks their null rate.
    fn match_keys(&self) -> Vec<&'static str>;

    /// Find and score candidates. Returns an empty list when nothing matches.
    async fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        lookup: &dyn CandidateLookup,
    ) -> Result<Vec<Conflict>>;
}

/// Registry of detectors keyed by entity type.
///
/// Built explicitly and passed to the pipeline; there is no global registry.
#[derive(Default, Clone)]
pub struct DetectorRegistry {
    detectors: HashMap<String, Arc<dyn ConflictDetector>>,
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}

impl DetectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the contacts, invoices and products detectors.
    ///
    /// Append-only entity types are not registered; register
    /// [`NoConflictDetector`] for them explicitly.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("contacts", ContactsConflictDetector::default());
        registry.register("invoices", InvoicesConflictDetector::default());
        registry.register("products", ProductsConflictDetector::default());
        registry
    }

    /// Register a detector for an entity type, replacing any previous one.
    pub fn register(&mut self, entity_type: impl Into<String>, detector: impl ConflictDetector + 'static) {
        self.detectors.insert(entity_type.into(), Arc::new(detector));
    }

    /// Register a shared detector.
    pub fn register_arc(&mut self, entity_type: impl Into<String>, detector: Arc<dyn ConflictDetector>) {
        self.detectors.insert(entity_type.into(), detector);
    }

    /// Get the detector for an entity type.
    pub fn get(&self, entity_type: &str) -> Result<Arc<dyn ConflictDetector>> {
        self.detectors.get(entity_type).cloned().ok_or_else(|| {
            MigrateError::Config(format!(
                "No conflict detector registered for entity type '{}'. Registered: {:?}",
                entity_type,
                self.entity_types()
            ))
        })
    }

    /// Check if an entity type has a detector.
    pub fn has(&self, entity_type: &str) -> bool {
        self.detectors.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
