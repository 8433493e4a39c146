//! Built-in conflict detectors.
//!
//! Weights are points out of 100. Exact field matches contribute the full
//! weight, normalized matches [`NORMALIZED_FACTOR`] of it, and fuzzy name
//! matches `weight * similarity^2`, so the contribution tapers quickly as
//! names diverge.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::cmp::Ordering;

use super::fuzzy::{batch_fuzzy_match_names, FuzzyMatchConfig, FuzzyMatchResult, MatchMethod};
use super::{Conflict, ConflictDetector, DetectionContext, MatchExplanation, MatchType};
use crate::core::query::compare_values;
use crate::core::traits::{CandidateLookup, CandidateQuery};
use crate::core::value::{FieldValue, TargetRecord};
use crate::error::Result;

/// Share of a field's weight earned by a match after normalization.
pub const NORMALIZED_FACTOR: f64 = 0.9;

/// Characters of a name used for the candidate prefix lookup.
const NAME_PREFIX_LEN: usize = 3;

/// Accumulates a candidate's score and explanations.
#[derive(Default)]
struct Scorer {
    score: f64,
    explanations: Vec<MatchExplanation>,
}

impl Scorer {
    fn add(
        &mut self,
        field: &str,
        match_type: MatchType,
        contribution: f64,
        legacy: &FieldValue,
        candidate: &FieldValue,
    ) {
        if contribution <= 0.0 {
            return;
        }
        self.score += contribution;
        self.explanations.push(MatchExplanation {
            field: field.to_string(),
            match_type,
            contribution: round2(contribution),
            legacy_value: legacy.to_string(),
            candidate_value: candidate.to_string(),
        });
    }

    /// Compare with `normalize`; exact if raw text is equal.
    fn add_keyed(
        &mut self,
        field: &str,
        weight: f64,
        legacy: &FieldValue,
        candidate: &FieldValue,
        normalize: fn(&str) -> String,
    ) {
        if legacy.is_null() || candidate.is_null() {
            return;
        }
        let (l, c) = (legacy.to_string(), candidate.to_string());
        if l == c {
            self.add(field, MatchType::Exact, weight, legacy, candidate);
        } else if !normalize(&l).is_empty() && normalize(&l) == normalize(&c) {
            self.add(field, MatchType::Normalized, weight * NORMALIZED_FACTOR, legacy, candidate);
        }
    }

    /// Typed equality (numbers compare across int/decimal/float).
    fn add_equal(&mut self, field: &str, weight: f64, legacy: &FieldValue, candidate: &FieldValue) {
        if legacy.is_null() || candidate.is_null() {
            return;
        }
        if compare_values(legacy, candidate) == Some(Ordering::Equal) {
            self.add(field, MatchType::Exact, weight, legacy, candidate);
        }
    }

    fn add_fuzzy(
        &mut self,
        field: &str,
        weight: f64,
        result: Option<&FuzzyMatchResult>,
        legacy: &FieldValue,
        candidate: &FieldValue,
    ) {
        let Some(result) = result else { return };
        let (match_type, contribution) = match result.method {
            MatchMethod::Identical => (MatchType::Exact, weight),
            _ if result.score >= 1.0 => (MatchType::Normalized, weight * NORMALIZED_FACTOR),
            _ => (MatchType::Fuzzy, weight * result.score * result.score),
        };
        self.add(field, match_type, contribution, legacy, candidate);
    }

    fn finish(self, candidate: &TargetRecord) -> Option<Conflict> {
        if self.explanations.is_empty() {
            return None;
        }
        Some(Conflict {
            target_id: candidate.id.clone(),
            score: round2(self.score.min(100.0)),
            explanations: self.explanations,
            candidate_created_at: candidate.created_at,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn lowercase_trim(s: &str) -> String {
    s.trim().to_lowercase()
}

fn digits_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

fn alnum_upper(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Run every query and merge the results, deduplicated and ordered by id.
async fn lookup_all(
    lookup: &dyn CandidateLookup,
    entity_type: &str,
    queries: Vec<CandidateQuery>,
) -> Result<Vec<TargetRecord>> {
    let mut found: BTreeMap<String, TargetRecord> = BTreeMap::new();
    for query in &queries {
        for record in lookup.find_candidates(entity_type, query).await? {
            found.entry(record.id.clone()).or_insert(record);
        }
    }
    Ok(found.into_values().collect())
}

fn name_prefix_query(field: &str, name: &FieldValue) -> Option<CandidateQuery> {
    let name = name.as_text()?;
    let prefix: String = name.trim().to_lowercase().chars().take(NAME_PREFIX_LEN).collect();
    (prefix.chars().count() == NAME_PREFIX_LEN).then(|| CandidateQuery::prefix(field, prefix))
}

/// Fuzzy-match the legacy name against every candidate's name in one pass.
fn fuzzy_names(
    name: &FieldValue,
    field: &str,
    candidates: &[TargetRecord],
    config: &FuzzyMatchConfig,
) -> BTreeMap<usize, FuzzyMatchResult> {
    let Some(name) = name.as_text() else {
        return BTreeMap::new();
    };
    let names: Vec<String> = candidates
        .iter()
        .map(|c| c.get(field).as_text().unwrap_or_default().to_string())
        .collect();
    batch_fuzzy_match_names(name, &names, config)
        .into_iter()
        .collect()
}

/// Matches contacts on email, phone and name.
#[derive(Debug, Clone)]
pub struct ContactsConflictDetector {
    pub email_weight: f64,
    pub phone_weight: f64,
    pub name_weight: f64,
    pub fuzzy: FuzzyMatchConfig,
}

impl Default for ContactsConflictDetector {
    fn default() -> Self {
        Self {
            email_weight: 60.0,
            phone_weight: 30.0,
            name_weight: 40.0,
            fuzzy: FuzzyMatchConfig::default(),
        }
    }
}

#[async_trait]
impl ConflictDetector for ContactsConflictDetector {
    fn name(&self) -> &'static str {
        "contacts"
    }

    fn match_keys(&self) -> Vec<&'static str> {
        vec!["email", "phone", "name"]
    }

    async fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        lookup: &dyn CandidateLookup,
    ) -> Result<Vec<Conflict>> {
        let email = ctx.record.get("email").unwrap_or(&FieldValue::Null);
        let phone = ctx.record.get("phone").unwrap_or(&FieldValue::Null);
        let name = ctx.record.get("name").unwrap_or(&FieldValue::Null);

        let mut queries = Vec::new();
        if !email.is_null() {
            queries.push(CandidateQuery::equals("email", email.clone()));
        }
        if !phone.is_null() {
            queries.push(CandidateQuery::equals("phone", phone.clone()));
        }
        queries.extend(name_prefix_query("name", name));

        let candidates = lookup_all(lookup, ctx.entity_type, queries).await?;
        let names = fuzzy_names(name, "name", &candidates, &self.fuzzy);

        Ok(candidates
            .iter()
            .enumerate()
            .filter_map(|(i, candidate)| {
                let mut scorer = Scorer::default();
                scorer.add_keyed("email", self.email_weight, email, candidate.get("email"), lowercase_trim);
                scorer.add_keyed("phone", self.phone_weight, phone, candidate.get("phone"), digits_only);
                scorer.add_fuzzy("name", self.name_weight, names.get(&i), name, candidate.get("name"));
                scorer.finish(candidate)
            })
            .collect())
    }
}

/// Matches invoices on invoice number, backed by customer, total and date.
#[derive(Debug, Clone)]
pub struct InvoicesConflictDetector {
    pub number_weight: f64,
    pub customer_weight: f64,
    pub total_weight: f64,
    pub date_weight: f64,
}

impl Default for InvoicesConflictDetector {
    fn default() -> Self {
        Self {
            number_weight: 70.0,
            customer_weight: 15.0,
            total_weight: 10.0,
            date_weight: 5.0,
        }
    }
}

#[async_trait]
impl ConflictDetector for InvoicesConflictDetector {
    fn name(&self) -> &'static str {
        "invoices"
    }

    fn match_keys(&self) -> Vec<&'static str> {
        vec!["invoice_number"]
    }

    async fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        lookup: &dyn CandidateLookup,
    ) -> Result<Vec<Conflict>> {
        let number = ctx.record.get("invoice_number").unwrap_or(&FieldValue::Null);
        if number.is_null() {
            return Ok(Vec::new());
        }
        let customer = ctx.record.get("customer_ref").unwrap_or(&FieldValue::Null);
        let total = ctx.record.get("total").unwrap_or(&FieldValue::Null);
        let date = ctx.record.get("invoice_date").unwrap_or(&FieldValue::Null);

        let queries = vec![CandidateQuery::equals("invoice_number", number.clone())];
        let candidates = lookup_all(lookup, ctx.entity_type, queries).await?;

        Ok(candidates
            .iter()
            .filter_map(|candidate| {
                let mut scorer = Scorer::default();
                scorer.add_keyed(
                    "invoice_number",
                    self.number_weight,
                    number,
                    candidate.get("invoice_number"),
                    alnum_upper,
                );
                scorer.add_keyed(
                    "customer_ref",
                    self.customer_weight,
                    customer,
                    candidate.get("customer_ref"),
                    lowercase_trim,
                );
                scorer.add_equal("total", self.total_weight, total, candidate.get("total"));
                scorer.add_equal("invoice_date", self.date_weight, date, candidate.get("invoice_date"));
                scorer.finish(candidate)
            })
            .collect())
    }
}

/// Matches products on SKU and name.
#[derive(Debug, Clone)]
pub struct ProductsConflictDetector {
    pub sku_weight: f64,
    pub name_weight: f64,
    pub fuzzy: FuzzyMatchConfig,
}

impl Default for ProductsConflictDetector {
    fn default() -> Self {
        Self {
            sku_weight: 70.0,
            name_weight: 30.0,
            fuzzy: FuzzyMatchConfig::default(),
        }
    }
}

#[async_trait]
impl ConflictDetector for ProductsConflictDetector {
    fn name(&self) -> &'static str {
        "products"
    }

    fn match_keys(&self) -> Vec<&'static str> {
        vec!["sku", "name"]
    }

    async fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        lookup: &dyn CandidateLookup,
    ) -> Result<Vec<Conflict>> {
        let sku = ctx.record.get("sku").unwrap_or(&FieldValue::Null);
        let name = ctx.record.get("name").unwrap_or(&FieldValue::Null);

        let mut queries = Vec::new();
        if !sku.is_null() {
            queries.push(CandidateQuery::equals("sku", sku.clone()));
        }
        queries.extend(name_prefix_query("name", name));

        let candidates = lookup_all(lookup, ctx.entity_type, queries).await?;
        let names = fuzzy_names(name, "name", &candidates, &self.fuzzy);

        Ok(candidates
            .iter()
            .enumerate()
            .filter_map(|(i, candidate)| {
                let mut scorer = Scorer::default();
                scorer.add_keyed("sku", self.sku_weight, sku, candidate.get("sku"), alnum_upper);
                scorer.add_fuzzy("name", self.name_weight, names.get(&i), name, candidate.get("name"));
                scorer.finish(candidate)
            })
            .collect())
    }
}

/// Never reports a conflict. For append-only entity types.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConflictDetector;

#[async_trait]
impl ConflictDetector for NoConflictDetector {
    fn name(&self) -> &'static str {
        "none"
    }

    fn match_keys(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn detect(
        &self,
        _ctx: &DetectionContext<'_>,
        _lookup: &dyn CandidateLookup,
    ) -> Result<Vec<Conflict>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Record;
    use crate::detect::{select_best, ConflictThresholds, Decision};
    use crate::error::MigrateError;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Lookup over a fixed list of records.
    struct FixedLookup {
        records: Vec<TargetRecord>,
        calls: AtomicUsize,
    }

    impl FixedLookup {
        fn new(records: Vec<TargetRecord>) -> Self {
            Self {
                records,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CandidateLookup for FixedLookup {
        async fn find_candidates(
            &self,
            entity_type: &str,
            query: &CandidateQuery,
        ) -> Result<Vec<TargetRecord>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self
                .records
                .iter()
                .filter(|r| r.entity_type == entity_type)
                .filter(|r| match query {
                    CandidateQuery::Equals { field, value } => {
                        r.get(field).to_string().to_lowercase() == value.to_string().to_lowercase()
                    }
                    CandidateQuery::Prefix { field, prefix } => r
                        .get(field)
                        .to_string()
                        .to_lowercase()
                        .starts_with(&prefix.to_lowercase()),
                })
                .cloned()
                .collect())
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl CandidateLookup for FailingLookup {
        async fn find_candidates(&self, _: &str, _: &CandidateQuery) -> Result<Vec<TargetRecord>> {
            Err(MigrateError::connector("target API timed out"))
        }
    }

    fn target(entity: &str, id: &str, day: u32, fields: &[(&str, FieldValue)]) -> TargetRecord {
        TargetRecord {
            id: id.to_string(),
            entity_type: entity.to_string(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            created_at: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
        }
    }

    fn record(fields: &[(&str, FieldValue)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn ctx<'a>(entity: &'a str, record: &'a Record) -> DetectionContext<'a> {
        DetectionContext {
            job_id: "job-1",
            entity_type: entity,
            legacy_id: "L1",
            record,
        }
    }

    #[tokio::test]
    async fn test_contact_exact_email_and_name() {
        let lookup = FixedLookup::new(vec![target(
            "contacts",
            "t-1",
            1,
            &[("email", "jon@x.com".into()), ("name", "Jon Smith".into())],
        )]);
        let rec = record(&[("email", "jon@x.com".into()), ("name", "Jon Smith".into())]);
        let conflicts = ContactsConflictDetector::default()
            .detect(&ctx("contacts", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].score, 100.0);
        let fields: Vec<&str> = conflicts[0].explanations.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["email", "name"]);
        assert!(conflicts[0]
            .explanations
            .iter()
            .all(|e| e.match_type == MatchType::Exact));
    }

    #[tokio::test]
    async fn test_contact_normalized_email_only() {
        let lookup = FixedLookup::new(vec![target(
            "contacts",
            "t-1",
            1,
            &[("email", "JON@X.com".into()), ("name", "Someone Else".into())],
        )]);
        let rec = record(&[("email", "jon@x.com".into()), ("name", "Jon Smith".into())]);
        let conflicts = ContactsConflictDetector::default()
            .detect(&ctx("contacts", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].score, 54.0);
        assert_eq!(conflicts[0].explanations.len(), 1);
        assert_eq!(conflicts[0].explanations[0].match_type, MatchType::Normalized);
    }

    #[tokio::test]
    async fn test_contact_fuzzy_name_tapers() {
        let lookup = FixedLookup::new(vec![
            target("contacts", "t-1", 1, &[("name", "Jonathon Smith".into())]),
            target("contacts", "t-2", 2, &[("name", "Jonathan Smith".into())]),
        ]);
        let rec = record(&[("name", "Jonathan Smith".into())]);
        let conflicts = ContactsConflictDetector::default()
            .detect(&ctx("contacts", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 2);
        let exact = conflicts.iter().find(|c| c.target_id == "t-2").unwrap();
        let fuzzy = conflicts.iter().find(|c| c.target_id == "t-1").unwrap();
        assert_eq!(exact.score, 40.0);
        assert!(fuzzy.score < exact.score);
        assert_eq!(fuzzy.explanations[0].match_type, MatchType::Fuzzy);
        assert_eq!(select_best(&conflicts).unwrap().target_id, "t-2");
    }

    #[tokio::test]
    async fn test_contact_phone_digits_normalized() {
        let lookup = FixedLookup::new(vec![target(
            "contacts",
            "t-9",
            1,
            &[("phone", "+15551234567".into()), ("email", "jon@x.com".into())],
        )]);
        let rec = record(&[("email", "jon@x.com".into()), ("phone", "+1 555 123 4567".into())]);
        let conflicts = ContactsConflictDetector::default()
            .detect(&ctx("contacts", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts[0].score, 60.0 + 27.0);
        let thresholds = ConflictThresholds::new(60.0, 30.0).unwrap();
        assert_eq!(thresholds.classify(conflicts[0].score), Decision::Merge);
    }

    #[tokio::test]
    async fn test_invoice_number_and_amount() {
        let lookup = FixedLookup::new(vec![target(
            "invoices",
            "inv-1",
            1,
            &[
                ("invoice_number", "INV-1001".into()),
                ("customer_ref", "C-77".into()),
                ("total", FieldValue::Decimal(Decimal::new(12550, 2))),
            ],
        )]);
        let rec = record(&[
            ("invoice_number", "INV-1001".into()),
            ("customer_ref", "c-77".into()),
            ("total", FieldValue::Float(125.5)),
        ]);
        let conflicts = InvoicesConflictDetector::default()
            .detect(&ctx("invoices", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].score, 70.0 + 13.5 + 10.0);
    }

    #[tokio::test]
    async fn test_invoice_without_number_skips_lookup() {
        let lookup = FixedLookup::new(Vec::new());
        let rec = record(&[("customer_ref", "C-77".into())]);
        let conflicts = InvoicesConflictDetector::default()
            .detect(&ctx("invoices", &rec), &lookup)
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(lookup.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_product_sku_exact() {
        let lookup = FixedLookup::new(vec![target(
            "products",
            "p-1",
            1,
            &[("sku", "AB-100".into()), ("name", "Steel Bolt M6".into())],
        )]);
        let rec = record(&[("sku", "AB-100".into()), ("name", "Steel Bolt M6".into())]);
        let conflicts = ProductsConflictDetector::default()
            .detect(&ctx("products", &rec), &lookup)
            .await
            .unwrap();
        assert_eq!(conflicts[0].score, 100.0);
    }

    #[tokio::test]
    async fn test_no_conflict_detector() {
        let rec = record(&[("amount", FieldValue::Int(5))]);
        let conflicts = NoConflictDetector
            .detect(&ctx("journal_lines", &rec), &FailingLookup)
            .await
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let rec = record(&[("email", "jon@x.com".into())]);
        let err = ContactsConflictDetector::default()
            .detect(&ctx("contacts", &rec), &FailingLookup)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
