//! Transform chain: deterministic normalization of legacy field values.
//!
//! A [`TransformChain`] applies an ordered list of [`TransformStep`]s to every
//! mapped field of an extracted record before it is matched or loaded. The
//! standard chain is:
//!
//! 1. [`TrimWhitespace`]
//! 2. [`NormalizeWhitespace`]
//! 3. [`NormalizePhone`]
//! 4. [`NormalizeEmail`]
//! 5. [`CoerceType`] (always last: it expects already-cleaned text)
//!
//! Every step is pure and idempotent, so applying the chain to its own output
//! changes nothing. The chain carries a version string that is stored in step
//! checkpoints; bump [`STANDARD_TRANSFORM_VERSION`] whenever a step's behavior
//! changes.

mod steps;

pub use steps::{CoerceType, NormalizeEmail, NormalizePhone, NormalizeWhitespace, TrimWhitespace};

use sha2::{Digest, Sha256};
use std::fmt;

use crate::core::schema::EntityMapping;
use crate::core::value::{DataType, FieldValue, LegacyRecord, Record};
use crate::error::MigrateError;

/// Version of the standard chain's normalization rules.
pub const STANDARD_TRANSFORM_VERSION: &str = "std-v3";

/// Shared context handed to every step.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Entity type being migrated.
    pub entity_type: &'a str,
    /// Target field currently being transformed.
    pub field: &'a str,
    /// Locale used for ambiguous formats (dates, phone country code).
    pub locale: &'a str,
}

impl<'a> TransformContext<'a> {
    pub fn new(entity_type: &'a str, locale: &'a str) -> Self {
        Self {
            entity_type,
            field: "",
            locale,
        }
    }

    /// Same context, pointed at another field.
    pub fn for_field(&self, field: &'a str) -> Self {
        Self { field, ..*self }
    }

    /// Whether dates default to month-first.
    pub fn month_first(&self) -> bool {
        self.locale.eq_ignore_ascii_case("en-US") || self.locale.eq_ignore_ascii_case("en_US")
    }

    /// Country calling code for national phone numbers.
    pub fn default_country_code(&self) -> Option<&'static str> {
        let region = self
            .locale
            .rsplit(|c| c == '-' || c == '_')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match region.as_str() {
            "US" | "CA" => Some("1"),
            "GB" => Some("44"),
            "DE" => Some("49"),
            "FR" => Some("33"),
            _ => None,
        }
    }
}

/// A value could not be normalized; carries the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    pub field: String,
    pub step: String,
    pub message: String,
}

impl TransformError {
    pub fn new(ctx: &TransformContext<'_>, step: &str, message: impl Into<String>) -> Self {
        Self {
            field: ctx.field.to_string(),
            step: step.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed on field '{}': {}", self.step, self.field, self.message)
    }
}

impl std::error::Error for TransformError {}

impl From<TransformError> for MigrateError {
    fn from(e: TransformError) -> Self {
        MigrateError::Transform {
            field: e.field,
            step: e.step,
            message: e.message,
        }
    }
}

/// One normalization step.
pub trait TransformStep: Send + Sync {
    /// Stable step name, part of the chain fingerprint.
    fn name(&self) -> &'static str;

    /// Normalize `value`. Values outside the step's domain pass through.
    fn apply(
        &self,
        value: FieldValue,
        hint: DataType,
        ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError>;
}

/// Ordered composition of transform steps.
pub struct TransformChain {
    version: String,
    steps: Vec<Box<dyn TransformStep>>,
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("version", &self.version)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransformChain {
    /// Create an empty chain with a version label.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            steps: Vec::new(),
        }
    }

    /// The standard chain: trim, collapse whitespace, phone, email, coercion.
    pub fn standard() -> Self {
        Self::new(STANDARD_TRANSFORM_VERSION)
            .with_step(TrimWhitespace)
            .with_step(NormalizeWhitespace)
            .with_step(NormalizePhone)
            .with_step(NormalizeEmail)
            .with_step(CoerceType)
    }

    /// Append a step.
    pub fn with_step(mut self, step: impl TransformStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Hash of version and step order, recorded in the plan fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.as_bytes());
        for name in self.step_names() {
            hasher.update(b"|");
            hasher.update(name.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Run a single value through every step in order.
    pub fn apply_value(
        &self,
        value: FieldValue,
        hint: DataType,
        ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        self.steps
            .iter()
            .try_fold(value, |value, step| step.apply(value, hint, ctx))
    }

    /// Transform every mapped column of a legacy record into target fields.
    ///
    /// Ignored and unmapped columns are dropped; missing columns become NULL.
    pub fn apply_record(
        &self,
        record: &LegacyRecord,
        mapping: &EntityMapping,
        ctx: &TransformContext<'_>,
    ) -> Result<Record, TransformError> {
        let mut out = Record::new();
        for field in &mapping.fields {
            let field_ctx = ctx.for_field(&field.target);
            let value = self.apply_value(record.get(&field.source).clone(), field.data_type, &field_ctx)?;
            out.insert(field.target.clone(), value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts_mapping() -> EntityMapping {
        EntityMapping::new("contacts", "tblContacts")
            .map("FullName", "name", DataType::Text)
            .map("EmailAddr", "email", DataType::Email)
            .map("Phone", "phone", DataType::Phone)
            .map("Since", "customer_since", DataType::Date)
    }

    fn record(pairs: &[(&str, &str)]) -> LegacyRecord {
        LegacyRecord::new(
            "L1",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
                .collect(),
        )
    }

    #[test]
    fn test_standard_chain_order() {
        let chain = TransformChain::standard();
        assert_eq!(
            chain.step_names(),
            vec![
                "trim_whitespace",
                "normalize_whitespace",
                "normalize_phone",
                "normalize_email",
                "coerce_type"
            ]
        );
        assert_eq!(chain.version(), STANDARD_TRANSFORM_VERSION);
    }

    #[test]
    fn test_name_and_email_scenario() {
        let chain = TransformChain::standard();
        let ctx = TransformContext::new("contacts", "en-US");
        let legacy = record(&[("FullName", "  Jon  Smith "), ("EmailAddr", "JON@X.COM")]);
        let out = chain.apply_record(&legacy, &contacts_mapping(), &ctx).unwrap();
        assert_eq!(out["name"], FieldValue::Text("Jon Smith".into()));
        assert_eq!(out["email"], FieldValue::Text("jon@x.com".into()));
        assert!(out["phone"].is_null());
    }

    #[test]
    fn test_chain_is_idempotent() {
        let chain = TransformChain::standard();
        let ctx = TransformContext::new("contacts", "en-US");
        let inputs = [
            ("  Jon \t Smith ", DataType::Text),
            (" (555) 123-4567 ", DataType::Phone),
            ("Mixed@Example.COM ", DataType::Email),
            ("03/04/2021", DataType::Date),
            (" 42 ", DataType::Integer),
            ("yes", DataType::Boolean),
        ];
        for (raw, hint) in inputs {
            let once = chain
                .apply_value(FieldValue::from(raw), hint, &ctx.for_field("f"))
                .unwrap();
            let twice = chain
                .apply_value(once.clone(), hint, &ctx.for_field("f"))
                .unwrap();
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_transform_error_names_field() {
        let chain = TransformChain::standard();
        let ctx = TransformContext::new("contacts", "en-US");
        let legacy = record(&[("Since", "not a date")]);
        let err = chain
            .apply_record(&legacy, &contacts_mapping(), &ctx)
            .unwrap_err();
        assert_eq!(err.field, "customer_since");
        assert_eq!(err.step, "coerce_type");
        let migrate: MigrateError = err.into();
        assert_eq!(migrate.code(), "TRANSFORM_FAILED");
    }

    #[test]
    fn test_fingerprint_depends_on_steps() {
        let full = TransformChain::standard();
        let partial = TransformChain::new(STANDARD_TRANSFORM_VERSION).with_step(TrimWhitespace);
        assert_ne!(full.fingerprint(), partial.fingerprint());
        assert_eq!(full.fingerprint(), TransformChain::standard().fingerprint());
    }

    #[test]
    fn test_country_code_from_locale() {
        assert_eq!(TransformContext::new("c", "en-US").default_country_code(), Some("1"));
        assert_eq!(TransformContext::new("c", "de_DE").default_country_code(), Some("49"));
        assert_eq!(TransformContext::new("c", "xx").default_country_code(), None);
    }
}
