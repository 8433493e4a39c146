//! Field value types for legacy and target records.
//!
//! Legacy connectors hand over loosely typed values (mostly text); the
//! transform chain coerces them into typed [`FieldValue`]s before matching
//! and loading.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record's fields, ordered by field name.
pub type Record = BTreeMap<String, FieldValue>;

/// Type hint used by the transform chain to normalize and coerce a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Text,
    Integer,
    Decimal,
    Float,
    Boolean,
    Date,
    DateTime,
    Uuid,
    Email,
    Phone,
}

impl DataType {
    /// Map a raw legacy column type to the closest hint.
    pub fn from_legacy(data_type: &str) -> Self {
        match data_type.to_lowercase().as_str() {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "serial" => DataType::Integer,
            "decimal" | "numeric" | "money" | "smallmoney" => DataType::Decimal,
            "float" | "real" | "double" | "double precision" => DataType::Float,
            "bit" | "bool" | "boolean" => DataType::Boolean,
            "date" => DataType::Date,
            "datetime" | "datetime2" | "timestamp" | "timestamptz" | "smalldatetime" => {
                DataType::DateTime
            }
            "uniqueidentifier" | "uuid" | "guid" => DataType::Uuid,
            _ => DataType::Text,
        }
    }
}

/// Typed value of a single record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
}

impl FieldValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Borrow the text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Short type name used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::Text(_) => "text",
            FieldValue::Date(_) => "date",
            FieldValue::DateTime(_) => "datetime",
            FieldValue::Uuid(_) => "uuid",
        }
    }

    /// Plain JSON view of the value (no type tag).
    ///
    /// Decimals, dates and UUIDs become strings so the result is independent
    /// of float formatting.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Decimal(d) => Value::String(d.normalize().to_string()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => {
                Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            }
            FieldValue::Uuid(u) => Value::String(u.to_string()),
        }
    }

    /// Build a loosely typed value from plain JSON, as legacy fixtures and
    /// REST-style connectors deliver it.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null),
            },
            Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Text(s) => f.write_str(s),
            other => match other.to_json() {
                serde_json::Value::String(s) => f.write_str(&s),
                v => write!(f, "{}", v),
            },
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<Decimal> for FieldValue {
    fn from(v: Decimal) -> Self {
        FieldValue::Decimal(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Convert a record to a plain JSON object.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    serde_json::Value::Object(
        record
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// A record as extracted from the legacy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    /// Primary identifier in the legacy system.
    pub legacy_id: String,

    /// Raw column values keyed by legacy column name.
    pub fields: Record,
}

impl LegacyRecord {
    pub fn new(legacy_id: impl Into<String>, fields: Record) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            fields,
        }
    }

    /// Get a column value, treating missing columns as NULL.
    pub fn get(&self, column: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.fields.get(column).unwrap_or(&NULL)
    }
}

/// A record already present in the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: String,
    pub entity_type: String,
    pub fields: Record,
    pub created_at: DateTime<Utc>,
}

impl TargetRecord {
    pub fn get(&self, field: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(FieldValue::from_json(&serde_json::json!(42)), FieldValue::Int(42));
        assert_eq!(FieldValue::from_json(&serde_json::json!(1.5)), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from_json(&serde_json::json!(null)), FieldValue::Null);
    }

    #[test]
    fn test_to_json_decimal_is_normalized_string() {
        let d = Decimal::from_str("12.500").unwrap();
        assert_eq!(FieldValue::Decimal(d).to_json(), serde_json::json!("12.5"));
    }

    #[test]
    fn test_data_type_from_legacy() {
        assert_eq!(DataType::from_legacy("NVARCHAR"), DataType::Text);
        assert_eq!(DataType::from_legacy("bigint"), DataType::Integer);
        assert_eq!(DataType::from_legacy("datetime2"), DataType::DateTime);
        assert_eq!(DataType::from_legacy("money"), DataType::Decimal);
    }

    #[test]
    fn test_legacy_record_missing_column_is_null() {
        let record = LegacyRecord::new("L1", Record::new());
        assert!(record.get("email").is_null());
    }

    #[test]
    fn test_tagged_serialization_preserves_type() {
        let value = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let json = serde_json::to_string(&value).unwrap();
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
