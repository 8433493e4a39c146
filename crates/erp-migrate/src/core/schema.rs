//! Legacy schema snapshots and entity mappings.
//!
//! The [`LegacySchema`] is produced by introspecting the legacy source once per
//! job and never changes afterwards. An [`EntityMapping`] declares how legacy
//! columns map onto target fields for one entity type.

use serde::{Deserialize, Serialize};

use super::query::LegacyFilter;
use super::value::DataType;

/// Column metadata as reported by the legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyColumn {
    /// Column name.
    pub name: String,

    /// Raw legacy data type (e.g., "varchar", "int", "datetime").
    pub data_type: String,

    /// Whether the column allows NULL.
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl LegacyColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Immutable snapshot of a legacy table's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySchema {
    /// Table name.
    pub table: String,

    /// Columns in ordinal order.
    pub columns: Vec<LegacyColumn>,
}

impl LegacySchema {
    pub fn new(table: impl Into<String>, columns: Vec<LegacyColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// Get the column names in ordinal order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Find a column by name (case-sensitive).
    pub fn column(&self, name: &str) -> Option<&LegacyColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check if the schema has a column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// How a single legacy column maps onto a target field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Legacy column name.
    pub source: String,

    /// Target field name.
    pub target: String,

    /// Normalization and coercion hint.
    #[serde(default)]
    pub data_type: DataType,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>, data_type: DataType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            data_type,
        }
    }
}

/// Declared mapping for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    /// Entity type key (selects the conflict detector).
    pub entity_type: String,

    /// Legacy table to extract from.
    pub table: String,

    /// Legacy column holding the record's identifier.
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Mapped columns.
    #[serde(default)]
    pub fields: Vec<FieldMapping>,

    /// Columns explicitly excluded from migration.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Extraction filters applied to every page.
    #[serde(default)]
    pub filters: Vec<LegacyFilter>,
}

impl EntityMapping {
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            id_column: default_id_column(),
            fields: Vec::new(),
            ignore: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Builder: add a field mapping.
    pub fn map(mut self, source: &str, target: &str, data_type: DataType) -> Self {
        self.fields.push(FieldMapping::new(source, target, data_type));
        self
    }

    /// Builder: mark a legacy column as ignored.
    pub fn ignore(mut self, column: &str) -> Self {
        self.ignore.push(column.to_string());
        self
    }

    /// Builder: set the id column.
    pub fn with_id_column(mut self, column: &str) -> Self {
        self.id_column = column.to_string();
        self
    }

    /// Find the mapping for a legacy column.
    pub fn field_for_source(&self, source: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.source == source)
    }

    /// Find the mapping that produces a target field.
    pub fn field_for_target(&self, target: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.target == target)
    }

    /// Check whether a legacy column is accounted for (mapped, ignored, or the id).
    pub fn covers(&self, column: &str) -> bool {
        column == self.id_column
            || self.field_for_source(column).is_some()
            || self.ignore.iter().any(|c| c == column)
    }
}

fn default_true() -> bool {
    true
}

fn default_id_column() -> String {
    "id".to_string()
}
