//! Legacy connector over a JSON fixture file.
//!
//! ```json
//! {
//!   "tables": [
//!     {
//!       "name": "legacy_contacts",
//!       "columns": [{ "name": "id", "data_type": "int", "nullable": false }],
//!       "rows": [{ "id": 1, "full_name": "Jon Smith" }]
//!     }
//!   ]
//! }
//! ```
//!
//! Rows are served in id order. Keyset (`LastId`) and offset cursors are
//! supported.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

use crate::core::cursor::Cursor;
use crate::core::query::compare_values;
use crate::core::schema::{LegacyColumn, LegacySchema};
use crate::core::traits::{LegacyConnector, Page, PageRequest};
use crate::core::value::{FieldValue, LegacyRecord, Record};
use crate::error::{ErrorClass, MigrateError, Result};

/// Column declared in a fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureColumn {
    pub name: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_data_type() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

/// One legacy table. Columns are inferred from the rows when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<FixtureColumn>,
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Fixture document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyFixture {
    pub tables: Vec<FixtureTable>,
}

/// Connector serving rows from a [`LegacyFixture`].
#[derive(Debug, Clone)]
pub struct JsonFileConnector {
    name: String,
    tables: HashMap<String, FixtureTable>,
}

impl JsonFileConnector {
    /// Load a fixture file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let fixture: LegacyFixture = serde_json::from_str(&content)?;
        let mut connector = Self::from_fixture(fixture);
        connector.name = format!("json:{}", path.display());
        Ok(connector)
    }

    pub fn from_fixture(fixture: LegacyFixture) -> Self {
        Self {
            name: "json:memory".to_string(),
            tables: fixture
                .tables
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        }
    }

    fn table(&self, name: &str) -> Result<&FixtureTable> {
        self.tables.get(name).ok_or_else(|| MigrateError::Connector {
            message: format!("table '{}' not found in {}", name, self.name),
            class: ErrorClass::Permanent,
        })
    }
}

/// Ordering key for legacy ids: numeric when the id parses as an integer.
fn id_key(id: &str) -> FieldValue {
    id.parse::<i64>()
        .map(FieldValue::Int)
        .unwrap_or_else(|_| FieldValue::Text(id.to_string()))
}

fn cmp_ids(a: &str, b: &str) -> Ordering {
    compare_values(&id_key(a), &id_key(b)).unwrap_or_else(|| a.cmp(b))
}

fn legacy_id_of(row: &Record, id_column: &str) -> Option<String> {
    match row.get(id_column)? {
        FieldValue::Null => None,
        FieldValue::Text(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl LegacyConnector for JsonFileConnector {
    async fn introspect(&self, table: &str) -> Result<LegacySchema> {
        let fixture = self.table(table)?;
        let columns = if fixture.columns.is_empty() {
            let names: BTreeSet<&String> = fixture.rows.iter().flat_map(|r| r.keys()).collect();
            names
                .into_iter()
                .map(|name| LegacyColumn::new(name.clone(), default_data_type()))
                .collect()
        } else {
            fixture
                .columns
                .iter()
                .map(|c| LegacyColumn {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    nullable: c.nullable,
                })
                .collect()
        };
        Ok(LegacySchema::new(table, columns))
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let fixture = self.table(&request.table)?;

        let mut rows: Vec<LegacyRecord> = Vec::new();
        for raw in &fixture.rows {
            let fields: Record = raw
                .iter()
                .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                .collect();
            let Some(legacy_id) = legacy_id_of(&fields, &request.id_column) else {
                return Err(MigrateError::Connector {
                    message: format!(
                        "row in '{}' has no value for id column '{}'",
                        request.table, request.id_column
                    ),
                    class: ErrorClass::Permanent,
                });
            };
            let record = LegacyRecord::new(legacy_id, fields);
            if request
                .filters
                .iter()
                .all(|f| f.matches(record.get(&f.column)))
            {
                rows.push(record);
            }
        }
        rows.sort_by(|a, b| cmp_ids(&a.legacy_id, &b.legacy_id));

        let start = match &request.cursor {
            Cursor::Start => 0,
            Cursor::Offset { offset } => (*offset as usize).min(rows.len()),
            Cursor::LastId { id } => rows
                .iter()
                .position(|r| cmp_ids(&r.legacy_id, id) == Ordering::Greater)
                .unwrap_or(rows.len()),
            Cursor::End => rows.len(),
            other => {
                return Err(MigrateError::Connector {
                    message: format!("cursor kind '{}' not supported by {}", other.kind(), self.name),
                    class: ErrorClass::Permanent,
                })
            }
        };
        let end = (start + request.limit.max(1)).min(rows.len());
        let page: Vec<LegacyRecord> = rows[start..end].to_vec();

        let next_cursor = if end >= rows.len() {
            Cursor::End
        } else {
            match &request.cursor {
                Cursor::Offset { .. } => Cursor::Offset { offset: end as u64 },
                _ => Cursor::LastId {
                    id: rows[end - 1].legacy_id.clone(),
                },
            }
        };
        debug!(
            "Fetched {} rows from {} ({} -> {})",
            page.len(),
            request.table,
            request.cursor,
            next_cursor
        );
        Ok(Page {
            rows: page,
            next_cursor,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{FilterOp, LegacyFilter};
    use serde_json::json;

    fn connector() -> JsonFileConnector {
        let fixture: LegacyFixture = serde_json::from_value(json!({
            "tables": [{
                "name": "legacy_contacts",
                "rows": [
                    { "id": 10, "name": "C", "active": true },
                    { "id": 2, "name": "A", "active": true },
                    { "id": 3, "name": "B", "active": false }
                ]
            }]
        }))
        .unwrap();
        JsonFileConnector::from_fixture(fixture)
    }

    fn request(cursor: Cursor, limit: usize) -> PageRequest {
        PageRequest {
            table: "legacy_contacts".into(),
            id_column: "id".into(),
            cursor,
            filters: Vec::new(),
            limit,
        }
    }

    #[tokio::test]
    async fn test_keyset_pages_in_numeric_order() {
        let c = connector();
        let first = c.fetch_page(&request(Cursor::Start, 2)).await.unwrap();
        let ids: Vec<&str> = first.rows.iter().map(|r| r.legacy_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert_eq!(first.next_cursor, Cursor::LastId { id: "3".into() });

        let second = c.fetch_page(&request(first.next_cursor, 2)).await.unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].legacy_id, "10");
        assert!(second.next_cursor.is_end());
    }

    #[tokio::test]
    async fn test_offset_cursor_and_filters() {
        let c = connector();
        let mut req = request(Cursor::Offset { offset: 0 }, 1);
        req.filters = vec![LegacyFilter::new("active", FilterOp::Eq, json!(true))];
        let page = c.fetch_page(&req).await.unwrap();
        assert_eq!(page.rows[0].legacy_id, "2");
        assert_eq!(page.next_cursor, Cursor::Offset { offset: 1 });
    }

    #[tokio::test]
    async fn test_introspect_infers_columns() {
        let schema = connector().introspect("legacy_contacts").await.unwrap();
        assert_eq!(schema.column_names(), vec!["active", "id", "name"]);
        let err = connector().introspect("missing").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
