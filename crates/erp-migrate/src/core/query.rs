//! Parameterized legacy queries and extraction filters.
//!
//! Every legacy read is expressed as a [`Query`]: statement text with
//! positional placeholders (`$1`, `$2`, ...) plus the bound values. Values are
//! never concatenated into the text; only validated, quoted identifiers are.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::cursor::Cursor;
use super::identifier::quote_ident;
use super::value::FieldValue;
use crate::error::{MigrateError, Result};

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Statement text with positional placeholders.
    pub text: String,

    /// Values bound to the placeholders, in order.
    pub params: Vec<FieldValue>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder.
    pub fn bind(&mut self, value: FieldValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

/// Comparison operator for a [`LegacyFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    IsNotNull,
    In,
}

impl FilterOp {
    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::IsNull => "IS NULL",
            FilterOp::IsNotNull => "IS NOT NULL",
            FilterOp::In => "IN",
        }
    }
}

/// A row filter applied to legacy extraction.
///
/// Values are plain JSON scalars so filters read naturally in YAML config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyFilter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
}

impl LegacyFilter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: serde_json::Value) -> Self {
        Self {
            column: column.into(),
            op,
            value: Some(value),
            values: Vec::new(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::IsNull,
            value: None,
            values: Vec::new(),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::In,
            value: None,
            values,
        }
    }

    fn operand(&self) -> Result<FieldValue> {
        self.value
            .as_ref()
            .map(FieldValue::from_json)
            .ok_or_else(|| {
                MigrateError::Config(format!(
                    "filter on '{}' with operator {:?} requires a value",
                    self.column, self.op
                ))
            })
    }

    /// Render as a SQL predicate, binding operands into `query`.
    fn render(&self, query: &mut Query) -> Result<String> {
        let column = quote_ident(&self.column)?;
        match self.op {
            FilterOp::IsNull | FilterOp::IsNotNull => Ok(format!("{} {}", column, self.op.sql())),
            FilterOp::In => {
                if self.values.is_empty() {
                    return Err(MigrateError::Config(format!(
                        "IN filter on '{}' requires at least one value",
                        self.column
                    )));
                }
                let placeholders: Vec<String> = self
                    .values
                    .iter()
                    .map(|v| query.bind(FieldValue::from_json(v)))
                    .collect();
                Ok(format!("{} IN ({})", column, placeholders.join(", ")))
            }
            op => {
                let placeholder = query.bind(self.operand()?);
                Ok(format!("{} {} {}", column, op.sql(), placeholder))
            }
        }
    }

    /// Evaluate the filter against an in-memory value.
    ///
    /// Comparisons between NULL and anything are false, as in SQL.
    pub fn matches(&self, value: &FieldValue) -> bool {
        match self.op {
            FilterOp::IsNull => value.is_null(),
            FilterOp::IsNotNull => !value.is_null(),
            FilterOp::In => self
                .values
                .iter()
                .any(|v| compare_values(value, &FieldValue::from_json(v)) == Some(Ordering::Equal)),
            op => {
                let Some(operand) = self.value.as_ref().map(FieldValue::from_json) else {
                    return false;
                };
                match compare_values(value, &operand) {
                    Some(ord) => match op {
                        FilterOp::Eq => ord == Ordering::Equal,
                        FilterOp::Ne => ord != Ordering::Equal,
                        FilterOp::Gt => ord == Ordering::Greater,
                        FilterOp::Gte => ord != Ordering::Less,
                        FilterOp::Lt => ord == Ordering::Less,
                        FilterOp::Lte => ord != Ordering::Greater,
                        _ => false,
                    },
                    None => false,
                }
            }
        }
    }
}

/// Order two field values of compatible types.
///
/// Returns `None` when either side is NULL or the types cannot be compared.
pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    use rust_decimal::prelude::ToPrimitive;
    use FieldValue::*;
    match (a, b) {
        (Null, _) | (_, Null) => None,
        (Int(x), Int(y)) => Some(x.cmp(y)),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)),
        (Float(x), Float(y)) => x.partial_cmp(y),
        (Decimal(x), Decimal(y)) => Some(x.cmp(y)),
        (Decimal(x), Int(y)) => Some(x.cmp(&rust_decimal::Decimal::from(*y))),
        (Int(x), Decimal(y)) => Some(rust_decimal::Decimal::from(*x).cmp(y)),
        (Decimal(x), Float(y)) => x.to_f64()?.partial_cmp(y),
        (Float(x), Decimal(y)) => x.partial_cmp(&y.to_f64()?),
        (Bool(x), Bool(y)) => Some(x.cmp(y)),
        (Date(x), Date(y)) => Some(x.cmp(y)),
        (DateTime(x), DateTime(y)) => Some(x.cmp(y)),
        (Uuid(x), Uuid(y)) => Some(x.cmp(y)),
        (Text(x), Text(y)) => Some(x.cmp(y)),
        // Legacy text against a typed operand: compare textual forms.
        (Text(x), other) | (other, Text(x)) => {
            let other = other.to_string();
            let ord = x.as_str().cmp(other.as_str());
            if matches!(a, Text(_)) {
                Some(ord)
            } else {
                Some(ord.reverse())
            }
        }
        _ => None,
    }
}

/// Builds the page query used by SQL-backed legacy connectors.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    id_column: String,
    timestamp_column: Option<String>,
    filters: Vec<LegacyFilter>,
    limit: usize,
}

impl QueryBuilder {
    /// Start a keyset-paginated select over `table`.
    pub fn select(table: impl Into<String>, id_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            id_column: id_column.into(),
            timestamp_column: None,
            filters: Vec::new(),
            limit: 1000,
        }
    }

    /// Restrict the projection (default: `*`).
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Column used by composite (timestamp, id) cursors.
    pub fn timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = Some(column.into());
        self
    }

    pub fn filters(mut self, filters: &[LegacyFilter]) -> Self {
        self.filters.extend_from_slice(filters);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Build the query that reads the page after `cursor`.
    pub fn build(&self, cursor: &Cursor) -> Result<Query> {
        let mut query = Query::new(String::new());
        let id = quote_ident(&self.id_column)?;

        let projection = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        let mut predicates = Vec::with_capacity(self.filters.len() + 1);
        for filter in &self.filters {
            predicates.push(filter.render(&mut query)?);
        }

        let mut order_by = id.clone();
        let mut offset = None;
        match cursor {
            Cursor::Start => {}
            Cursor::LastId { id: last } => {
                let p = query.bind(FieldValue::Text(last.clone()));
                predicates.push(format!("{} > {}", id, p));
            }
            Cursor::Offset { offset: o } => offset = Some(*o),
            Cursor::Composite { timestamp, id: last } => {
                let ts_col = self.timestamp_column.as_deref().ok_or_else(|| {
                    MigrateError::Config(
                        "composite cursor requires a timestamp column".to_string(),
                    )
                })?;
                let ts = quote_ident(ts_col)?;
                let p_ts = query.bind(FieldValue::DateTime(*timestamp));
                let p_id = query.bind(FieldValue::Text(last.clone()));
                predicates.push(format!(
                    "({ts} > {p_ts} OR ({ts} = {p_ts} AND {id} > {p_id}))"
                ));
                order_by = format!("{}, {}", ts, id);
            }
            Cursor::Token { .. } => {
                return Err(MigrateError::Config(
                    "opaque cursor tokens are resolved by the connector, not by SQL".to_string(),
                ))
            }
            Cursor::End => {
                return Err(MigrateError::Config(
                    "cannot build a page query past the end of the source".to_string(),
                ))
            }
        }

        let mut text = format!("SELECT {} FROM {}", projection, quote_ident(&self.table)?);
        if !predicates.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&predicates.join(" AND "));
        }
        text.push_str(&format!(" ORDER BY {}", order_by));
        let p_limit = query.bind(FieldValue::Int(self.limit as i64));
        text.push_str(&format!(" LIMIT {}", p_limit));
        if let Some(o) = offset {
            let p_offset = query.bind(FieldValue::Int(o as i64));
            text.push_str(&format!(" OFFSET {}", p_offset));
        }

        query.text = text;
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_page_query() {
        let q = QueryBuilder::select("tblContacts", "ContactID")
            .limit(500)
            .build(&Cursor::Start)
            .unwrap();
        assert_eq!(
            q.text,
            "SELECT * FROM \"tblContacts\" ORDER BY \"ContactID\" LIMIT $1"
        );
        assert_eq!(q.params, vec![FieldValue::Int(500)]);
    }

    #[test]
    fn test_keyset_query_binds_cursor_value() {
        let q = QueryBuilder::select("contacts", "id")
            .columns(["id", "name"])
            .filters(&[LegacyFilter::new("status", FilterOp::Eq, json!("active"))])
            .limit(10)
            .build(&Cursor::LastId { id: "C-7'; DROP TABLE x; --".into() })
            .unwrap();
        assert_eq!(
            q.text,
            "SELECT \"id\", \"name\" FROM \"contacts\" WHERE \"status\" = $1 AND \"id\" > $2 ORDER BY \"id\" LIMIT $3"
        );
        assert!(!q.text.contains("DROP"));
        assert_eq!(q.params[1], FieldValue::Text("C-7'; DROP TABLE x; --".into()));
    }

    #[test]
    fn test_offset_query() {
        let q = QueryBuilder::select("items", "id")
            .limit(100)
            .build(&Cursor::Offset { offset: 300 })
            .unwrap();
        assert!(q.text.ends_with("LIMIT $1 OFFSET $2"));
        assert_eq!(q.params, vec![FieldValue::Int(100), FieldValue::Int(300)]);
    }

    #[test]
    fn test_composite_requires_timestamp_column() {
        let cursor = Cursor::Composite {
            timestamp: chrono::Utc::now(),
            id: "1".into(),
        };
        assert!(QueryBuilder::select("t", "id").build(&cursor).is_err());
        let q = QueryBuilder::select("t", "id")
            .timestamp_column("modified")
            .build(&cursor)
            .unwrap();
        assert!(q.text.contains("ORDER BY \"modified\", \"id\""));
    }

    #[test]
    fn test_in_filter_renders_placeholders() {
        let q = QueryBuilder::select("t", "id")
            .filters(&[LegacyFilter::is_in("region", vec![json!("EU"), json!("US")])])
            .build(&Cursor::Start)
            .unwrap();
        assert!(q.text.contains("\"region\" IN ($1, $2)"));
    }

    #[test]
    fn test_filter_matches_in_memory() {
        let f = LegacyFilter::new("age", FilterOp::Gte, json!(18));
        assert!(f.matches(&FieldValue::Int(18)));
        assert!(!f.matches(&FieldValue::Int(17)));
        assert!(!f.matches(&FieldValue::Null));
        assert!(LegacyFilter::is_null("x").matches(&FieldValue::Null));
    }

    #[test]
    fn test_end_cursor_cannot_be_queried() {
        assert!(QueryBuilder::select("t", "id").build(&Cursor::End).is_err());
    }
}
