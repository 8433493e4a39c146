//! Ports to the collaborators the migration core depends on.
//!
//! - [`LegacyConnector`]: schema introspection and paged extraction
//! - [`CandidateLookup`]: read access to the target store, injected into detectors
//! - [`TargetStore`]: reservations and writes used by the pipeline
//! - [`TargetMutator`]: inverse mutations replayed by the rollback engine
//!
//! Production implementations live in the surrounding application; the
//! [`adapters`](crate::adapters) module ships in-memory and file-backed ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

use super::cursor::Cursor;
use super::query::LegacyFilter;
use super::schema::LegacySchema;
use super::value::{FieldValue, LegacyRecord, Record, TargetRecord};

/// Request for one page of legacy rows.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Legacy table.
    pub table: String,
    /// Column holding the legacy identifier.
    pub id_column: String,
    /// Resume point.
    pub cursor: Cursor,
    /// Row filters.
    pub filters: Vec<LegacyFilter>,
    /// Maximum rows to return.
    pub limit: usize,
}

/// One page of legacy rows plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<LegacyRecord>,
    /// [`Cursor::End`] when the source is exhausted.
    pub next_cursor: Cursor,
}

/// Read access to the legacy source.
#[async_trait]
pub trait LegacyConnector: Send + Sync {
    /// Describe a legacy table.
    async fn introspect(&self, table: &str) -> Result<LegacySchema>;

    /// Fetch the page after `request.cursor`.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Fetch a sample of rows for readiness checks.
    ///
    /// Default implementation reads the first page.
    async fn sample(
        &self,
        table: &str,
        id_column: &str,
        filters: &[LegacyFilter],
        limit: usize,
    ) -> Result<Vec<LegacyRecord>> {
        let page = self
            .fetch_page(&PageRequest {
                table: table.to_string(),
                id_column: id_column.to_string(),
                cursor: Cursor::Start,
                filters: filters.to_vec(),
                limit,
            })
            .await?;
        Ok(page.rows)
    }

    /// Connector name for logging.
    fn name(&self) -> &str;
}

/// A lookup against the target store issued by a conflict detector.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateQuery {
    /// Records whose `field` equals `value` (case-insensitive for text).
    Equals { field: String, value: FieldValue },
    /// Records whose `field` starts with `prefix` (case-insensitive).
    Prefix { field: String, prefix: String },
}

impl CandidateQuery {
    pub fn equals(field: impl Into<String>, value: FieldValue) -> Self {
        CandidateQuery::Equals {
            field: field.into(),
            value,
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        CandidateQuery::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }
}

/// Read-only candidate lookup injected into conflict detectors.
#[async_trait]
pub trait CandidateLookup: Send + Sync {
    async fn find_candidates(
        &self,
        entity_type: &str,
        query: &CandidateQuery,
    ) -> Result<Vec<TargetRecord>>;
}

/// Who holds a reservation on a target identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationOwner {
    pub job_id: String,
    pub legacy_id: String,
}

impl ReservationOwner {
    pub fn new(job_id: impl Into<String>, legacy_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            legacy_id: legacy_id.into(),
        }
    }
}

impl fmt::Display for ReservationOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.legacy_id)
    }
}

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A record with this id already exists (e.g., replay after a crash).
    AlreadyExists,
}

/// Write access to the target store used by the pipeline.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Fetch a record by id.
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<TargetRecord>>;

    /// Atomically claim a target identity.
    ///
    /// Succeeds if the identity is unclaimed or already held by `owner`;
    /// fails with [`MigrateError::ReservationConflict`](crate::MigrateError::ReservationConflict)
    /// if someone else holds it.
    async fn reserve(&self, entity_type: &str, id: &str, owner: &ReservationOwner) -> Result<()>;

    /// Insert a record unless one with `id` already exists.
    async fn create(&self, entity_type: &str, id: &str, fields: &Record) -> Result<CreateOutcome>;

    /// Overwrite an existing record's fields.
    async fn update(&self, entity_type: &str, id: &str, fields: &Record) -> Result<()>;
}

/// An inverse mutation replayed during rollback.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Restore a record to its captured prior state.
    Restore {
        entity_type: String,
        id: String,
        fields: Record,
    },
    /// Delete a record created by the job.
    Delete { entity_type: String, id: String },
}

impl Mutation {
    pub fn target_id(&self) -> &str {
        match self {
            Mutation::Restore { id, .. } | Mutation::Delete { id, .. } => id,
        }
    }
}

/// Target-store mutator injected into the rollback engine.
#[async_trait]
pub trait TargetMutator: Send + Sync {
    async fn mutate(&self, mutation: &Mutation) -> Result<()>;
}
