//! Core data types and collaborator ports.
//!
//! - [`cursor`]: extraction resume points
//! - [`schema`]: legacy schema snapshots and entity mappings
//! - [`query`]: parameterized legacy queries and filters
//! - [`value`]: typed field values and records
//! - [`traits`]: ports to the legacy connector and the target store
//!
//! Everything here is plain data or an interface; the engine modules build
//! on top of it.

pub mod cursor;
pub mod identifier;
pub mod query;
pub mod schema;
pub mod traits;
pub mod value;

pub use cursor::Cursor;
pub use query::{FilterOp, LegacyFilter, Query, QueryBuilder};
pub use schema::{EntityMapping, FieldMapping, LegacyColumn, LegacySchema};
pub use traits::{
    CandidateLookup, CandidateQuery, CreateOutcome, LegacyConnector, Mutation, Page, PageRequest,
    ReservationOwner, TargetMutator, TargetStore,
};
pub use value::{DataType, FieldValue, LegacyRecord, Record, TargetRecord};
