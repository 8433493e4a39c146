//! In-memory target store, optionally persisted to a JSON file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::query::compare_values;
use crate::core::traits::{
    CandidateLookup, CandidateQuery, CreateOutcome, Mutation, ReservationOwner, TargetMutator,
    TargetStore,
};
use crate::core::value::{FieldValue, Record, TargetRecord};
use crate::error::{ErrorClass, MigrateError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TargetData {
    /// entity type -> id -> record
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, TargetRecord>>,
    /// `entity_type/id` -> holder
    #[serde(default)]
    reservations: BTreeMap<String, ReservationOwner>,
}

fn reservation_key(entity_type: &str, id: &str) -> String {
    format!("{}/{}", entity_type, id)
}

/// Target store backed by a map. Implements [`TargetStore`],
/// [`CandidateLookup`] and [`TargetMutator`].
///
/// Reservations are checked and inserted under one write lock, so two
/// concurrent claims on the same identity cannot both succeed.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    data: RwLock<TargetData>,
    path: Option<PathBuf>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            TargetData::default()
        };
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a pre-existing target record (fixtures, tests).
    pub async fn seed(
        &self,
        entity_type: &str,
        id: &str,
        fields: Record,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut data = self.data.write().await;
        data.records.entry(entity_type.to_string()).or_default().insert(
            id.to_string(),
            TargetRecord {
                id: id.to_string(),
                entity_type: entity_type.to_string(),
                fields,
                created_at,
            },
        );
        self.persist(&data)
    }

    /// All records of an entity type, ordered by id.
    pub async fn records(&self, entity_type: &str) -> Vec<TargetRecord> {
        self.data
            .read()
            .await
            .records
            .get(entity_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current holder of a reservation.
    pub async fn reservation(&self, entity_type: &str, id: &str) -> Option<ReservationOwner> {
        self.data
            .read()
            .await
            .reservations
            .get(&reservation_key(entity_type, id))
            .cloned()
    }

    fn persist(&self, data: &TargetData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(data)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn text_eq(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => compare_values(a, b) == Some(Ordering::Equal),
    }
}

#[async_trait]
impl CandidateLookup for MemoryTargetStore {
    async fn find_candidates(&self, entity_type: &str, query: &CandidateQuery) -> Result<Vec<TargetRecord>> {
        let data = self.data.read().await;
        let Some(records) = data.records.get(entity_type) else {
            return Ok(Vec::new());
        };
        let found = records
            .values()
            .filter(|record| match query {
                CandidateQuery::Equals { field, value } => text_eq(record.get(field), value),
                CandidateQuery::Prefix { field, prefix } => record
                    .get(field)
                    .as_text()
                    .is_some_and(|t| t.to_lowercase().starts_with(&prefix.to_lowercase())),
            })
            .cloned()
            .collect();
        Ok(found)
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<TargetRecord>> {
        Ok(self
            .data
            .read()
            .await
            .records
            .get(entity_type)
            .and_then(|m| m.get(id))
            .cloned())
    }

    async fn reserve(&self, entity_type: &str, id: &str, owner: &ReservationOwner) -> Result<()> {
        let mut data = self.data.write().await;
        let key = reservation_key(entity_type, id);
        match data.reservations.get(&key) {
            Some(holder) if holder == owner => Ok(()),
            Some(holder) => Err(MigrateError::ReservationConflict {
                entity_type: entity_type.to_string(),
                target_id: id.to_string(),
                holder: holder.clone(),
            }),
            None => {
                data.reservations.insert(key, owner.clone());
                self.persist(&data)
            }
        }
    }

    async fn create(&self, entity_type: &str, id: &str, fields: &Record) -> Result<CreateOutcome> {
        let mut data = self.data.write().await;
        let records = data.records.entry(entity_type.to_string()).or_default();
        if records.contains_key(id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(
            id.to_string(),
            TargetRecord {
                id: id.to_string(),
                entity_type: entity_type.to_string(),
                fields: fields.clone(),
                created_at: Utc::now(),
            },
        );
        self.persist(&data)?;
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, entity_type: &str, id: &str, fields: &Record) -> Result<()> {
        let mut data = self.data.write().await;
        let record = data
            .records
            .get_mut(entity_type)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| {
                MigrateError::load(entity_type, id, "target record not found", ErrorClass::Permanent)
            })?;
        record.fields = fields.clone();
        self.persist(&data)
    }
}

#[async_trait]
impl TargetMutator for MemoryTargetStore {
    async fn mutate(&self, mutation: &Mutation) -> Result<()> {
        let mut data = self.data.write().await;
        match mutation {
            Mutation::Restore { entity_type, id, fields } => {
                debug!("Restoring {}/{}", entity_type, id);
                let records = data.records.entry(entity_type.clone()).or_default();
                match records.get_mut(id) {
                    Some(record) => record.fields = fields.clone(),
                    None => {
                        records.insert(
                            id.clone(),
                            TargetRecord {
                                id: id.clone(),
                                entity_type: entity_type.clone(),
                                fields: fields.clone(),
                                created_at: Utc::now(),
                            },
                        );
                    }
                }
            }
            Mutation::Delete { entity_type, id } => {
                debug!("Deleting {}/{}", entity_type, id);
                if let Some(records) = data.records.get_mut(entity_type) {
                    records.remove(id);
                }
                data.reservations.remove(&reservation_key(entity_type, id));
            }
        }
        self.persist(&data)
    }
}
