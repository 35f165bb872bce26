//! Record store abstraction
//!
//! Deployments, snapshots, approval requests, rollback requests and test
//! execution history all go through the [`RecordStore`] port. The core only
//! needs CRUD by id plus field-equality listing; durability is the store's
//! concern. [`InMemoryRecordStore`] is the default implementation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::ServiceError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => ServiceError::NotFound {
                resource: format!("{} {}", kind, id),
            },
            StoreError::AlreadyExists { .. } => ServiceError::Conflict {
                message: err.to_string(),
            },
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

/// An entity persisted through a [`RecordStore`]
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entity name used in error messages and logs
    const KIND: &'static str;

    fn id(&self) -> &str;
}

/// Field-equality filter evaluated against the serialized record
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    conditions: Vec<(String, serde_json::Value)>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`
    pub fn eq<V: Serialize>(mut self, field: &str, value: V) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.conditions.push((field.to_string(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check a record against every condition
    pub fn matches<T: Serialize>(&self, record: &T) -> Result<bool, StoreError> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        let value = serde_json::to_value(record)?;
        Ok(self.conditions.iter().all(|(field, expected)| {
            value.get(field).map(|actual| actual == expected).unwrap_or(false)
        }))
    }
}

#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    /// Insert a new record, failing if the id is taken
    async fn create(&self, record: T) -> Result<T, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// Replace an existing record, failing if it does not exist
    async fn update(&self, record: T) -> Result<T, StoreError>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<T>, StoreError>;

    /// Fetch a record or fail with [`StoreError::NotFound`]
    async fn require(&self, id: &str) -> Result<T, StoreError> {
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }
}

/// Process-local record store
pub struct InMemoryRecordStore<T> {
    records: RwLock<HashMap<String, T>>,
}

impl<T: Record> InMemoryRecordStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn new_arc() -> Arc<dyn RecordStore<T>> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl<T: Record> Default for InMemoryRecordStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> RecordStore<T> for InMemoryRecordStore<T> {
    async fn create(&self, record: T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(record.id()) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                id: record.id().to_string(),
            });
        }
        debug!("💾 Creating {} {}", T::KIND, record.id());
        records.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, record: T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(record.id()) {
            Some(existing) => {
                *existing = record.clone();
                Ok(record)
            }
            None => Err(StoreError::NotFound {
                kind: T::KIND,
                id: record.id().to_string(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<T>, StoreError> {
        let records = self.records.read().await;
        let mut matched = Vec::new();
        for record in records.values() {
            if filter.matches(record)? {
                matched.push(record.clone());
            }
        }
        Ok(matched)
    }
}

/// Per-id async locks
///
/// Read-modify-write sequences on a record hold the lock for that id so that
/// a pipeline run and a rollback touching the same deployment cannot lose
/// each other's updates. Different ids never contend.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting for any current holder
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop entries nobody is holding or waiting on
            locks.retain(|key, lock| key == id || Arc::strong_count(lock) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
