use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::LedgerError;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub version: i64,
    pub body: Value,
    pub created_at: DateTime<Utc>,
}

/// Opaque persistence collaborator: JSON bodies grouped by collection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<Record, LedgerError>;

    async fn select_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>, LedgerError>;

    /// Records whose top-level `field` equals `value`, ordered by id.
    async fn select_by_filter(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>, LedgerError>;

    /// Replaces the body when the stored version still equals
    /// `expected_version`. `None` when the record moved on or is missing.
    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Option<Record>, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;
}

/// Bounds a store call by `budget`; expiry becomes [`LedgerError::Timeout`].
pub async fn timed<T, F>(budget: Duration, fut: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| LedgerError::Timeout)?
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<Record, LedgerError> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(id) {
            return Err(LedgerError::Duplicate {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let record = Record {
            id: id.to_string(),
            version: 1,
            body,
            created_at: Utc::now(),
        };
        records.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn select_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>, LedgerError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn select_by_filter(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>, LedgerError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.body.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Option<Record>, LedgerError> {
        let mut collections = self.collections.write().await;
        let Some(record) = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
        else {
            return Ok(None);
        };
        if record.version != expected_version {
            return Ok(None);
        }

        record.version += 1;
        record.body = body;
        Ok(Some(record.clone()))
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
