use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPoolOptions, PgRow};

use crate::LedgerError;
use crate::store::{Record, RecordStore};

#[derive(Clone)]
pub struct PgRecordStore {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl PgRecordStore {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &PgRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        id: row.try_get::<String, _>("record_id")?,
        version: row.try_get::<i64, _>("version")?,
        body: row.try_get::<Value, _>("body")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<Record, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO airlock_records (collection, record_id, version, body) VALUES ($1, $2, 1, $3) ON CONFLICT (collection, record_id) DO NOTHING RETURNING record_id, version, body, created_at",
            )
            .bind(collection)
            .bind(id)
            .bind(&body)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        match row {
            Some(row) => Ok(record_from_row(&row)?),
            None => Err(LedgerError::Duplicate {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn select_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT record_id, version, body, created_at FROM airlock_records WHERE collection = $1 AND record_id = $2",
            )
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn select_by_filter(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>, LedgerError> {
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT record_id, version, body, created_at FROM airlock_records WHERE collection = $1 AND body -> $2 = $3 ORDER BY record_id",
            )
            .bind(collection)
            .bind(field)
            .bind(value)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Option<Record>, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "UPDATE airlock_records SET body = $4, version = version + 1 WHERE collection = $1 AND record_id = $2 AND version = $3 RETURNING record_id, version, body, created_at",
            )
            .bind(collection)
            .bind(id)
            .bind(expected_version)
            .bind(&body)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
