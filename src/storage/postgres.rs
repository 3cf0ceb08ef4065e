//! Postgres storage backend: one table per entity family; natively
//! transactional via `sqlx::Transaction`.

use super::{
    ExportedData, PoolStats, Storage, StorageCapabilities, StorageHealth, Transaction as StorageTransaction,
};
use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

pub struct PostgresStorage {
    pool: PgPool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS configs (
    key TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS usage_counters (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (key, field)
);
"#;

impl PostgresStorage {
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(dsn)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::TRANSACTIONS | StorageCapabilities::POOL_STATS
    }

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.migrate().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }

    async fn health(&self) -> StorageHealth {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => StorageHealth::ok(),
            Err(e) => StorageHealth::unhealthy(e.to_string()),
        }
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query("SELECT value FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO credentials (id, value) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET value = excluded.value",
        )
        .bind(id)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let rows = sqlx::query("SELECT id, value FROM credentials ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<Value, _>("value")))
            .collect())
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query("SELECT value FROM configs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO configs (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM configs WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let rows = sqlx::query("SELECT key, value FROM configs ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Value, _>("value")))
            .collect())
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO usage_counters (key, field, value) VALUES ($1, $2, $3) \
             ON CONFLICT (key, field) DO UPDATE SET value = usage_counters.value + excluded.value \
             RETURNING value",
        )
        .bind(key)
        .bind(field)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(row.get::<i64, _>("value"))
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let rows = sqlx::query("SELECT field, value FROM usage_counters WHERE key = $1")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<i64, _>("value")))
            .collect())
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM usage_counters WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT key FROM usage_counters ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    async fn export_data(&self) -> Result<ExportedData, StorageError> {
        Ok(ExportedData {
            credentials: self.list_credentials().await?,
            configs: self.list_configs().await?,
        })
    }

    async fn import_data(&self, data: ExportedData) -> Result<(), StorageError> {
        for (id, value) in data.credentials {
            self.set_credential(&id, value).await?;
        }
        for (key, value) in data.configs {
            self.set_config(&key, value).await?;
        }
        Ok(())
    }

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Ok(PoolStats {
            in_use: self.pool.size() - self.pool.num_idle() as u32,
            idle: self.pool.num_idle() as u32,
            max_size: self.pool.size(),
        })
    }
}

struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
}

#[async_trait]
impl StorageTransaction for PostgresTransaction {
    async fn get_credential(&mut self, id: &str) -> Result<Option<Value>, StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        let row = sqlx::query("SELECT value FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn set_credential(&mut self, id: &str, value: Value) -> Result<(), StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        sqlx::query(
            "INSERT INTO credentials (id, value) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET value = excluded.value",
        )
        .bind(id)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_credential(&mut self, id: &str) -> Result<(), StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn get_config(&mut self, key: &str) -> Result<Option<Value>, StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        let row = sqlx::query("SELECT value FROM configs WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn set_config(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        sqlx::query(
            "INSERT INTO configs (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_config(&mut self, key: &str) -> Result<(), StorageError> {
        let tx = self.tx.as_mut().ok_or(StorageError::Unsupported("transaction already closed"))?;
        sqlx::query("DELETE FROM configs WHERE key = $1")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::Unsupported("transaction already closed"))?;
        tx.commit().await.map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::Unsupported("transaction already closed"))?;
        tx.rollback().await.map_err(|e| StorageError::Write(e.to_string()))
    }
}
