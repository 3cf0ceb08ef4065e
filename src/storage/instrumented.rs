//! Transparent instrumentation wrapper: records per-operation latency and
//! error counts via the `metrics` crate, and forwards pool stats when the
//! wrapped backend supports it. The wrapped contract is unchanged.

use super::{
    BatchApplyOptions, BatchApplyOutcome, BatchMutation, ExportedData, PoolStats, Storage,
    StorageCapabilities, StorageHealth, Transaction,
};
use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct InstrumentedStorage {
    inner: Arc<dyn Storage>,
}

impl InstrumentedStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }

    async fn timed<T, E>(&self, op: &'static str, fut: impl std::future::Future<Output = Result<T, E>>) -> Result<T, E>
    where
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        let backend = self.inner.name();
        metrics::histogram!("storage_operation_duration_seconds", "backend" => backend, "op" => op)
            .record(elapsed.as_secs_f64());
        if let Err(e) = &result {
            metrics::counter!("storage_operation_errors_total", "backend" => backend, "op" => op)
                .increment(1);
            tracing::debug!(backend, op, error = %e, "storage operation failed");
        }
        result
    }
}

#[async_trait]
impl Storage for InstrumentedStorage {
    fn capabilities(&self) -> StorageCapabilities {
        self.inner.capabilities()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.timed("initialize", self.inner.initialize()).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.timed("close", self.inner.close()).await
    }

    async fn health(&self) -> StorageHealth {
        self.inner.health().await
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        self.timed("get_credential", self.inner.get_credential(id)).await
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        self.timed("set_credential", self.inner.set_credential(id, value)).await
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        self.timed("delete_credential", self.inner.delete_credential(id)).await
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        self.timed("list_credentials", self.inner.list_credentials()).await
    }

    async fn batch_get_credentials(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Option<Value>)>, StorageError> {
        self.timed("batch_get_credentials", self.inner.batch_get_credentials(ids))
            .await
    }

    async fn batch_set_credentials(&self, items: Vec<(String, Value)>) -> Result<(), StorageError> {
        self.timed("batch_set_credentials", self.inner.batch_set_credentials(items))
            .await
    }

    async fn batch_delete_credentials(&self, ids: &[String]) -> Result<(), StorageError> {
        self.timed("batch_delete_credentials", self.inner.batch_delete_credentials(ids))
            .await
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.timed("get_config", self.inner.get_config(key)).await
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.timed("set_config", self.inner.set_config(key, value)).await
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        self.timed("delete_config", self.inner.delete_config(key)).await
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        self.timed("list_configs", self.inner.list_configs()).await
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        self.timed("increment_usage", self.inner.increment_usage(key, field, delta))
            .await
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        self.timed("get_usage", self.inner.get_usage(key)).await
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        self.timed("reset_usage", self.inner.reset_usage(key)).await
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        self.timed("list_usage", self.inner.list_usage()).await
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.timed("cache_get", self.inner.cache_get(key)).await
    }

    async fn cache_set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.timed("cache_set", self.inner.cache_set(key, value, ttl)).await
    }

    async fn cache_delete(&self, key: &str) -> Result<(), StorageError> {
        self.timed("cache_delete", self.inner.cache_delete(key)).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        self.timed("begin", self.inner.begin()).await
    }

    async fn export_data(&self) -> Result<ExportedData, StorageError> {
        self.timed("export_data", self.inner.export_data()).await
    }

    async fn import_data(&self, data: ExportedData) -> Result<(), StorageError> {
        self.timed("import_data", self.inner.import_data(data)).await
    }

    async fn apply_config_batch(
        &self,
        mutations: Vec<BatchMutation>,
        opts: BatchApplyOptions,
    ) -> Result<BatchApplyOutcome, StorageError> {
        self.timed("apply_config_batch", self.inner.apply_config_batch(mutations, opts))
            .await
    }

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        self.timed("pool_stats", self.inner.pool_stats()).await
    }
}
