//! Capability-polymorphic key-value storage abstraction.
//!
//! A single [`Storage`] trait is implemented by five backend families
//! (`file`, `git`, `redis`, `mongo`, `postgres`) plus an [`auto`] selector
//! and an [`instrumented`] latency/error-recording wrapper. Optional
//! capabilities (cache, transactions, batch apply, plan audit, pool stats)
//! are advertised via [`StorageCapabilities`] and must fail with
//! [`crate::error::StorageError::Unsupported`] rather than be silently
//! emulated when a backend lacks them.

pub mod auto;
pub mod file;
pub mod git;
pub mod instrumented;
pub mod mirror;
pub mod mongo;
pub mod plan;
pub mod postgres;
pub mod redis;

pub use plan::{BatchApplyOptions, BatchApplyOutcome, BatchMutation, PlanMetaRecord, PlanStatus};

use crate::error::StorageError;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

bitflags! {
    /// Optional capabilities a backend may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StorageCapabilities: u32 {
        const CACHE        = 1 << 0;
        const TRANSACTIONS = 1 << 1;
        const BATCH_APPLY  = 1 << 2;
        const PLAN_AUDIT   = 1 << 3;
        const POOL_STATS   = 1 << 4;
    }
}

/// Result of a health check against a backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageHealth {
    pub healthy: bool,
    pub detail: Option<String>,
}

impl StorageHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Pool-level statistics (optional capability).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub in_use: u32,
    pub idle: u32,
    pub max_size: u32,
}

/// Snapshot of everything an `export_data`/`import_data` round-trip carries.
/// Usage counters are intentionally excluded (see testable property 5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportedData {
    pub credentials: Vec<(String, Value)>,
    pub configs: Vec<(String, Value)>,
}

/// The durable KV contract shared by every backend. All operations are
/// keyed within one of the entity families described in the storage
/// section: `credentials`, `configs`, `usage`, and the optional `cache`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Capability flags this instance advertises.
    fn capabilities(&self) -> StorageCapabilities;

    /// Short backend name, used in logs and `/healthz`.
    fn name(&self) -> &'static str;

    async fn initialize(&self) -> Result<(), StorageError>;
    async fn close(&self) -> Result<(), StorageError>;
    async fn health(&self) -> StorageHealth;

    // -- credentials ---------------------------------------------------
    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError>;
    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError>;
    async fn delete_credential(&self, id: &str) -> Result<(), StorageError>;
    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError>;

    async fn batch_get_credentials(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Option<Value>)>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push((id.clone(), self.get_credential(id).await?));
        }
        Ok(out)
    }

    async fn batch_set_credentials(&self, items: Vec<(String, Value)>) -> Result<(), StorageError> {
        for (id, value) in items {
            self.set_credential(&id, value).await?;
        }
        Ok(())
    }

    async fn batch_delete_credentials(&self, ids: &[String]) -> Result<(), StorageError> {
        for id in ids {
            self.delete_credential(id).await?;
        }
        Ok(())
    }

    // -- configs ---------------------------------------------------------
    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete_config(&self, key: &str) -> Result<(), StorageError>;
    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError>;

    // -- usage -------------------------------------------------------------
    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError>;
    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError>;
    async fn reset_usage(&self, key: &str) -> Result<(), StorageError>;
    async fn list_usage(&self) -> Result<Vec<String>, StorageError>;

    // -- cache (optional) --------------------------------------------------
    async fn cache_get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Err(StorageError::Unsupported("cache_get"))
    }

    async fn cache_set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("cache_set"))
    }

    async fn cache_delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("cache_delete"))
    }

    // -- transactions (optional) --------------------------------------------
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Err(StorageError::Unsupported("begin"))
    }

    // -- bulk data -----------------------------------------------------------
    async fn export_data(&self) -> Result<ExportedData, StorageError> {
        Ok(ExportedData {
            credentials: self.list_credentials().await?,
            configs: self.list_configs().await?,
        })
    }

    async fn import_data(&self, data: ExportedData) -> Result<(), StorageError> {
        self.batch_set_credentials(data.credentials).await?;
        for (key, value) in data.configs {
            self.set_config(&key, value).await?;
        }
        Ok(())
    }

    // -- two-phase idempotent batch apply (optional) -------------------------
    async fn apply_config_batch(
        &self,
        _mutations: Vec<BatchMutation>,
        _opts: BatchApplyOptions,
    ) -> Result<BatchApplyOutcome, StorageError> {
        Err(StorageError::Unsupported("apply_config_batch"))
    }

    // -- stats (optional) ------------------------------------------------------
    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Err(StorageError::Unsupported("pool_stats"))
    }

    // -- plan audit (optional) --------------------------------------------------
    /// Commit history for `apply_config_batch`, newest first. Only backends
    /// advertising [`StorageCapabilities::PLAN_AUDIT`] implement this.
    async fn list_plan_meta(&self) -> Result<Vec<PlanMetaRecord>, StorageError> {
        Err(StorageError::Unsupported("list_plan_meta"))
    }

    /// Deletes plan-meta records started more than `older_than_days` days
    /// ago. Returns the number of records removed.
    async fn prune_plan_meta(&self, _older_than_days: i64) -> Result<u64, StorageError> {
        Err(StorageError::Unsupported("prune_plan_meta"))
    }
}

/// A unit of work spanning credentials and configs, committed or rolled
/// back as a whole. Only backends advertising [`StorageCapabilities::TRANSACTIONS`]
/// implement [`Storage::begin`].
#[async_trait]
pub trait Transaction: Send {
    async fn get_credential(&mut self, id: &str) -> Result<Option<Value>, StorageError>;
    async fn set_credential(&mut self, id: &str, value: Value) -> Result<(), StorageError>;
    async fn delete_credential(&mut self, id: &str) -> Result<(), StorageError>;
    async fn get_config(&mut self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set_config(&mut self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete_config(&mut self, key: &str) -> Result<(), StorageError>;
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Normalizes a raw credential id into the filename/key form used by the
/// file backend and the storage mirror: lowercased, spaces replaced with
/// `-`, path separators and `..` segments stripped so the result is always
/// a single flat filename (never escapes the directory it's joined into),
/// `.json` appended if missing.
pub fn normalize_credential_filename(id: &str) -> String {
    let lower = id.to_lowercase().replace(' ', "-");
    let flat: String = lower
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".." && *segment != ".")
        .collect::<Vec<_>>()
        .join("-");
    if flat.ends_with(".json") {
        flat
    } else {
        format!("{flat}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_filenames() {
        assert_eq!(normalize_credential_filename("Cred A"), "cred-a.json");
        assert_eq!(normalize_credential_filename("cred.json"), "cred.json");
        assert_eq!(normalize_credential_filename("../etc/passwd"), "etc-passwd.json");
        assert_eq!(normalize_credential_filename("../../secret"), "secret.json");
    }
}
