//! Redis storage backend: hashes for configs and usage counters, a
//! per-key string for each credential, a separate TTL'd namespace for
//! cache entries, and a two-phase `apply_config_batch` built on a
//! `plan:meta:<key>` lock record.

use super::{
    BatchApplyOptions, BatchApplyOutcome, BatchMutation, ExportedData, PlanMetaRecord, PlanStatus,
    PoolStats, Storage, StorageCapabilities, StorageHealth,
};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const CREDENTIAL_PREFIX: &str = "cred:";
const CONFIG_HASH: &str = "configs";
const USAGE_PREFIX: &str = "usage:";
const CACHE_PREFIX: &str = "cache:";
const PLAN_META_PREFIX: &str = "plan:meta:";
/// TTL for a committed/failed plan-meta record, independent of (and much
/// longer than) the caller-supplied in-progress lock TTL: a client retrying
/// an idempotent `apply_config_batch` call days later should still see
/// `AlreadyCommitted` rather than silently re-running the mutations.
const PLAN_META_RECORD_TTL_SECS: u64 = 7 * 24 * 60 * 60;

pub struct RedisStorage {
    manager: ConnectionManager,
}

impl RedisStorage {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|e| StorageError::Write(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::CACHE | StorageCapabilities::BATCH_APPLY | StorageCapabilities::PLAN_AUDIT
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn health(&self) -> StorageHealth {
        let mut conn = self.conn();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => StorageHealth::ok(),
            Err(e) => StorageHealth::unhealthy(e.to_string()),
        }
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(format!("{CREDENTIAL_PREFIX}{id}"))
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(&value)?;
        conn.set::<_, _, ()>(format!("{CREDENTIAL_PREFIX}{id}"), raw)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(format!("{CREDENTIAL_PREFIX}{id}"))
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn
            .keys(format!("{CREDENTIAL_PREFIX}*"))
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches(CREDENTIAL_PREFIX).to_string();
            let raw: Option<String> = conn.get(&key).await.map_err(|e| StorageError::List(e.to_string()))?;
            if let Some(raw) = raw {
                out.push((id, serde_json::from_str(&raw)?));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .hget(CONFIG_HASH, key)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(&value)?;
        conn.hset::<_, _, _, ()>(CONFIG_HASH, key, raw)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(CONFIG_HASH, key)
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let mut conn = self.conn();
        let map: BTreeMap<String, String> = conn
            .hgetall(CONFIG_HASH)
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        map.into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
            .collect()
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let mut conn = self.conn();
        conn.hincr(format!("{USAGE_PREFIX}{key}"), field, delta)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let mut conn = self.conn();
        conn.hgetall(format!("{USAGE_PREFIX}{key}"))
            .await
            .map_err(|e| StorageError::Read(e.to_string()))
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(format!("{USAGE_PREFIX}{key}"))
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn
            .keys(format!("{USAGE_PREFIX}*"))
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        Ok(keys
            .into_iter()
            .map(|k| k.trim_start_matches(USAGE_PREFIX).to_string())
            .collect())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.conn();
        conn.get(format!("{CACHE_PREFIX}{key}"))
            .await
            .map_err(|e| StorageError::Read(e.to_string()))
    }

    async fn cache_set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(format!("{CACHE_PREFIX}{key}"), value, ttl.as_secs().max(1))
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn cache_delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(format!("{CACHE_PREFIX}{key}"))
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))
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

    async fn apply_config_batch(
        &self,
        mutations: Vec<BatchMutation>,
        opts: BatchApplyOptions,
    ) -> Result<BatchApplyOutcome, StorageError> {
        let mut conn = self.conn();
        let meta_key = format!("{PLAN_META_PREFIX}{}", opts.idempotency_key);
        let lock_ttl_secs = opts.ttl.as_secs().max(1);

        let mut record = PlanMetaRecord::in_progress(opts.idempotency_key.clone(), opts.stage.clone(), opts.ttl);
        let serialized = serde_json::to_string(&record)?;

        // Acquire the lock atomically (`SET key val NX EX ttl`) so two
        // concurrent callers with the same idempotency key can't both
        // observe "no record yet" and both proceed.
        let set_opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(lock_ttl_secs));
        let acquired: Option<String> = conn
            .set_options(&meta_key, serialized.clone(), set_opts)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;

        if acquired.is_none() {
            let raw: String = conn.get(&meta_key).await.map_err(|e| StorageError::Read(e.to_string()))?;
            let existing: PlanMetaRecord = serde_json::from_str(&raw)?;
            match existing.status {
                PlanStatus::Committed => return Ok(BatchApplyOutcome::AlreadyCommitted),
                PlanStatus::InProgress if !existing.is_expired(Utc::now()) => {
                    return Ok(BatchApplyOutcome::InProgress);
                }
                _ => {
                    // The existing record is an expired in-progress lock or
                    // a prior failure; take it over.
                    conn.set_ex::<_, _, ()>(&meta_key, &serialized, lock_ttl_secs)
                        .await
                        .map_err(|e| StorageError::Write(e.to_string()))?;
                }
            }
        }

        let mut snapshot = Vec::with_capacity(mutations.len());
        for m in &mutations {
            snapshot.push((m.key.clone(), self.get_config(&m.key).await?));
        }

        let mut applied = Vec::new();
        let mut failure: Option<String> = None;
        for m in &mutations {
            match self.set_config(&m.key, m.value.clone()).await {
                Ok(()) => applied.push(m.key.clone()),
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for (key, prior) in snapshot.into_iter().rev() {
                match prior {
                    Some(value) => {
                        let _ = self.set_config(&key, value).await;
                    }
                    None => {
                        let _ = self.delete_config(&key).await;
                    }
                }
            }
            record.mark_failed(err.clone());
            let _ = conn
                .set_ex::<_, _, ()>(&meta_key, serde_json::to_string(&record)?, PLAN_META_RECORD_TTL_SECS)
                .await;
            return Err(StorageError::BatchConflict(err));
        }

        let hash = super::plan::hash_mutations(&mutations);
        record.mark_committed(mutations.len(), hash);
        conn.set_ex::<_, _, ()>(&meta_key, serde_json::to_string(&record)?, PLAN_META_RECORD_TTL_SECS)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;

        Ok(BatchApplyOutcome::Committed {
            mutation_count: mutations.len(),
        })
    }

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Err(StorageError::Unsupported("pool_stats"))
    }

    async fn list_plan_meta(&self) -> Result<Vec<PlanMetaRecord>, StorageError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn
            .keys(format!("{PLAN_META_PREFIX}*"))
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StorageError::Read(e.to_string()))?;
            if let Some(raw) = raw {
                out.push(serde_json::from_str::<PlanMetaRecord>(&raw)?);
            }
        }
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }
}
