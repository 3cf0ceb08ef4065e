//! MongoDB storage backend: one collection per entity family
//! (`credentials`, `configs`, `usage`), plus a `plan_meta` collection that
//! records every `apply_config_batch` attempt (locked/committed/failed)
//! keyed by `idempotency_key`.

use super::{
    BatchApplyOptions, BatchApplyOutcome, BatchMutation, ExportedData, PlanMetaRecord, PlanStatus,
    PoolStats, Storage, StorageCapabilities, StorageHealth,
};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{Document, doc};
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CredentialDoc {
    #[serde(rename = "_id")]
    id: String,
    value: Value,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ConfigDoc {
    #[serde(rename = "_id")]
    key: String,
    value: Value,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct UsageDoc {
    #[serde(rename = "_id")]
    key: String,
    #[serde(default)]
    counters: BTreeMap<String, i64>,
}

pub struct MongoStorage {
    db: Database,
}

impl MongoStorage {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(Self {
            db: client.database(database),
        })
    }

    fn credentials(&self) -> Collection<CredentialDoc> {
        self.db.collection("credentials")
    }

    fn configs(&self) -> Collection<ConfigDoc> {
        self.db.collection("configs")
    }

    fn usage(&self) -> Collection<UsageDoc> {
        self.db.collection("usage")
    }

    fn plan_meta(&self) -> Collection<Document> {
        self.db.collection("plan_meta")
    }
}

#[async_trait]
impl Storage for MongoStorage {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::BATCH_APPLY | StorageCapabilities::PLAN_AUDIT
    }

    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn health(&self) -> StorageHealth {
        match self.db.run_command(doc! {"ping": 1}).await {
            Ok(_) => StorageHealth::ok(),
            Err(e) => StorageHealth::unhealthy(e.to_string()),
        }
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        let doc = self
            .credentials()
            .find_one(doc! {"_id": id})
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(doc.map(|d| d.value))
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        self.credentials()
            .replace_one(
                doc! {"_id": id},
                CredentialDoc {
                    id: id.to_string(),
                    value,
                },
            )
            .upsert(true)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        self.credentials()
            .delete_one(doc! {"_id": id})
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        use futures::TryStreamExt;
        let mut cursor = self
            .credentials()
            .find(doc! {})
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(d) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            out.push((d.id, d.value));
        }
        Ok(out)
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let doc = self
            .configs()
            .find_one(doc! {"_id": key})
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(doc.map(|d| d.value))
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.configs()
            .replace_one(
                doc! {"_id": key},
                ConfigDoc {
                    key: key.to_string(),
                    value,
                },
            )
            .upsert(true)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        self.configs()
            .delete_one(doc! {"_id": key})
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        use futures::TryStreamExt;
        let mut cursor = self
            .configs()
            .find(doc! {})
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(d) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            out.push((d.key, d.value));
        }
        Ok(out)
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let mut doc = self
            .usage()
            .find_one(doc! {"_id": key})
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?
            .unwrap_or_else(|| UsageDoc {
                key: key.to_string(),
                counters: BTreeMap::new(),
            });
        let entry = doc.counters.entry(field.to_string()).or_insert(0);
        *entry += delta;
        let new_value = *entry;
        self.usage()
            .replace_one(doc! {"_id": key}, &doc)
            .upsert(true)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(new_value)
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let doc = self
            .usage()
            .find_one(doc! {"_id": key})
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(doc.map(|d| d.counters).unwrap_or_default())
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        self.usage()
            .delete_one(doc! {"_id": key})
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        use futures::TryStreamExt;
        let mut cursor = self
            .usage()
            .find(doc! {})
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(d) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            out.push(d.key);
        }
        Ok(out)
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
        let meta_id = opts.idempotency_key.clone();

        if let Some(existing_doc) = self
            .plan_meta()
            .find_one(doc! {"_id": &meta_id})
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?
        {
            let existing: PlanMetaRecord = mongodb::bson::from_document(existing_doc)
                .map_err(|e| StorageError::Read(e.to_string()))?;
            match existing.status {
                PlanStatus::Committed => return Ok(BatchApplyOutcome::AlreadyCommitted),
                PlanStatus::InProgress if !existing.is_expired(Utc::now()) => {
                    return Ok(BatchApplyOutcome::InProgress);
                }
                _ => {}
            }
        }

        let mut record =
            PlanMetaRecord::in_progress(opts.idempotency_key.clone(), opts.stage.clone(), opts.ttl);
        self.upsert_plan_meta(&meta_id, &record).await?;

        let mut snapshot = Vec::with_capacity(mutations.len());
        for m in &mutations {
            snapshot.push((m.key.clone(), self.get_config(&m.key).await?));
        }

        let mut failure: Option<String> = None;
        for m in &mutations {
            if let Err(e) = self.set_config(&m.key, m.value.clone()).await {
                failure = Some(e.to_string());
                break;
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
            let _ = self.upsert_plan_meta(&meta_id, &record).await;
            return Err(StorageError::BatchConflict(err));
        }

        let hash = super::plan::hash_mutations(&mutations);
        record.mark_committed(mutations.len(), hash);
        self.upsert_plan_meta(&meta_id, &record).await?;

        Ok(BatchApplyOutcome::Committed {
            mutation_count: mutations.len(),
        })
    }

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Err(StorageError::Unsupported("pool_stats"))
    }

    async fn list_plan_meta(&self) -> Result<Vec<PlanMetaRecord>, StorageError> {
        use futures::TryStreamExt;
        let mut cursor = self
            .plan_meta()
            .find(doc! {})
            .sort(doc! {"started_at": -1})
            .await
            .map_err(|e| StorageError::List(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(d) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            out.push(
                mongodb::bson::from_document(d).map_err(|e| StorageError::Read(e.to_string()))?,
            );
        }
        Ok(out)
    }

    async fn prune_plan_meta(&self, older_than_days: i64) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = self
            .plan_meta()
            .delete_many(doc! {"started_at": {"$lt": cutoff}})
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(result.deleted_count)
    }
}

impl MongoStorage {
    async fn upsert_plan_meta(&self, id: &str, record: &PlanMetaRecord) -> Result<(), StorageError> {
        let mut bson_doc =
            mongodb::bson::to_document(record).map_err(|e| StorageError::Write(e.to_string()))?;
        bson_doc.insert("_id", id);
        self.plan_meta()
            .replace_one(doc! {"_id": id}, bson_doc)
            .upsert(true)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }
}
