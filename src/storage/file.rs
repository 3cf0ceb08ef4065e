//! Local-file storage backend: one JSON file per credential/usage record,
//! a single JSON object for configs, all under a configured base directory.
//! Writes are atomic (write-temp + rename).

use super::{ExportedData, PoolStats, Storage, StorageCapabilities, StorageHealth};
use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub struct FileStorage {
    base: PathBuf,
    /// The file backend serializes all mutating operations behind a single
    /// process-wide lock, matching the concurrency model's "file backend
    /// uses a single process-wide mutex during load/save".
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            lock: Mutex::new(()),
        }
    }

    fn credentials_dir(&self) -> PathBuf {
        self.base.join("credentials")
    }

    fn usage_dir(&self) -> PathBuf {
        self.base.join("usage")
    }

    fn config_file(&self) -> PathBuf {
        self.base.join("config").join("config.json")
    }

    async fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [
            self.base.clone(),
            self.credentials_dir(),
            self.usage_dir(),
            self.base.join("config"),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StorageError::Write(format!("create_dir_all {}: {e}", dir.display())))?;
            set_dir_permissions(&dir).await;
        }
        Ok(())
    }

    async fn read_json_file(path: &Path) -> Result<Option<Value>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read(format!("{}: {e}", path.display()))),
        }
    }

    /// Writes atomically: serialize, write to `<path>.tmp`, fsync, rename.
    async fn write_json_file_atomic(path: &Path, value: &Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Write(e.to_string()))?;
        }
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::Write(format!("{}: {e}", tmp.display())))?;
        set_file_permissions(&tmp).await;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::Write(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    fn id_to_path(&self, id: &str) -> PathBuf {
        self.credentials_dir()
            .join(super::normalize_credential_filename(id))
    }

    fn usage_key_to_path(&self, key: &str) -> PathBuf {
        self.usage_dir().join(format!("{key}.json"))
    }
}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path) {
    let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await;
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path) {}

#[cfg(unix)]
async fn set_file_permissions(path: &Path) {
    let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
}

#[cfg(not(unix))]
async fn set_file_permissions(_path: &Path) {}

#[async_trait]
impl Storage for FileStorage {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::empty()
    }

    fn name(&self) -> &'static str {
        "file"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_dirs().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn health(&self) -> StorageHealth {
        if self.base.is_dir() {
            StorageHealth::ok()
        } else {
            StorageHealth::unhealthy(format!("base dir missing: {}", self.base.display()))
        }
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Value>, StorageError> {
        Self::read_json_file(&self.id_to_path(id)).await
    }

    async fn set_credential(&self, id: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Self::write_json_file_atomic(&self.id_to_path(id), &value).await
    }

    async fn delete_credential(&self, id: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        match fs::remove_file(self.id_to_path(id)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn list_credentials(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let dir = self.credentials_dir();
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StorageError::List(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if let Some(value) = Self::read_json_file(&path).await? {
                out.push((id, value));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn get_config(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let obj = Self::read_json_file(&self.config_file())
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(obj.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut obj = Self::read_json_file(&self.config_file())
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut obj {
            map.insert(key.to_string(), value);
        }
        Self::write_json_file_atomic(&self.config_file(), &obj).await
    }

    async fn delete_config(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut obj = Self::read_json_file(&self.config_file())
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut obj {
            map.remove(key);
        }
        Self::write_json_file_atomic(&self.config_file(), &obj).await
    }

    async fn list_configs(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let obj = Self::read_json_file(&self.config_file())
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        match obj {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn increment_usage(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.usage_key_to_path(key);
        let mut counters: BTreeMap<String, i64> = Self::read_json_file(&path)
            .await?
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();
        let entry = counters.entry(field.to_string()).or_insert(0);
        *entry += delta;
        let new_value = *entry;
        Self::write_json_file_atomic(&path, &serde_json::to_value(&counters)?).await?;
        Ok(new_value)
    }

    async fn get_usage(&self, key: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let path = self.usage_key_to_path(key);
        Ok(Self::read_json_file(&path)
            .await?
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default())
    }

    async fn reset_usage(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        match fs::remove_file(self.usage_key_to_path(key)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn list_usage(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.usage_dir();
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StorageError::List(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::List(e.to_string()))?
        {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
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

    async fn pool_stats(&self) -> Result<PoolStats, StorageError> {
        Err(StorageError::Unsupported("pool_stats"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_credential() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.initialize().await.unwrap();

        storage
            .set_credential("Cred A", json!({"access_token": "t"}))
            .await
            .unwrap();

        let got = storage.get_credential("Cred A").await.unwrap();
        assert_eq!(got, Some(json!({"access_token": "t"})));

        let path = dir.path().join("credentials").join("cred-a.json");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn increments_usage_counters() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.initialize().await.unwrap();

        let v1 = storage.increment_usage("cred-a", "tokens", 10).await.unwrap();
        let v2 = storage.increment_usage("cred-a", "tokens", 5).await.unwrap();
        assert_eq!(v1, 10);
        assert_eq!(v2, 15);
    }

    #[tokio::test]
    async fn export_import_round_trips() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = FileStorage::new(src_dir.path());
        let dst = FileStorage::new(dst_dir.path());
        src.initialize().await.unwrap();
        dst.initialize().await.unwrap();

        src.set_credential("a", json!({"x": 1})).await.unwrap();
        src.set_config("k", json!("v")).await.unwrap();

        let data = src.export_data().await.unwrap();
        dst.import_data(data).await.unwrap();

        assert_eq!(dst.get_credential("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(dst.get_config("k").await.unwrap(), Some(json!("v")));
    }
}
