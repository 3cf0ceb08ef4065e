//! Backend selection: either a directly configured backend, or `auto`,
//! which tries a preference list in order and falls back to the local
//! file backend if every preferred backend fails to initialize.

use super::Storage;
use super::file::FileStorage;
use super::git::GitStorage;
use super::mongo::MongoStorage;
use super::postgres::PostgresStorage;
use super::redis::RedisStorage;
use crate::config::{StorageBackendKind, StorageConfig};
use std::sync::Arc;

/// Builds the configured storage backend, applying `auto` fallback rules.
pub async fn build(cfg: &StorageConfig) -> Arc<dyn Storage> {
    match cfg.backend {
        StorageBackendKind::Auto => build_preferred(cfg).await,
        kind => match build_specific(kind, cfg).await {
            Ok(storage) => storage,
            Err(e) => {
                tracing::warn!(
                    backend = ?kind,
                    error = %e,
                    "configured storage backend failed to initialize, degrading to file backend"
                );
                build_file(cfg)
            }
        },
    }
}

async fn build_preferred(cfg: &StorageConfig) -> Arc<dyn Storage> {
    for kind in &cfg.preference {
        if *kind == StorageBackendKind::Auto {
            continue;
        }
        match build_specific(*kind, cfg).await {
            Ok(storage) => {
                if storage.health().await.healthy {
                    return storage;
                }
                tracing::warn!(backend = ?kind, "storage backend reported unhealthy, trying next preference");
            }
            Err(e) => {
                tracing::warn!(backend = ?kind, error = %e, "storage backend failed to initialize, trying next preference");
            }
        }
    }
    tracing::warn!("no preferred storage backend is available, falling back to file backend");
    build_file(cfg)
}

async fn build_specific(
    kind: StorageBackendKind,
    cfg: &StorageConfig,
) -> Result<Arc<dyn Storage>, crate::error::StorageError> {
    use crate::error::StorageError;

    let storage: Arc<dyn Storage> = match kind {
        StorageBackendKind::File => build_file(cfg),
        StorageBackendKind::Git => Arc::new(GitStorage::open_or_init(&cfg.git_path)?),
        StorageBackendKind::Redis => {
            let url = cfg
                .redis_url
                .as_deref()
                .ok_or_else(|| StorageError::Write("storage.redis_url not configured".into()))?;
            Arc::new(RedisStorage::connect(url).await?)
        }
        StorageBackendKind::Mongo => {
            let uri = cfg
                .mongo_uri
                .as_deref()
                .ok_or_else(|| StorageError::Write("storage.mongo_uri not configured".into()))?;
            Arc::new(MongoStorage::connect(uri, &cfg.mongo_database).await?)
        }
        StorageBackendKind::Postgres => {
            let dsn = cfg
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| StorageError::Write("storage.postgres_dsn not configured".into()))?;
            Arc::new(PostgresStorage::connect(dsn).await?)
        }
        StorageBackendKind::Auto => unreachable!("auto is resolved by build_preferred"),
    };

    storage.initialize().await?;
    Ok(storage)
}

fn build_file(cfg: &StorageConfig) -> Arc<dyn Storage> {
    Arc::new(FileStorage::new(&cfg.auth_dir))
}
