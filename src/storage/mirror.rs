//! Storage mirror: when the primary backend is not the local-file backend
//! and an `auth_dir` is configured, periodically (and once eagerly at
//! startup) syncs credentials from the primary backend into normalized
//! JSON files under `auth_dir`, and notifies listeners when anything
//! changed so the credential manager can reload.

use super::{Storage, normalize_credential_filename};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Mirrors `storage.list_credentials()` into `auth_dir`, returning whether
/// anything on disk changed.
pub async fn mirror_once(storage: &dyn Storage, auth_dir: &Path) -> std::io::Result<bool> {
    tokio::fs::create_dir_all(auth_dir).await?;

    let credentials = match storage.list_credentials().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "storage mirror: failed to list credentials from primary backend");
            return Ok(false);
        }
    };

    let mut expected_filenames = HashSet::new();
    let mut changed = false;

    for (id, value) in credentials {
        let filename = normalize_credential_filename(&id);
        expected_filenames.insert(filename.clone());
        let path = auth_dir.join(&filename);

        let bytes = serde_json::to_vec_pretty(&value).unwrap_or_default();
        let existing = tokio::fs::read(&path).await.ok();
        if existing.as_deref() != Some(bytes.as_slice()) {
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            changed = true;
        }
    }

    let mut entries = tokio::fs::read_dir(auth_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if filename.ends_with(".state.json") {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if !expected_filenames.contains(filename) {
            tokio::fs::remove_file(&path).await?;
            changed = true;
        }
    }

    Ok(changed)
}

/// Spawns the background mirror loop. The returned [`Notify`] is signaled
/// whenever a mirror pass changes the contents of `auth_dir`; the
/// credential manager should await it (or poll `notified()`) to know when
/// to reload. The task exits when `cancel` is triggered.
pub fn spawn(
    storage: Arc<dyn Storage>,
    auth_dir: std::path::PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> (Arc<Notify>, tokio::task::JoinHandle<()>) {
    let notify = Arc::new(Notify::new());
    let notify_task = notify.clone();

    let handle = tokio::spawn(async move {
        match mirror_once(storage.as_ref(), &auth_dir).await {
            Ok(true) => notify_task.notify_waiters(),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "storage mirror: startup pass failed"),
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match mirror_once(storage.as_ref(), &auth_dir).await {
                        Ok(true) => notify_task.notify_waiters(),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "storage mirror: periodic pass failed"),
                    }
                }
            }
        }
    });

    (notify, handle)
}
