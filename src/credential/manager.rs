//! Credential manager: owns the table of known credentials, loads them from
//! storage + the pluggable sources, keeps access tokens fresh, and applies
//! the auto-ban/auto-recovery failure policy described in spec §4.2.
//!
//! The table itself follows an ownership-root pattern: a single read-biased
//! lock (`RwLock<HashMap<...>>`) guards membership (insert/remove), while
//! each [`Credential`]'s hot counters live behind their own atomics so a
//! request in flight never blocks on the table lock.

use super::events::{CredentialEvent, EventBus, Topic};
use super::model::{ChangeReason, Credential, CredentialProfile, FailureClass, SourceTag};
use super::oauth;
use super::source;
use crate::config::CredentialManagerConfig;
use crate::error::GatewayError;
use crate::storage::Storage;
use axum::http::StatusCode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct CredentialManager {
    config: CredentialManagerConfig,
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    http: reqwest::Client,
    auth_dir: PathBuf,

    table: RwLock<HashMap<String, Arc<Credential>>>,
    /// Insertion-ordered ids, used for deterministic round-robin scanning.
    order: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    /// Successful selections since the cursor last advanced; rolls over at
    /// `calls_per_rotation`.
    calls_since_rotation: AtomicUsize,
}

impl CredentialManager {
    pub fn new(
        config: CredentialManagerConfig,
        storage: Arc<dyn Storage>,
        events: Arc<EventBus>,
        http: reqwest::Client,
        auth_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            events,
            http,
            auth_dir,
            table: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            calls_since_rotation: AtomicUsize::new(0),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Loads credentials from storage, the auth directory, and the
    /// environment, in that priority order — first source to claim an id
    /// wins; later sources with the same id are skipped and logged.
    pub async fn load(&self) {
        let mut discovered: Vec<(CredentialProfile, SourceTag)> = Vec::new();

        match self.storage.list_credentials().await {
            Ok(items) => {
                for (id, value) in items {
                    match serde_json::from_value::<CredentialProfile>(value) {
                        Ok(mut profile) => {
                            profile.id = id;
                            discovered.push((profile, SourceTag::Storage));
                        }
                        Err(e) => tracing::warn!(id, error = %e, "storage credential record failed to parse"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to list credentials from storage"),
        }

        for found in source::scan_directory(&self.auth_dir) {
            discovered.push((found.profile, found.source_tag));
        }
        for found in source::scan_environment(&self.config.env_prefix) {
            discovered.push((found.profile, found.source_tag));
        }

        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        let mut order = self.order.write().unwrap_or_else(|p| p.into_inner());

        for (profile, source_tag) in discovered {
            if table.contains_key(&profile.id) {
                tracing::debug!(id = %profile.id, "duplicate credential id, first source wins, skipping");
                continue;
            }
            let id = profile.id.clone();
            table.insert(id.clone(), Arc::new(Credential::from_profile(profile, source_tag)));
            order.push(id);
        }

        tracing::info!(count = table.len(), "credential manager loaded credentials");
    }

    /// Re-reads sources and merges in any new ids without disturbing
    /// existing live credentials (so in-flight counters and ban state
    /// survive a reload triggered by the file watcher or storage mirror).
    pub async fn reload(&self) {
        let before = self.table.read().unwrap_or_else(|p| p.into_inner()).len();
        self.load().await;
        let after = self.table.read().unwrap_or_else(|p| p.into_inner()).len();
        if after > before {
            self.events.publish(
                Topic::CredentialChanged,
                CredentialEvent {
                    credential_id: String::new(),
                    reason: ChangeReason::Reloaded,
                },
            );
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Credential>> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Credential>> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
    }

    /// Credentials in round-robin order, starting at the current cursor
    /// position without advancing it. Used by the routing strategy, which
    /// needs a deterministic scan order rather than arbitrary map iteration.
    pub fn ordered_from_cursor(&self) -> Vec<Arc<Credential>> {
        let order = self.order.read().unwrap_or_else(|p| p.into_inner());
        if order.is_empty() {
            return Vec::new();
        }
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        let len = order.len();
        let start = self.cursor.load(Ordering::Acquire) % len;
        (0..len)
            .filter_map(|offset| {
                let idx = (start + offset) % len;
                order.get(idx).and_then(|id| table.get(id)).cloned()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scans the round-robin order starting at the cursor for the next
    /// credential that is not banned, not terminally invalid, and under its
    /// `max_concurrent_per_credential` cap. The cursor only advances once
    /// every `calls_per_rotation` successful picks, matching the "rotates
    /// after a configurable call count" contract; a failed scan never
    /// advances it.
    pub fn next_candidate(&self) -> Option<Arc<Credential>> {
        let order = self.order.read().unwrap_or_else(|p| p.into_inner());
        if order.is_empty() {
            return None;
        }
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        let now = chrono::Utc::now();
        let len = order.len();
        let start = self.cursor.load(Ordering::Acquire) % len;

        for offset in 0..len {
            let idx = (start + offset) % len;
            let Some(cred) = order.get(idx).and_then(|id| table.get(id)) else {
                continue;
            };
            if cred.is_terminally_invalid() || cred.is_banned(now) {
                continue;
            }
            if cred.in_flight.load(Ordering::Acquire) >= self.config.max_concurrent_per_credential {
                continue;
            }

            let calls = self.calls_since_rotation.fetch_add(1, Ordering::AcqRel) + 1;
            if calls >= self.config.calls_per_rotation as usize {
                self.calls_since_rotation.store(0, Ordering::Release);
                self.cursor.fetch_add(1, Ordering::AcqRel);
            }
            return Some(cred.clone());
        }
        None
    }

    /// Async entry point matching the public contract's `get_credential()`:
    /// a brief single retry after the first scan comes up empty, then a
    /// distinguished exhaustion error rather than blocking indefinitely.
    pub async fn get_credential(&self) -> Result<Arc<Credential>, GatewayError> {
        if let Some(cred) = self.next_candidate() {
            return Ok(cred);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.next_candidate().ok_or(GatewayError::NoAvailableCredential)
    }

    /// Ensures `cred`'s access token is fresh, refreshing under a
    /// per-credential lock so concurrent callers coalesce onto one HTTP
    /// call (single-flight). Returns the error produced by the one caller
    /// that actually performed the refresh.
    pub async fn ensure_fresh(&self, cred: &Credential) -> Result<(), GatewayError> {
        let refresh_ahead = chrono::Duration::seconds(self.config.refresh_ahead_seconds);
        if !cred.needs_refresh(refresh_ahead) {
            return Ok(());
        }

        let _guard = cred.refresh_lock.lock().await;
        // Re-check: another caller may have refreshed while we waited.
        if !cred.needs_refresh(refresh_ahead) {
            return Ok(());
        }

        let (client_id, client_secret, token_uri, refresh_token) = cred.oauth_fields();
        if refresh_token.is_empty() {
            return Err(GatewayError::MissingAccessToken);
        }

        let refreshed = oauth::refresh_access_token(&self.http, &token_uri, &client_id, &client_secret, &refresh_token)
            .await
            .map_err(GatewayError::from)?;

        cred.apply_refresh(refreshed.access_token, refreshed.expires_at);
        self.persist(cred).await;

        self.events.publish(
            Topic::CredentialChanged,
            CredentialEvent {
                credential_id: cred.id.clone(),
                reason: ChangeReason::Refreshed,
            },
        );

        Ok(())
    }

    /// Forces a refresh regardless of `expires_at` proximity, coalesced
    /// through the same per-credential single-flight lock as
    /// [`Self::ensure_fresh`]. Used when the upstream itself reports the
    /// access token invalid (401/403) rather than waiting for the normal
    /// expiry-driven sweep — spec §4.4 "401/403 if refresh was not tried"
    /// and §7's `upstream_auth` row ("one refresh retry; then surfaced").
    pub async fn force_refresh(&self, cred: &Credential) -> Result<(), GatewayError> {
        let before = cred.access_token();

        let _guard = cred.refresh_lock.lock().await;
        // Another caller may have refreshed this credential while we waited
        // for the lock; if the token already changed, their refresh covers
        // ours too and we don't need a second network round trip.
        if cred.access_token() != before {
            return Ok(());
        }

        let (client_id, client_secret, token_uri, refresh_token) = cred.oauth_fields();
        if refresh_token.is_empty() {
            return Err(GatewayError::MissingAccessToken);
        }

        let refreshed = oauth::refresh_access_token(&self.http, &token_uri, &client_id, &client_secret, &refresh_token)
            .await
            .map_err(GatewayError::from)?;

        cred.apply_refresh(refreshed.access_token, refreshed.expires_at);
        self.persist(cred).await;

        self.events.publish(
            Topic::CredentialChanged,
            CredentialEvent {
                credential_id: cred.id.clone(),
                reason: ChangeReason::Refreshed,
            },
        );

        Ok(())
    }

    async fn persist(&self, cred: &Credential) {
        let profile = cred.profile_snapshot();
        if let Ok(value) = serde_json::to_value(&profile) {
            if let Err(e) = self.storage.set_credential(&cred.id, value).await {
                tracing::warn!(id = %cred.id, error = %e, "failed to persist refreshed credential");
            }
        }
    }

    pub fn mark_success(&self, cred: &Credential) {
        cred.record_success();
    }

    /// Applies the per-class and consecutive-failure thresholds. Bans the
    /// credential for `auto_ban_duration_secs` once any threshold is
    /// crossed, per spec §4.2.
    pub fn mark_failure(&self, cred: &Credential, status: Option<StatusCode>) {
        let class = status.and_then(|s| FailureClass::from_status(s.as_u16()));
        let (class_count, consecutive) = cred.record_failure(class);

        let class_threshold = match class {
            Some(FailureClass::Unauthorized) => Some(self.config.threshold_401),
            Some(FailureClass::Forbidden) => Some(self.config.threshold_403),
            Some(FailureClass::RateLimited) => Some(self.config.threshold_429),
            Some(FailureClass::ServerError) => Some(self.config.threshold_5xx),
            None => None,
        };

        let should_ban = consecutive >= self.config.consecutive_failure_threshold
            || class_threshold.is_some_and(|threshold| class_count >= threshold);

        if should_ban {
            let until = chrono::Utc::now() + chrono::Duration::seconds(self.config.auto_ban_duration_secs);
            cred.ban_until(until);
            tracing::warn!(id = %cred.id, ?class, consecutive, "credential auto-banned");
            self.events.publish(
                Topic::CredentialBanned,
                CredentialEvent {
                    credential_id: cred.id.clone(),
                    reason: ChangeReason::Banned,
                },
            );
        }
    }

    /// Manually unbans a credential (admin surface).
    pub fn unban(&self, id: &str) -> bool {
        let Some(cred) = self.get(id) else { return false };
        cred.clear_ban();
        self.events.publish(
            Topic::CredentialRecovered,
            CredentialEvent {
                credential_id: id.to_string(),
                reason: ChangeReason::Recovered,
            },
        );
        true
    }

    /// Manually bans a credential for `duration` (admin surface).
    pub fn ban(&self, id: &str, duration: Duration) -> bool {
        let Some(cred) = self.get(id) else { return false };
        cred.ban_until(chrono::Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()));
        true
    }

    /// Periodic sweep refreshing any credential within its refresh-ahead
    /// window, so first-request latency doesn't pay for a cold token.
    pub fn start_periodic_refresh(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = Duration::from_secs(self.config.periodic_refresh_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for cred in this.all() {
                            if cred.is_terminally_invalid() {
                                continue;
                            }
                            if let Err(e) = this.ensure_fresh(&cred).await {
                                tracing::debug!(id = %cred.id, error = %e, "periodic refresh failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Periodic sweep that rechecks banned credentials. A ban naturally
    /// lapses once `banned_until` passes, but this task probes earlier by
    /// attempting a refresh for any still-banned credential: a successful
    /// probe clears the ban immediately instead of waiting out the full
    /// `auto_ban_duration_secs` window.
    pub fn start_auto_recovery(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = Duration::from_secs(self.config.auto_recovery_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now();
                        for cred in this.all() {
                            let Some(until) = cred.banned_until() else { continue };
                            if until <= now {
                                cred.clear_ban();
                                this.recovered(&cred);
                                continue;
                            }
                            if cred.is_terminally_invalid() {
                                continue;
                            }
                            let (client_id, client_secret, token_uri, refresh_token) = cred.oauth_fields();
                            match oauth::refresh_access_token(&this.http, &token_uri, &client_id, &client_secret, &refresh_token).await {
                                Ok(refreshed) => {
                                    cred.apply_refresh(refreshed.access_token, refreshed.expires_at);
                                    this.persist(&cred).await;
                                    cred.clear_ban();
                                    this.recovered(&cred);
                                }
                                Err(e) => tracing::debug!(id = %cred.id, error = %e, "auto-recovery probe failed"),
                            }
                        }
                    }
                }
            }
        })
    }

    fn recovered(&self, cred: &Credential) {
        self.events.publish(
            Topic::CredentialRecovered,
            CredentialEvent {
                credential_id: cred.id.clone(),
                reason: ChangeReason::Recovered,
            },
        );
    }

    /// Watches `auth_dir` for changes with a debounce window, reloading the
    /// table when the watcher fires.
    pub fn watch_auth_directory(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let debounce = Duration::from_millis(self.config.watch_debounce_ms);
        let auth_dir = self.auth_dir.clone();

        tokio::spawn(async move {
            use notify::{RecursiveMode, Watcher};
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start auth directory watcher");
                    return;
                }
            };

            if let Err(e) = watcher.watch(&auth_dir, RecursiveMode::NonRecursive) {
                tracing::warn!(dir = %auth_dir.display(), error = %e, "failed to watch auth directory");
                return;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Drain any further events within the debounce window
                        // so a burst of writes triggers exactly one reload.
                        tokio::time::sleep(debounce).await;
                        while rx.try_recv().is_ok() {}
                        this.reload().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorage;

    fn config() -> CredentialManagerConfig {
        CredentialManagerConfig {
            calls_per_rotation: 2,
            max_concurrent_per_credential: 1,
            ..Default::default()
        }
    }

    fn sample(id: &str) -> CredentialProfile {
        CredentialProfile {
            id: id.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: "rt".into(),
            access_token: Some("tok".into()),
            token_uri: String::new(),
            project_id: None,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(3600)),
            scopes: vec![],
        }
    }

    fn manager_with(ids: &[&str]) -> Arc<CredentialManager> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(std::env::temp_dir().join(format!(
            "codeassist-test-{}",
            uuid_like()
        ))));
        let mgr = CredentialManager::new(
            config(),
            storage,
            Arc::new(EventBus::new()),
            reqwest::Client::new(),
            PathBuf::from("/nonexistent"),
        );
        {
            let mut table = mgr.table.write().unwrap();
            let mut order = mgr.order.write().unwrap();
            for id in ids {
                table.insert(id.to_string(), Arc::new(Credential::from_profile(sample(id), SourceTag::File)));
                order.push(id.to_string());
            }
        }
        mgr
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[test]
    fn rotation_advances_after_calls_per_rotation() {
        let mgr = manager_with(&["a", "b"]);
        let first = mgr.next_candidate().unwrap();
        let second = mgr.next_candidate().unwrap();
        assert_eq!(first.id, second.id, "cursor should not move before calls_per_rotation");
        let third = mgr.next_candidate().unwrap();
        assert_ne!(first.id, third.id, "cursor should move after calls_per_rotation picks");
    }

    #[test]
    fn next_candidate_skips_banned_and_invalid() {
        let mgr = manager_with(&["a", "b"]);
        mgr.get("a").unwrap().ban_until(chrono::Utc::now() + chrono::Duration::seconds(60));
        let picked = mgr.next_candidate().unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn mark_failure_bans_on_consecutive_threshold() {
        let mgr = manager_with(&["a"]);
        let cred = mgr.get("a").unwrap();
        for _ in 0..mgr.config.consecutive_failure_threshold {
            mgr.mark_failure(&cred, None);
        }
        assert!(cred.is_banned(chrono::Utc::now()));
    }
}
