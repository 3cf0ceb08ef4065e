//! Credential data model: a wire/storage `CredentialProfile` (what a source
//! or storage backend hands back) layered with runtime-only atomics
//! (`in_flight`, per-class failure tallies, ban state) on a [`Credential`].
//!
//! The split mirrors the `...Profile` / runtime-resource pattern: a God
//! struct mixing wire shape with live counters would force every caller to
//! reason about serialization when they only want to bump a counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// What a [`super::source::CredentialSource`] or storage backend hands back
/// for one credential. Round-trips to JSON unchanged; `access_token` and
/// `expires_at` are mutated in place by the manager on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProfile {
    pub id: String,

    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,

    pub refresh_token: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_token_uri")]
    pub token_uri: String,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Where a credential was discovered. Informational only; affects nothing
/// about selection, but is useful in logs and the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    File,
    Env,
    Storage,
}

/// Reason carried alongside a `credential_changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Refreshed,
    MarkedInvalid,
    Banned,
    Recovered,
    Reloaded,
}

/// The four HTTP failure classes the auto-ban thresholds track
/// independently, per spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Unauthorized,
    Forbidden,
    RateLimited,
    ServerError,
}

impl FailureClass {
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }
}

/// Runtime credential: the mutable profile behind a lock, plus lock-free
/// atomics for the hot counters every request touches.
#[derive(Debug)]
pub struct Credential {
    pub id: String,
    pub source_tag: SourceTag,

    profile: RwLock<CredentialProfile>,

    pub in_flight: AtomicU32,
    pub consecutive_failures: AtomicU32,
    pub failures_401: AtomicU32,
    pub failures_403: AtomicU32,
    pub failures_429: AtomicU32,
    pub failures_5xx: AtomicU32,

    /// Epoch milliseconds; `0` means "not banned".
    banned_until_ms: AtomicI64,

    /// Guards the refresh HTTP call so concurrent callers for the same
    /// credential coalesce onto a single outstanding request (single-flight,
    /// testable property 2).
    pub(super) refresh_lock: tokio::sync::Mutex<()>,
}

impl Credential {
    pub fn from_profile(profile: CredentialProfile, source_tag: SourceTag) -> Self {
        Self {
            id: profile.id.clone(),
            source_tag,
            profile: RwLock::new(profile),
            in_flight: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            failures_401: AtomicU32::new(0),
            failures_403: AtomicU32::new(0),
            failures_429: AtomicU32::new(0),
            failures_5xx: AtomicU32::new(0),
            banned_until_ms: AtomicI64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn profile_snapshot(&self) -> CredentialProfile {
        self.profile.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.profile
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .access_token
            .clone()
    }

    pub fn project_id(&self) -> Option<String> {
        self.profile
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .project_id
            .clone()
    }

    pub fn refresh_token_present(&self) -> bool {
        !self
            .profile
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .refresh_token
            .is_empty()
    }

    /// An absent refresh token makes a credential terminally invalid
    /// (spec §4.2 "Failure semantics").
    pub fn is_terminally_invalid(&self) -> bool {
        !self.refresh_token_present()
    }

    /// Whether the access token is expired given `refresh_ahead`, per spec
    /// §3 ("now + safety margin ≥ expires_at").
    pub fn needs_refresh(&self, refresh_ahead: chrono::Duration) -> bool {
        let guard = self.profile.read().unwrap_or_else(|p| p.into_inner());
        match (&guard.access_token, guard.expires_at) {
            (Some(_), Some(expires_at)) => Utc::now() + refresh_ahead >= expires_at,
            _ => true,
        }
    }

    pub fn oauth_fields(&self) -> (String, String, String, String) {
        let guard = self.profile.read().unwrap_or_else(|p| p.into_inner());
        (
            guard.client_id.clone(),
            guard.client_secret.clone(),
            guard.token_uri.clone(),
            guard.refresh_token.clone(),
        )
    }

    /// Applies a successful refresh. `expires_at` must be strictly greater
    /// than the previous value (spec invariant: "strictly monotone across
    /// successful refreshes"); a non-monotone response is ignored rather
    /// than regressing the stored expiry.
    pub fn apply_refresh(&self, access_token: String, expires_at: DateTime<Utc>) {
        let mut guard = self.profile.write().unwrap_or_else(|p| p.into_inner());
        let monotone = guard.expires_at.is_none_or(|prev| expires_at > prev);
        guard.access_token = Some(access_token);
        if monotone {
            guard.expires_at = Some(expires_at);
        }
    }

    pub fn set_project_id(&self, project_id: String) {
        self.profile.write().unwrap_or_else(|p| p.into_inner()).project_id = Some(project_id);
    }

    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        let until = self.banned_until_ms.load(Ordering::Acquire);
        until > 0 && until > now.timestamp_millis()
    }

    pub fn ban_until(&self, until: DateTime<Utc>) {
        self.banned_until_ms.store(until.timestamp_millis(), Ordering::Release);
    }

    pub fn clear_ban(&self) {
        self.banned_until_ms.store(0, Ordering::Release);
    }

    pub fn banned_until(&self) -> Option<DateTime<Utc>> {
        let ms = self.banned_until_ms.load(Ordering::Acquire);
        (ms > 0).then(|| DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now))
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Claims a slot in `in_flight`, returning a guard that releases it on
    /// drop. Callers are expected to have already checked the
    /// `max_concurrent_per_credential` cap (e.g. via the manager's
    /// [`super::manager::CredentialManager::next_candidate`]); this just
    /// makes the release unconditional, including on panics or early
    /// returns.
    pub fn acquire(self: &Arc<Self>) -> CredentialGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        CredentialGuard { credential: self.clone() }
    }

    /// Bumps the relevant counter for `class` and the consecutive-failure
    /// tally, returning them for the caller's threshold comparison.
    pub fn record_failure(&self, class: Option<FailureClass>) -> (u32, u32) {
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let class_count = match class {
            Some(FailureClass::Unauthorized) => self.failures_401.fetch_add(1, Ordering::AcqRel) + 1,
            Some(FailureClass::Forbidden) => self.failures_403.fetch_add(1, Ordering::AcqRel) + 1,
            Some(FailureClass::RateLimited) => self.failures_429.fetch_add(1, Ordering::AcqRel) + 1,
            Some(FailureClass::ServerError) => self.failures_5xx.fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        };
        (class_count, consecutive)
    }
}

/// RAII handle for one claimed `in_flight` slot. Dropping it (including on
/// an early return or panic while a request is in flight) always
/// decrements the counter back.
pub struct CredentialGuard {
    credential: Arc<Credential>,
}

impl CredentialGuard {
    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }
}

impl Drop for CredentialGuard {
    fn drop(&mut self) {
        self.credential.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> CredentialProfile {
        CredentialProfile {
            id: "a".into(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: "rt".into(),
            access_token: None,
            token_uri: default_token_uri(),
            project_id: None,
            expires_at: None,
            scopes: vec![],
        }
    }

    #[test]
    fn needs_refresh_when_no_token() {
        let cred = Credential::from_profile(sample_profile(), SourceTag::File);
        assert!(cred.needs_refresh(chrono::Duration::seconds(180)));
    }

    #[test]
    fn expiry_is_monotone() {
        let cred = Credential::from_profile(sample_profile(), SourceTag::File);
        let t1 = Utc::now() + chrono::Duration::seconds(3600);
        cred.apply_refresh("tok1".into(), t1);
        assert_eq!(cred.profile_snapshot().expires_at, Some(t1));

        // A regression (e.g. racing responses) must not move expires_at backward.
        let t0 = Utc::now();
        cred.apply_refresh("tok2".into(), t0);
        assert_eq!(cred.profile_snapshot().expires_at, Some(t1));
        assert_eq!(cred.profile_snapshot().access_token, Some("tok2".into()));
    }

    #[test]
    fn ban_window() {
        let cred = Credential::from_profile(sample_profile(), SourceTag::File);
        assert!(!cred.is_banned(Utc::now()));
        cred.ban_until(Utc::now() + chrono::Duration::seconds(60));
        assert!(cred.is_banned(Utc::now()));
        cred.clear_ban();
        assert!(!cred.is_banned(Utc::now()));
    }

    #[test]
    fn terminally_invalid_without_refresh_token() {
        let mut profile = sample_profile();
        profile.refresh_token.clear();
        let cred = Credential::from_profile(profile, SourceTag::File);
        assert!(cred.is_terminally_invalid());
    }

    #[test]
    fn guard_releases_in_flight_on_drop() {
        let cred = Arc::new(Credential::from_profile(sample_profile(), SourceTag::File));
        assert_eq!(cred.in_flight.load(Ordering::Acquire), 0);
        {
            let _guard = cred.acquire();
            assert_eq!(cred.in_flight.load(Ordering::Acquire), 1);
        }
        assert_eq!(cred.in_flight.load(Ordering::Acquire), 0);
    }
}
