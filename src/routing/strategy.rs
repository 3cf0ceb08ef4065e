//! Per-request credential selection: sticky header overrides, round-robin
//! scanning, cooldown backoff, and snapshot/restore of routing state.
//!
//! Routing state (strikes + cooldown) is deliberately separate from the
//! credential manager's ban state: a ban is a harder exclusion requiring
//! auto-recovery, while a cooldown is a soft, self-expiring backoff that
//! the strategy owns end to end.

use crate::config::{CredentialManagerConfig, STICKY_CREDENTIAL_HEADER};
use crate::credential::{Credential, CredentialManager};
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

const COOLDOWN_BASE: std::time::Duration = std::time::Duration::from_secs(5);
const COOLDOWN_CAP: std::time::Duration = std::time::Duration::from_secs(600);
const AUTH_FAILURE_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(5);
/// Minimum cooldown re-applied on restore, to avoid every credential
/// becoming eligible simultaneously right after a restart.
const RESTORE_MIN_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(5);

/// Why `pick_with_info` returned the credential it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickReason {
    Sticky,
    RoundRobin,
    ManagerFallback,
}

#[derive(Debug, Clone)]
pub struct PickInfo {
    pub credential_id: String,
    pub reason: PickReason,
    pub sticky_source: Option<&'static str>,
}

struct RoutingEntry {
    strikes: AtomicU32,
    /// Monotonic millis since the strategy's `epoch_instant`; `0` means
    /// "no active cooldown".
    cooldown_until_ms: AtomicI64,
}

impl RoutingEntry {
    fn new() -> Self {
        Self {
            strikes: AtomicU32::new(0),
            cooldown_until_ms: AtomicI64::new(0),
        }
    }
}

/// Serializable snapshot of one credential's routing state, matching the
/// `routing_state` config key shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownSnapshot {
    pub credential_id: String,
    pub strikes: u32,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingStateSnapshot {
    pub cooldowns: Vec<CooldownSnapshot>,
}

pub struct RoutingStrategy {
    manager: Arc<CredentialManager>,
    config: CredentialManagerConfig,
    state: DashMap<String, RoutingEntry>,
    epoch_instant: Instant,
    epoch_wall: DateTime<Utc>,
}

impl RoutingStrategy {
    pub fn new(manager: Arc<CredentialManager>, config: CredentialManagerConfig) -> Self {
        Self {
            manager,
            config,
            state: DashMap::new(),
            epoch_instant: Instant::now(),
            epoch_wall: Utc::now(),
        }
    }

    fn monotonic_millis(&self, instant: Instant) -> i64 {
        instant.saturating_duration_since(self.epoch_instant).as_millis() as i64
    }

    fn is_cooled(&self, id: &str, now_ms: i64) -> bool {
        self.state.get(id).is_some_and(|entry| {
            let until = entry.cooldown_until_ms.load(Ordering::Acquire);
            until > now_ms
        })
    }

    fn eligible(&self, cred: &Credential, now_ms: i64) -> bool {
        !cred.is_terminally_invalid()
            && !cred.is_banned(Utc::now())
            && !self.is_cooled(&cred.id, now_ms)
            && cred.in_flight.load(Ordering::Acquire) < self.config.max_concurrent_per_credential
    }

    /// Resolves the sticky header from inbound request headers, if present.
    pub fn sticky_id_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
        headers
            .get(STICKY_CREDENTIAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn pick(&self, sticky_id: Option<&str>) -> Result<Arc<Credential>, GatewayError> {
        self.pick_with_info(sticky_id).map(|(cred, _)| cred)
    }

    /// Synchronous pick: sticky header, then round-robin scan from the
    /// cursor. Does not fall back to [`CredentialManager::get_credential`]'s
    /// brief-sleep-and-retry — that fallback needs to `.await`, so it lives
    /// in the dispatcher, which calls it when this returns
    /// `NoAvailableCredential`.
    pub fn pick_with_info(&self, sticky_id: Option<&str>) -> Result<(Arc<Credential>, PickInfo), GatewayError> {
        let now_ms = self.monotonic_millis(Instant::now());

        if let Some(id) = sticky_id {
            if let Some(cred) = self.manager.get(id) {
                if self.eligible(&cred, now_ms) {
                    return Ok((
                        cred.clone(),
                        PickInfo {
                            credential_id: cred.id.clone(),
                            reason: PickReason::Sticky,
                            sticky_source: Some("header"),
                        },
                    ));
                }
            }
        }

        for cred in self.manager.ordered_from_cursor() {
            if self.eligible(&cred, now_ms) {
                return Ok((
                    cred.clone(),
                    PickInfo {
                        credential_id: cred.id.clone(),
                        reason: PickReason::RoundRobin,
                        sticky_source: None,
                    },
                ));
            }
        }

        Err(GatewayError::NoAvailableCredential)
    }

    /// Applies the outcome of an upstream attempt to `credential_id`'s
    /// routing state. `status = None` means a network-level failure (no
    /// HTTP status available at all).
    pub fn on_result(&self, credential_id: &str, status: Option<u16>) {
        match status {
            None => self.strike(credential_id),
            Some(s) if s == 429 || (500..=599).contains(&s) => self.strike(credential_id),
            Some(401) | Some(403) => {
                if let Some(cred) = self.manager.get(credential_id) {
                    self.manager
                        .mark_failure(&cred, status.and_then(|s| axum::http::StatusCode::from_u16(s).ok()));
                }
                self.set_cooldown(credential_id, AUTH_FAILURE_COOLDOWN);
            }
            Some(s) if (200..400).contains(&s) => self.clear(credential_id),
            Some(_) => {}
        }
    }

    /// Applies an explicit cooldown (e.g. a `RateLimit(duration)` action
    /// derived from an upstream `quotaResetTimeStamp`) in place of the
    /// default strike-based backoff.
    pub fn cooldown_for(&self, credential_id: &str, duration: std::time::Duration) {
        self.set_cooldown(credential_id, duration);
    }

    fn strike(&self, credential_id: &str) {
        let entry = self
            .state
            .entry(credential_id.to_string())
            .or_insert_with(RoutingEntry::new);
        let strikes = entry.strikes.fetch_add(1, Ordering::AcqRel) + 1;
        let backoff = backoff_for(strikes);
        let until_ms = self.monotonic_millis(Instant::now() + backoff);
        entry.cooldown_until_ms.store(until_ms, Ordering::Release);
    }

    fn set_cooldown(&self, credential_id: &str, duration: std::time::Duration) {
        let entry = self
            .state
            .entry(credential_id.to_string())
            .or_insert_with(RoutingEntry::new);
        let until_ms = self.monotonic_millis(Instant::now() + duration);
        entry.cooldown_until_ms.store(until_ms, Ordering::Release);
    }

    fn clear(&self, credential_id: &str) {
        if let Some(entry) = self.state.get(credential_id) {
            entry.strikes.store(0, Ordering::Release);
            entry.cooldown_until_ms.store(0, Ordering::Release);
        }
    }

    /// Produces a persistable snapshot of every credential currently under
    /// an active cooldown.
    pub fn snapshot(&self) -> RoutingStateSnapshot {
        let now_ms = self.monotonic_millis(Instant::now());
        let cooldowns = self
            .state
            .iter()
            .filter(|entry| entry.cooldown_until_ms.load(Ordering::Acquire) > now_ms)
            .map(|entry| {
                let until_ms = entry.cooldown_until_ms.load(Ordering::Acquire);
                let cooldown_until = self.epoch_wall + chrono::Duration::milliseconds(until_ms);
                CooldownSnapshot {
                    credential_id: entry.key().clone(),
                    strikes: entry.strikes.load(Ordering::Acquire),
                    cooldown_until,
                }
            })
            .collect();
        RoutingStateSnapshot { cooldowns }
    }

    /// Restores routing state from a prior snapshot, re-applying each
    /// cooldown with a minimum floor to avoid every credential becoming
    /// eligible at once right after a restart.
    pub fn restore(&self, snapshot: RoutingStateSnapshot) {
        let now = Utc::now();
        for entry in snapshot.cooldowns {
            let remaining = (entry.cooldown_until - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .max(RESTORE_MIN_COOLDOWN);
            let routing_entry = self
                .state
                .entry(entry.credential_id.clone())
                .or_insert_with(RoutingEntry::new);
            routing_entry.strikes.store(entry.strikes, Ordering::Release);
            let until_ms = self.monotonic_millis(Instant::now() + remaining);
            routing_entry.cooldown_until_ms.store(until_ms, Ordering::Release);
        }
    }
}

/// Capped exponential backoff: `5s * 2^(strikes-1)`, capped at 10 minutes.
fn backoff_for(strikes: u32) -> std::time::Duration {
    let shift = strikes.saturating_sub(1).min(10);
    COOLDOWN_BASE.saturating_mul(1 << shift).min(COOLDOWN_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_exponential() {
        assert_eq!(backoff_for(1), std::time::Duration::from_secs(5));
        assert_eq!(backoff_for(2), std::time::Duration::from_secs(10));
        assert_eq!(backoff_for(3), std::time::Duration::from_secs(20));
        assert_eq!(backoff_for(20), COOLDOWN_CAP);
    }
}
