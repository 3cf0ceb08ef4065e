use serde::{Deserialize, Serialize};

/// Credential manager / routing strategy configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialManagerConfig {
    /// How many successful uses of a credential before the rotation cursor
    /// advances to the next one.
    /// TOML: `credential_manager.calls_per_rotation`. Default: `1`.
    #[serde(default = "default_calls_per_rotation")]
    pub calls_per_rotation: u32,

    /// Maximum concurrent in-flight upstream calls per credential.
    /// TOML: `credential_manager.max_concurrent_per_credential`. Default: `4`.
    #[serde(default = "default_max_concurrent_per_credential")]
    pub max_concurrent_per_credential: u32,

    /// Safety margin before `expires_at` at which a token is treated as
    /// expired and eagerly refreshed.
    /// TOML: `credential_manager.refresh_ahead_seconds`. Default: `180`.
    #[serde(default = "default_refresh_ahead_seconds")]
    pub refresh_ahead_seconds: i64,

    /// How long a banned credential stays excluded from routing before an
    /// auto-recovery probe is attempted.
    /// TOML: `credential_manager.auto_ban_duration_secs`. Default: `1800` (30 min).
    #[serde(default = "default_auto_ban_duration_secs")]
    pub auto_ban_duration_secs: i64,

    /// Consecutive-failure threshold that triggers an auto-ban regardless of
    /// HTTP status class.
    /// TOML: `credential_manager.consecutive_failure_threshold`. Default: `5`.
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Auto-ban threshold for 401 responses.
    #[serde(default = "default_threshold_401")]
    pub threshold_401: u32,
    /// Auto-ban threshold for 403 responses.
    #[serde(default = "default_threshold_403")]
    pub threshold_403: u32,
    /// Auto-ban threshold for 429 responses.
    #[serde(default = "default_threshold_429")]
    pub threshold_429: u32,
    /// Auto-ban threshold for 5xx responses.
    #[serde(default = "default_threshold_5xx")]
    pub threshold_5xx: u32,

    /// Interval, in seconds, between periodic-refresh sweeps.
    /// TOML: `credential_manager.periodic_refresh_interval_secs`. Default: `60`.
    #[serde(default = "default_periodic_refresh_interval_secs")]
    pub periodic_refresh_interval_secs: u64,

    /// Interval, in seconds, between auto-recovery probe sweeps.
    /// TOML: `credential_manager.auto_recovery_interval_secs`. Default: `300`.
    #[serde(default = "default_auto_recovery_interval_secs")]
    pub auto_recovery_interval_secs: u64,

    /// Debounce window, in milliseconds, for the auth-directory file watcher.
    /// TOML: `credential_manager.watch_debounce_ms`. Default: `500`.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Process-environment variable prefix recognized by the env credential
    /// source (e.g. `CODEASSIST_CRED_<id>`).
    /// TOML: `credential_manager.env_prefix`. Default: `CODEASSIST_CRED_`.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

impl Default for CredentialManagerConfig {
    fn default() -> Self {
        Self {
            calls_per_rotation: default_calls_per_rotation(),
            max_concurrent_per_credential: default_max_concurrent_per_credential(),
            refresh_ahead_seconds: default_refresh_ahead_seconds(),
            auto_ban_duration_secs: default_auto_ban_duration_secs(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            threshold_401: default_threshold_401(),
            threshold_403: default_threshold_403(),
            threshold_429: default_threshold_429(),
            threshold_5xx: default_threshold_5xx(),
            periodic_refresh_interval_secs: default_periodic_refresh_interval_secs(),
            auto_recovery_interval_secs: default_auto_recovery_interval_secs(),
            watch_debounce_ms: default_watch_debounce_ms(),
            env_prefix: default_env_prefix(),
        }
    }
}

/// The fixed header clients use to request a specific credential, pinning a
/// request to it for the duration of the call instead of letting the
/// routing strategy pick.
pub const STICKY_CREDENTIAL_HEADER: &str = "x-codeassist-credential-id";

fn default_calls_per_rotation() -> u32 {
    1
}
fn default_max_concurrent_per_credential() -> u32 {
    4
}
fn default_refresh_ahead_seconds() -> i64 {
    180
}
fn default_auto_ban_duration_secs() -> i64 {
    1800
}
fn default_consecutive_failure_threshold() -> u32 {
    5
}
fn default_threshold_401() -> u32 {
    3
}
fn default_threshold_403() -> u32 {
    3
}
fn default_threshold_429() -> u32 {
    3
}
fn default_threshold_5xx() -> u32 {
    5
}
fn default_periodic_refresh_interval_secs() -> u64 {
    60
}
fn default_auto_recovery_interval_secs() -> u64 {
    300
}
fn default_watch_debounce_ms() -> u64 {
    500
}
fn default_env_prefix() -> String {
    "CODEASSIST_CRED_".to_string()
}
