use serde::{Deserialize, Serialize};

/// Usage-tracker configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageConfig {
    /// How often in-memory usage counters are flushed to storage.
    /// TOML: `usage.persist_interval_secs`. Default: `30`.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,

    /// Hour of day (0-23, in the configured reset timezone) at which daily
    /// counters reset.
    /// TOML: `usage.reset_hour`. Default: `0`.
    #[serde(default = "default_reset_hour")]
    pub reset_hour: u32,

    /// Fixed UTC offset, in minutes, of the timezone daily resets are
    /// computed against. Positive is east of UTC.
    /// TOML: `usage.reset_utc_offset_minutes`. Default: `0`.
    #[serde(default = "default_reset_utc_offset_minutes")]
    pub reset_utc_offset_minutes: i32,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            persist_interval_secs: default_persist_interval_secs(),
            reset_hour: default_reset_hour(),
            reset_utc_offset_minutes: default_reset_utc_offset_minutes(),
        }
    }
}

fn default_persist_interval_secs() -> u64 {
    30
}
fn default_reset_hour() -> u32 {
    0
}
fn default_reset_utc_offset_minutes() -> i32 {
    0
}
