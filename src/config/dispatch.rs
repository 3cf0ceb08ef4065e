use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upstream dispatcher configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Timeout, in seconds, for `generate` calls.
    /// TOML: `dispatch.generate_timeout_secs`. Default: `180`.
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,

    /// Timeout, in seconds, for `stream` calls (the whole SSE session).
    /// TOML: `dispatch.stream_timeout_secs`. Default: `600`.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Timeout, in seconds, for `count_tokens` and `action` calls.
    /// TOML: `dispatch.short_op_timeout_secs`. Default: `60`.
    #[serde(default = "default_short_op_timeout_secs")]
    pub short_op_timeout_secs: u64,

    /// Maximum credential rotations attempted per upstream call (per model
    /// in the fallback chain).
    /// TOML: `dispatch.max_rotations`. Default: `3`.
    #[serde(default = "default_max_rotations")]
    pub max_rotations: u32,

    /// Whether a 5xx response is treated as recoverable (rotated) or
    /// surfaced immediately.
    /// TOML: `dispatch.retry_on_5xx`. Default: `true`.
    #[serde(default = "default_retry_on_5xx")]
    pub retry_on_5xx: bool,

    /// Ordered fallback chain per base model. Absent entries fall back to a
    /// single-element chain (the base model only).
    /// TOML: `dispatch.fallback_chains`.
    #[serde(default)]
    pub fallback_chains: HashMap<String, Vec<String>>,

    /// Model name substrings that request fake streaming (unary upstream
    /// response split into a synthetic SSE stream).
    /// TOML: `dispatch.fake_stream_models`.
    #[serde(default)]
    pub fake_stream_models: Vec<String>,

    /// Rune-chunk size used by the fake-streaming splitter.
    /// TOML: `dispatch.fake_stream_chunk_size`. Default: `24`.
    #[serde(default = "default_fake_stream_chunk_size")]
    pub fake_stream_chunk_size: usize,

    /// Inter-chunk delay, in milliseconds, for fake streaming.
    /// TOML: `dispatch.fake_stream_delay_ms`. Default: `20`.
    #[serde(default = "default_fake_stream_delay_ms")]
    pub fake_stream_delay_ms: u64,

    /// Model name substrings that enable anti-truncation continuation.
    /// TOML: `dispatch.anti_truncation_models`.
    #[serde(default)]
    pub anti_truncation_models: Vec<String>,

    /// Maximum continuation attempts for anti-truncation.
    /// TOML: `dispatch.anti_truncation_max_attempts`. Default: `3`.
    #[serde(default = "default_anti_truncation_max_attempts")]
    pub anti_truncation_max_attempts: u32,

    /// Sentinel string injected into the system instruction and checked for
    /// in the final candidate to detect truncation.
    /// TOML: `dispatch.anti_truncation_sentinel`. Default: `[done]`.
    #[serde(default = "default_anti_truncation_sentinel")]
    pub anti_truncation_sentinel: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            generate_timeout_secs: default_generate_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            short_op_timeout_secs: default_short_op_timeout_secs(),
            max_rotations: default_max_rotations(),
            retry_on_5xx: default_retry_on_5xx(),
            fallback_chains: HashMap::new(),
            fake_stream_models: Vec::new(),
            fake_stream_chunk_size: default_fake_stream_chunk_size(),
            fake_stream_delay_ms: default_fake_stream_delay_ms(),
            anti_truncation_models: Vec::new(),
            anti_truncation_max_attempts: default_anti_truncation_max_attempts(),
            anti_truncation_sentinel: default_anti_truncation_sentinel(),
        }
    }
}

impl DispatchConfig {
    /// Resolve the fallback chain for a base model, defaulting to a
    /// single-element chain containing only the base model itself.
    pub fn fallback_chain_for<'a>(&'a self, base_model: &'a str) -> Vec<&'a str> {
        match self.fallback_chains.get(base_model) {
            Some(chain) if !chain.is_empty() => chain.iter().map(String::as_str).collect(),
            _ => vec![base_model],
        }
    }

    pub fn wants_fake_stream(&self, model: &str) -> bool {
        self.fake_stream_models.iter().any(|m| model.contains(m))
    }

    pub fn wants_anti_truncation(&self, model: &str) -> bool {
        self.anti_truncation_models
            .iter()
            .any(|m| model.contains(m))
    }
}

fn default_generate_timeout_secs() -> u64 {
    180
}
fn default_stream_timeout_secs() -> u64 {
    600
}
fn default_short_op_timeout_secs() -> u64 {
    60
}
fn default_max_rotations() -> u32 {
    3
}
fn default_retry_on_5xx() -> bool {
    true
}
fn default_fake_stream_chunk_size() -> usize {
    24
}
fn default_fake_stream_delay_ms() -> u64 {
    20
}
fn default_anti_truncation_max_attempts() -> u32 {
    3
}
fn default_anti_truncation_sentinel() -> String {
    "[done]".to_string()
}
