use serde::{Deserialize, Serialize};
use url::Url;

/// Gemini CLI / Code Assist upstream configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiCliConfig {
    /// Optional upstream HTTP proxy. If set, used for the reqwest client.
    /// TOML: `geminicli.proxy`. Example: `http://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Allow HTTP/2 multiplexing for the reqwest client; disabled forces HTTP/1.
    /// TOML: `geminicli.enable_multiplexing`. Default: `true`.
    #[serde(default = "default_enable_multiplexing")]
    pub enable_multiplexing: bool,

    /// Network-level retry attempts per upstream call (transport errors/5xx only).
    /// TOML: `geminicli.retry_max_times`. Default: `2`.
    #[serde(default = "default_retry_max_times")]
    pub retry_max_times: usize,

    /// List of model names this gateway advertises and accepts.
    /// TOML: `geminicli.model_list`.
    #[serde(default = "default_model_list")]
    pub model_list: Vec<String>,
}

impl Default for GeminiCliConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            enable_multiplexing: default_enable_multiplexing(),
            retry_max_times: default_retry_max_times(),
            model_list: default_model_list(),
        }
    }
}

fn default_enable_multiplexing() -> bool {
    true
}

fn default_retry_max_times() -> usize {
    2
}

fn default_model_list() -> Vec<String> {
    vec![
        "gemini-2.5-pro".to_string(),
        "gemini-2.5-flash".to_string(),
        "gemini-3-pro-preview".to_string(),
    ]
}
