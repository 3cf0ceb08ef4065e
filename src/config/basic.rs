use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};

/// Basic (core) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// HTTP listen address shared by both listeners.
    /// TOML: `basic.listen_addr`. Default: `0.0.0.0`.
    #[serde(default = "default_listen_ip")]
    pub listen_addr: IpAddr,

    /// OpenAI-compatible listener port. `0` disables the listener.
    /// TOML: `basic.openai_port`. Default: `8188`.
    #[serde(default = "default_openai_port")]
    pub openai_port: u16,

    /// Gemini-native listener port. `0` disables the listener.
    /// TOML: `basic.gemini_port`. Default: `8189`.
    #[serde(default = "default_gemini_port")]
    pub gemini_port: u16,

    /// Log level for tracing subscriber initialization (e.g. "error", "warn", "info", "debug").
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Authentication key checked against inbound `Authorization: Bearer`,
    /// `x-api-key`, `x-goog-api-key`, `?key=`, or the admin session cookie.
    /// TOML: `basic.api_key`. Must be non-empty for the server binary.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_string_lax")]
    pub api_key: String,

    /// Name of the session cookie accepted on the `/admin` sub-path.
    /// TOML: `basic.admin_cookie_name`. Default: `codeassist_admin_session`.
    #[serde(default = "default_admin_cookie_name")]
    pub admin_cookie_name: String,

    /// Graceful shutdown budget for in-flight background tasks, in seconds.
    /// TOML: `basic.shutdown_timeout_secs`. Default: `10`.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_ip(),
            openai_port: default_openai_port(),
            gemini_port: default_gemini_port(),
            loglevel: default_loglevel(),
            // No insecure default. `Config::from_toml()` enforces non-empty.
            api_key: String::new(),
            admin_cookie_name: default_admin_cookie_name(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn deserialize_string_lax<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;

    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected a string or a number for basic.api_key",
        )),
    }
}

fn default_listen_ip() -> IpAddr {
    Ipv4Addr::new(0, 0, 0, 0).into()
}

fn default_openai_port() -> u16 {
    8188
}

fn default_gemini_port() -> u16 {
    8189
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_admin_cookie_name() -> String {
    "codeassist_admin_session".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}
