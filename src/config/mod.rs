mod basic;
mod credential;
mod dispatch;
mod geminicli;
mod storage;
mod usage;

pub use basic::BasicConfig;
pub use credential::{CredentialManagerConfig, STICKY_CREDENTIAL_HEADER};
pub use dispatch::DispatchConfig;
pub use geminicli::GeminiCliConfig;
pub use storage::{StorageBackendKind, StorageConfig};
pub use usage::UsageConfig;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Application configuration managed by Figment (TOML file + env overrides).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Gemini CLI / Code Assist upstream configuration.
    #[serde(default)]
    pub geminicli: GeminiCliConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Credential manager and routing strategy configuration.
    #[serde(default)]
    pub credential_manager: CredentialManagerConfig,

    /// Upstream dispatcher configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Usage-tracker configuration.
    #[serde(default)]
    pub usage: UsageConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults, a config TOML file, and
    /// `CODEASSIST_`-prefixed environment overrides.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        let figment = if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        };
        figment.merge(Env::prefixed("CODEASSIST_").split("__"))
    }

    /// Loads configuration by merging defaults, `config.toml` if present, and
    /// environment overrides.
    ///
    /// Note: this does **not** validate required fields like `basic.api_key`.
    /// Binaries should call [`Config::from_toml`] instead to avoid running
    /// with insecure defaults.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }

    /// Loads configuration from the TOML file (with defaults and env
    /// overrides) and validates required fields.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {}", DEFAULT_CONFIG_FILE);
        }
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!(
                "failed to extract configuration from {}: {err}",
                DEFAULT_CONFIG_FILE
            )
        });
        if cfg.basic.api_key.trim().is_empty() {
            panic!("basic.api_key must be set and non-empty");
        }
        cfg
    }

    /// Loads configuration from an explicit TOML file path (defaults + env
    /// overrides layered on top, same as [`Config::from_optional_toml`]), for
    /// CLI tools that take a `-config` flag instead of relying on the
    /// server's implicit `config.toml` discovery in the working directory.
    pub fn from_path(path: &std::path::Path) -> Self {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CODEASSIST_").split("__"));
        figment
            .extract()
            .unwrap_or_else(|err| panic!("failed to extract configuration from {}: {err}", path.display()))
    }
}

/// Global, lazily-initialized configuration instance.
///
/// Library code reads `CONFIG` directly (best-effort, does not validate);
/// the server binary calls [`Config::from_toml`] so it fails fast on a
/// missing or invalid config file instead of silently running insecure.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);
