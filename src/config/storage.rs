use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which storage backend family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// Pick the first healthy backend from `preference`, else fall back to `file`.
    #[default]
    Auto,
    File,
    Redis,
    Mongo,
    Postgres,
    Git,
}

/// Storage configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Which backend family to construct.
    /// TOML: `storage.backend`. Default: `auto`.
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Ordered preference list used by `backend = "auto"`.
    /// TOML: `storage.preference`. Default: `["redis", "postgres", "mongo", "file"]`.
    #[serde(default = "default_preference")]
    pub preference: Vec<StorageBackendKind>,

    /// Base directory for the local-file backend and for the on-disk
    /// credential mirror when the primary backend is not `file`.
    /// TOML: `storage.auth_dir`. Default: `./auth`.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// Redis connection URL (e.g. `redis://127.0.0.1:6379/0`).
    /// TOML: `storage.redis_url`.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// MongoDB connection URI.
    /// TOML: `storage.mongo_uri`.
    #[serde(default)]
    pub mongo_uri: Option<String>,

    /// MongoDB database name.
    /// TOML: `storage.mongo_database`. Default: `codeassist_gateway`.
    #[serde(default = "default_mongo_database")]
    pub mongo_database: String,

    /// Postgres DSN, also used by the `migrate` binary.
    /// TOML: `storage.postgres_dsn`.
    #[serde(default)]
    pub postgres_dsn: Option<String>,

    /// Local path to the embedded git repository backing the `git` backend.
    /// TOML: `storage.git_path`. Default: `./git-storage`.
    #[serde(default = "default_git_path")]
    pub git_path: PathBuf,

    /// Interval, in seconds, on which the storage mirror re-syncs `auth_dir`
    /// from a non-file primary backend.
    /// TOML: `storage.mirror_interval_secs`. Default: `45`.
    #[serde(default = "default_mirror_interval_secs")]
    pub mirror_interval_secs: u64,

    /// Number of days commit-history rows for two-phase batch applies are
    /// retained (Mongo backend only).
    /// TOML: `storage.plan_history_retention_days`. Default: `14`.
    #[serde(default = "default_plan_history_retention_days")]
    pub plan_history_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            preference: default_preference(),
            auth_dir: default_auth_dir(),
            redis_url: None,
            mongo_uri: None,
            mongo_database: default_mongo_database(),
            postgres_dsn: None,
            git_path: default_git_path(),
            mirror_interval_secs: default_mirror_interval_secs(),
            plan_history_retention_days: default_plan_history_retention_days(),
        }
    }
}

fn default_preference() -> Vec<StorageBackendKind> {
    vec![
        StorageBackendKind::Redis,
        StorageBackendKind::Postgres,
        StorageBackendKind::Mongo,
        StorageBackendKind::File,
    ]
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("./auth")
}

fn default_mongo_database() -> String {
    "codeassist_gateway".to_string()
}

fn default_git_path() -> PathBuf {
    PathBuf::from("./git-storage")
}

fn default_mirror_interval_secs() -> u64 {
    45
}

fn default_plan_history_retention_days() -> i64 {
    14
}
