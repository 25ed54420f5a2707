use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JITTER_MS: u64 = 100;
pub const DEFAULT_EXPIRATION_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 10_800; // every three hours
pub const DEFAULT_WARNING_DAYS: i64 = 7;
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_PERSPECTIVE_ENDPOINT: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

/// Top-level config (quarry.toml + QUARRY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-datasource settings, keyed by datasource id.
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
    #[serde(default)]
    pub expiration: ExpirationConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub perspective: PerspectiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Installation root. Holds `.current-version`.
    #[serde(default = "default_root")]
    pub root: String,
    /// Directory for dataset result artifacts. Defaults to `<root>/data`.
    pub results: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            results: None,
        }
    }
}

impl StorageConfig {
    pub fn results_dir(&self) -> PathBuf {
        match self.results {
            Some(ref dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.root).join("data"),
        }
    }

    pub fn version_file(&self) -> PathBuf {
        PathBuf::from(&self.root).join(".current-version")
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound of the random delay added to every poll.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// A claim whose heartbeat is older than this is considered abandoned.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_stale_check_secs")]
    pub stale_check_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Reclaimed jobs that already used this many attempts are dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Seed every declared ensure-job when the pool starts.
    #[serde(default = "bool_true")]
    pub seed_on_start: bool,
    /// Re-seed a type's ensure-job after each of its jobs completes.
    #[serde(default = "bool_true")]
    pub seed_on_completion: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            jitter_ms: DEFAULT_JITTER_MS,
            stale_timeout_secs: default_stale_timeout_secs(),
            stale_check_secs: default_stale_check_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            max_attempts: default_max_attempts(),
            max_backoff_secs: default_max_backoff_secs(),
            seed_on_start: true,
            seed_on_completion: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Delete top-level datasets of this datasource once they are older than
    /// this many seconds. `None` or 0 keeps them forever.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationConfig {
    #[serde(default = "default_expiration_interval")]
    pub interval_secs: u64,
    /// Users whose account expires within this many days get a warning.
    #[serde(default = "default_warning_days")]
    pub warning_days: i64,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_EXPIRATION_INTERVAL_SECS,
            warning_days: DEFAULT_WARNING_DAYS,
        }
    }
}

/// Update checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Repository to check, e.g. `https://github.com/owner/repo`.
    /// No update checks are scheduled while this is unset.
    pub github_url: Option<String>,
    #[serde(default = "default_github_api")]
    pub api_base: String,
    #[serde(default = "default_update_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_update_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            github_url: None,
            api_base: default_github_api(),
            interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            timeout_secs: default_update_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveConfig {
    #[serde(default = "default_perspective_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_perspective_timeout")]
    pub timeout_secs: u64,
}

impl Default for PerspectiveConfig {
    fn default() -> Self {
        Self {
            endpoint: default_perspective_endpoint(),
            timeout_secs: default_perspective_timeout(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_jitter_ms() -> u64 {
    DEFAULT_JITTER_MS
}
fn default_stale_timeout_secs() -> u64 {
    600
}
fn default_stale_check_secs() -> u64 {
    60
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_expiration_interval() -> u64 {
    DEFAULT_EXPIRATION_INTERVAL_SECS
}
fn default_warning_days() -> i64 {
    DEFAULT_WARNING_DAYS
}
fn default_github_api() -> String {
    DEFAULT_GITHUB_API.to_string()
}
fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL_SECS
}
fn default_update_timeout() -> u64 {
    5
}
fn default_perspective_endpoint() -> String {
    DEFAULT_PERSPECTIVE_ENDPOINT.to_string()
}
fn default_perspective_timeout() -> u64 {
    15
}
fn quarry_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.quarry", home)
}
fn default_db_path() -> String {
    format!("{}/quarry.db", quarry_home())
}
fn default_root() -> String {
    quarry_home()
}

impl QuarryConfig {
    /// Load config from a TOML file with QUARRY_* env var overrides.
    /// Sections and keys are separated by a double underscore, e.g.
    /// `QUARRY_SCHEDULER__POLL_INTERVAL_MS`.
    ///
    /// Falls back to `~/.quarry/quarry.toml` when no path is given. A missing
    /// file is not an error: every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: QuarryConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("QUARRY_").split("__"))
            .extract()
            .map_err(|e| crate::error::QuarryError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Expiration timeout for a datasource, if it has a non-zero one.
    pub fn datasource_timeout(&self, datasource: &str) -> Option<u64> {
        self.datasources
            .get(datasource)
            .and_then(|d| d.timeout)
            .filter(|t| *t > 0)
    }
}

fn default_config_path() -> String {
    format!("{}/quarry.toml", quarry_home())
}
