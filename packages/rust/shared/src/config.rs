//! Application configuration for crawlbatch.
//!
//! User config lives at `~/.crawlbatch/crawlbatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CrawlBatchError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "crawlbatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".crawlbatch";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "crawlbatch.db";

// ---------------------------------------------------------------------------
// Config structs (matching crawlbatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote executor endpoint.
    #[serde(default)]
    pub executor: ExecutorSection,

    /// Runner pacing, retry and checkpoint policy.
    #[serde(default)]
    pub runner: RunnerSection,

    /// Local job store.
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[executor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Base URL of the remote service (the `/crawl` path is appended).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of an env var that, when set, overrides `base_url`.
    #[serde(default = "default_base_url_env")]
    pub base_url_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            base_url_env: default_base_url_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5000".into()
}
fn default_base_url_env() -> String {
    "CRAWLBATCH_API_URL".into()
}
fn default_timeout_secs() -> u64 {
    60
}

/// How a resumed job derives its checkpoint from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointMode {
    /// Count of groups present as keys in the stored results.
    ///
    /// Groups that failed or produced zero records leave no key, so the
    /// derived checkpoint can fall behind the real one.
    #[default]
    KeyCount,
    /// Leading run of units carrying an explicit attempted marker.
    AttemptedMarker,
}

impl std::fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyCount => f.write_str("key-count"),
            Self::AttemptedMarker => f.write_str("attempted-marker"),
        }
    }
}

impl std::str::FromStr for CheckpointMode {
    type Err = CrawlBatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "key-count" => Ok(Self::KeyCount),
            "attempted-marker" => Ok(Self::AttemptedMarker),
            other => Err(CrawlBatchError::config(format!(
                "unknown checkpoint mode '{other}': expected 'key-count' or 'attempted-marker'"
            ))),
        }
    }
}

/// `[runner]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Fixed delay between units in ms.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Checkpoint derivation when resuming from the store.
    #[serde(default)]
    pub checkpoint_mode: CheckpointMode,

    /// Extra attempts per failed unit. 0 = skip and continue.
    #[serde(default)]
    pub max_retries: u32,

    /// Delay between retry attempts in ms.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            checkpoint_mode: CheckpointMode::default(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_pacing_ms() -> u64 {
    1000
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Database path. Defaults to `~/.crawlbatch/crawlbatch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl ExecutorConfig {
    /// Validate and parse the base URL.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            CrawlBatchError::config(format!("invalid executor base_url '{}': {e}", self.base_url))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(CrawlBatchError::config(format!(
                "executor base_url must be http or https, got '{other}'"
            ))),
        }
    }
}

impl From<&AppConfig> for ExecutorConfig {
    fn from(config: &AppConfig) -> Self {
        let base_url = std::env::var(&config.executor.base_url_env)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| config.executor.base_url.clone());
        Self {
            base_url,
            timeout: Duration::from_secs(config.executor.timeout_secs),
        }
    }
}

/// Runtime runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Delay between consecutive units.
    pub pacing: Duration,
    pub checkpoint_mode: CheckpointMode,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RunnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pacing: Duration::from_millis(config.runner.pacing_ms),
            checkpoint_mode: config.runner.checkpoint_mode,
            max_retries: config.runner.max_retries,
            retry_backoff: Duration::from_millis(config.runner.retry_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.crawlbatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CrawlBatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.crawlbatch/crawlbatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path: explicit config value or the default location.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.db_path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(config_dir()?.join(DB_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CrawlBatchError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CrawlBatchError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CrawlBatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CrawlBatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CrawlBatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
