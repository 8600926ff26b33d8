//! Configuration loading and path resolution
//!
//! Resolution priority for every path-like setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing TOML file is not an error: defaults apply and a warning is logged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SPB_CONFIG";
/// Environment variable naming the SQLite database file
pub const DATABASE_ENV_VAR: &str = "SPB_DATABASE";
/// Environment variable carrying the enrichment provider API key
pub const API_KEY_ENV_VAR: &str = "SPB_ENRICHMENT_API_KEY";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// External meeting source (Legistar Web API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Legistar client slug, e.g. "spokane"
    pub client: String,
    pub base_url: String,
    /// Days before today where an uncursored ingest starts
    pub lookback_days: u32,
    /// Meetings pulled per ingest invocation
    pub batch_size: u32,
    pub max_fetch_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub requests_per_second: u32,
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            client: "spokane".to_string(),
            base_url: "https://webapi.legistar.com/v1".to_string(),
            lookback_days: 30,
            batch_size: 25,
            max_fetch_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            requests_per_second: 2,
            request_timeout_secs: 30,
        }
    }
}

/// AI enrichment provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 1024,
            request_timeout_secs: 60,
            requests_per_second: 1,
        }
    }
}

/// Work queue delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a received message stays invisible to other consumers
    pub visibility_timeout_secs: u64,
    /// Deliveries after which a retryable failure is dead-lettered
    pub max_receives: u32,
    pub retry_base_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            max_receives: 5,
            retry_base_delay_secs: 30,
        }
    }
}

/// Analyzer consumer pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub workers: usize,
    pub idle_poll_ms: u64,
    /// Deadline for a single processing attempt (AI call included)
    pub attempt_deadline_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll_ms: 1000,
            attempt_deadline_secs: 120,
        }
    }
}

/// Search index refresh policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub refresh_interval_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load TOML config from an explicit path
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Write TOML config atomically (used by `spb-engine init-config`)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    // Write to a sibling temp file, then rename, so readers never see a partial file
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Locate and load configuration, falling back to defaults
///
/// An explicitly named file (CLI or env) that fails to load is an error;
/// a missing default-location file is not.
pub fn resolve_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = cli_path {
        info!("Loading config from {}", path.display());
        return load_toml_config(path);
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        info!("Loading config from {} ({})", path.display(), CONFIG_ENV_VAR);
        return load_toml_config(&path);
    }

    match default_config_file() {
        Some(path) => {
            info!("Loading config from {}", path.display());
            load_toml_config(&path)
        }
        None => {
            warn!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Resolve the database path: CLI → ENV → TOML → OS default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    default_data_dir().join("spb.db")
}

/// Resolve enrichment API key: ENV → TOML
pub fn resolve_api_key(config: &TomlConfig) -> Result<String> {
    let env_key = std::env::var(API_KEY_ENV_VAR).ok().filter(|k| is_valid_key(k));
    let toml_key = config.enrichment.api_key.clone().filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!(
            "Enrichment API key found in environment and TOML. Using environment (highest priority)."
        );
    }

    if let Some(key) = env_key {
        info!("Enrichment API key loaded from environment variable");
        return Ok(key);
    }

    if let Some(key) = toml_key {
        info!("Enrichment API key loaded from TOML config");
        return Ok(key);
    }

    Err(Error::Config(format!(
        "Enrichment API key not configured. Set {} or [enrichment] api_key in spb.toml",
        API_KEY_ENV_VAR
    )))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// First existing config file in the platform search path
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("spb").join("spb.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/spb/spb.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("spb"))
        .unwrap_or_else(|| PathBuf::from("./spb_data"))
}
