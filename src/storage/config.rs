//! Application configuration.
//!
//! TOML-backed config under the project config directory, plus a
//! process-wide refreshable handle so the scheduler's config-polling task
//! can pick up edits (worker cadence, session timeout, log filter) without
//! a restart.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Data directory (database location)
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Worker tick interval in seconds
    pub worker_interval_secs: u64,
    /// Live session inactivity timeout in seconds
    pub session_timeout_secs: u64,
    /// Aggregation result cache TTL in seconds (keep below the tick interval)
    pub cache_ttl_secs: u64,
    /// Config refresh poll interval in seconds
    pub config_refresh_secs: u64,
    /// Coins accrued per kilometre ridden
    pub coins_per_km: f64,
    /// Tracing filter directive (e.g. "info", "schoolride=debug")
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            worker_interval_secs: 60,
            session_timeout_secs: 300,
            cache_ttl_secs: 55,
            config_refresh_secs: 30,
            coins_per_km: 1.0,
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("schoolride.db")
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "schoolride", "SchoolRide")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load application configuration from file.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load configuration from an explicit path (missing file yields defaults).
pub fn load_config_from(path: &PathBuf) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let mut config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.data_dir = get_data_dir();

    Ok(config)
}

/// Save application configuration to file.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    let path = get_config_path();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

static SETTINGS: OnceLock<RwLock<AppConfig>> = OnceLock::new();

/// Process-wide refreshable settings handle.
pub struct Settings;

impl Settings {
    /// Install the initial configuration. Later `init` calls overwrite it.
    pub fn init(config: AppConfig) {
        match SETTINGS.get() {
            Some(lock) => {
                if let Ok(mut guard) = lock.write() {
                    *guard = config;
                }
            }
            None => {
                let _ = SETTINGS.set(RwLock::new(config));
            }
        }
    }

    /// Snapshot of the current configuration.
    pub fn current() -> AppConfig {
        SETTINGS
            .get()
            .and_then(|lock| lock.read().ok().map(|guard| guard.clone()))
            .unwrap_or_default()
    }

    /// Re-read the config file and swap in the result. Returns the fresh
    /// snapshot; a failed read leaves the current settings untouched.
    pub fn refresh() -> Result<AppConfig, ConfigError> {
        let fresh = load_config()?;
        Self::init(fresh.clone());
        Ok(fresh)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
