//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sogamo/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sogamo/` (~/.config/sogamo/)
//! - Data: `$XDG_DATA_HOME/sogamo/` (~/.local/share/sogamo/)
//! - State/Logs: `$XDG_STATE_HOME/sogamo/` (~/.local/state/sogamo/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Largest batch the ingestion endpoints accept in one request.
pub const MAX_BATCH_SIZE_LIMIT: usize = 50;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Queueing and delivery configuration
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Tracker configuration
///
/// Controls how records are buffered, how often they are flushed and how
/// delivery failures are backed off.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Base URL of the analytics service
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Seconds between timer-driven flushes (0 turns the flush timer off)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Pending records kept per lane before the oldest is dropped
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// Records per request (max 50)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Batches sent per lane in one flush attempt
    #[serde(default = "default_max_batches_per_flush")]
    pub max_batches_per_flush: usize,

    /// Delay after the first failed attempt, doubled on each further failure
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds between periodic snapshots (0 disables the snapshot timer)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Flush when the host application moves to the background
    #[serde(default = "default_flush_on_background")]
    pub flush_on_background: bool,

    /// Time allowed for the background/terminate flush
    #[serde(default = "default_background_flush_budget")]
    pub background_flush_budget_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            flush_interval_secs: default_flush_interval(),
            max_queue_length: default_max_queue_length(),
            max_batch_size: default_max_batch_size(),
            max_batches_per_flush: default_max_batches_per_flush(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            snapshot_interval_secs: default_snapshot_interval(),
            flush_on_background: default_flush_on_background(),
            background_flush_budget_secs: default_background_flush_budget(),
        }
    }
}

impl TrackerConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::Config("tracker.server_url must not be empty".to_string()));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "tracker.server_url must be an http(s) URL, got {}",
                self.server_url
            )));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(Error::Config(format!(
                "tracker.max_batch_size must be between 1 and {}",
                MAX_BATCH_SIZE_LIMIT
            )));
        }
        if self.max_queue_length == 0 {
            return Err(Error::Config(
                "tracker.max_queue_length must be at least 1".to_string(),
            ));
        }
        if self.max_batches_per_flush == 0 {
            return Err(Error::Config(
                "tracker.max_batches_per_flush must be at least 1".to_string(),
            ));
        }
        if Duration::from_millis(self.initial_backoff_ms) > self.max_backoff() {
            return Err(Error::Config(
                "tracker.initial_backoff_ms must not exceed tracker.max_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Server URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Flush timer period, `None` when flushing is manual-only
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }

    /// Snapshot timer period, `None` when disabled
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_secs > 0).then(|| Duration::from_secs(self.snapshot_interval_secs))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn background_flush_budget(&self) -> Duration {
        Duration::from_secs(self.background_flush_budget_secs)
    }
}

fn default_server_url() -> String {
    "https://api.sogamo.com".to_string()
}

fn default_flush_interval() -> u64 {
    60
}

fn default_max_queue_length() -> usize {
    500
}

fn default_max_batch_size() -> usize {
    50
}

fn default_max_batches_per_flush() -> usize {
    10
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    600
}

fn default_request_timeout() -> u64 {
    30
}

fn default_snapshot_interval() -> u64 {
    10
}

fn default_flush_on_background() -> bool {
    true
}

fn default_background_flush_budget() -> u64 {
    10
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.tracker.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sogamo/config.toml` (~/.config/sogamo/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sogamo").join("config.toml")
    }

    /// Returns the data directory path (for the snapshot database)
    ///
    /// `$XDG_DATA_HOME/sogamo/` (~/.local/share/sogamo/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sogamo")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/sogamo/` (~/.local/state/sogamo/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sogamo")
    }

    /// Returns the snapshot database path
    ///
    /// `$XDG_DATA_HOME/sogamo/sogamo.db` (~/.local/share/sogamo/sogamo.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("sogamo.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/sogamo/sogamo.log` (~/.local/state/sogamo/sogamo.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("sogamo.log")
    }
}
