//! Configuration types for capture-manager
//!
//! The local configuration is a JSON document. Every field has a default so a
//! minimal file only needs the manager name and working directory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manager identity and loop behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Manager name reported to the task store (default: host name based)
    #[serde(default = "default_manager_name")]
    pub name: String,

    /// Working directory (exclusive to this manager; holds the flag file)
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Fallback working directories, tried in order when `working_dir` is invalid
    #[serde(default)]
    pub fallback_working_dirs: Vec<PathBuf>,

    /// Local enable switch (false = exit with DisabledLocally)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// What to do when a flag file is found at loop start
    #[serde(default)]
    pub cleanup_mode: CleanupMode,

    /// Number of tasks to run before the loop exits (default: 1000)
    #[serde(default = "default_max_task_count")]
    pub max_task_count: u32,

    /// Minimum time between remote settings reloads (default: 2 minutes)
    #[serde(default = "default_settings_reload", with = "duration_serde")]
    pub settings_reload_interval: Duration,

    /// Create a flag file when the loop stops for an error condition
    #[serde(default = "default_true")]
    pub create_flag_file_on_error: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: default_manager_name(),
            working_dir: default_working_dir(),
            fallback_working_dirs: Vec::new(),
            enabled: true,
            cleanup_mode: CleanupMode::default(),
            max_task_count: default_max_task_count(),
            settings_reload_interval: default_settings_reload(),
            create_flag_file_on_error: true,
        }
    }
}

/// Flag file cleanup mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Never clean automatically; a flag file stops the manager
    #[default]
    Disabled,
    /// Clean once, then switch back to Disabled
    CleanupOnce,
    /// Always clean
    CleanupAlways,
}

impl CleanupMode {
    /// Parse the numeric/textual form used by the remote settings
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "cleanup_once" | "cleanuponce" => CleanupMode::CleanupOnce,
            "2" | "cleanup_always" | "cleanupalways" => CleanupMode::CleanupAlways,
            _ => CleanupMode::Disabled,
        }
    }

    /// Value written back to the remote settings
    pub fn as_setting(self) -> &'static str {
        match self {
            CleanupMode::Disabled => "0",
            CleanupMode::CleanupOnce => "1",
            CleanupMode::CleanupAlways => "2",
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Task store connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    /// Path to the sqlite task store (default: "./capture_tasks.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Retry policy for the best-effort report-idle call
    #[serde(default)]
    pub report_idle_retry: RetryConfig,

    /// Busy retries inside one request before reporting TooManyRetries (default: 3)
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            report_idle_retry: RetryConfig::default(),
            busy_retries: default_busy_retries(),
        }
    }
}

/// Rule that skips an empty file for matching instrument classes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmptyFileSkipRule {
    /// Instrument class prefix (case-insensitive)
    pub instrument_class_prefix: String,
    /// File name to skip when it has zero length
    pub file_name: String,
}

/// Rule that skips raw files already embedded in a processed container
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddedFileSkipRule {
    /// Instrument class prefix (case-insensitive)
    pub instrument_class_prefix: String,
    /// Extension of the raw files to skip (e.g. "bin")
    pub skip_extension: String,
    /// Extension of the container whose presence triggers the skip (e.g. "uimf")
    pub container_extension: String,
}

/// Credentials and commands for instrument shares that need authentication
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Account used to connect to secured shares
    #[serde(default)]
    pub user: Option<String>,

    /// Password for `user`
    #[serde(default)]
    pub password: Option<String>,

    /// Connect command; `{share}`, `{user}` and `{password}` are substituted
    #[serde(default)]
    pub connect_command: Vec<String>,

    /// Disconnect command; `{share}` is substituted
    #[serde(default)]
    pub disconnect_command: Vec<String>,
}

/// Capture engine settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Base stability wait for recently modified data (default: 30 seconds)
    #[serde(default = "default_stability_interval", with = "duration_serde")]
    pub stability_base_interval: Duration,

    /// Chunk size for buffered copies (default: 1 MiB)
    #[serde(default = "default_chunk_size")]
    pub copy_chunk_size: usize,

    /// Maximum concurrent stability checks for multi-file datasets (default: 4)
    #[serde(default = "default_max_parallel_checks")]
    pub max_parallel_checks: usize,

    /// Replacement for characters not allowed in stored file names (default: "_")
    #[serde(default = "default_sanitize_replacement")]
    pub sanitize_replacement: String,

    /// Files that are always locked inside directory datasets and never copied
    #[serde(default = "default_locked_files")]
    pub locked_file_names: Vec<String>,

    /// Per-instrument-class empty file skip rules
    #[serde(default = "default_empty_file_rules")]
    pub empty_file_rules: Vec<EmptyFileSkipRule>,

    /// Per-instrument-class embedded raw file skip rules
    #[serde(default = "default_embedded_file_rules")]
    pub embedded_file_rules: Vec<EmbeddedFileSkipRule>,

    /// Secured share access
    #[serde(default)]
    pub share: ShareConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stability_base_interval: default_stability_interval(),
            copy_chunk_size: default_chunk_size(),
            max_parallel_checks: default_max_parallel_checks(),
            sanitize_replacement: default_sanitize_replacement(),
            locked_file_names: default_locked_files(),
            empty_file_rules: default_empty_file_rules(),
            embedded_file_rules: default_embedded_file_rules(),
            share: ShareConfig::default(),
        }
    }
}

/// Free space check on the destination volume
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Enable the check (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum free space in bytes (default: 30 GB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Step tools that never write to dataset storage
    #[serde(default = "default_exempt_tools")]
    pub exempt_tools: Vec<String>,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: default_min_free_space(),
            exempt_tools: default_exempt_tools(),
        }
    }
}

/// Status file and broadcast settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Status file path (default: "./status.json")
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,

    /// Message bus endpoint for status broadcasts (None = disabled)
    #[serde(default)]
    pub broadcast_url: Option<String>,

    /// Background refresh period (default: 60 seconds)
    #[serde(default = "default_refresh_interval", with = "duration_serde")]
    pub refresh_interval: Duration,

    /// Minimum time between status file rewrites (default: 2 seconds)
    #[serde(default = "default_min_write_interval", with = "duration_serde")]
    pub min_write_interval: Duration,

    /// Ceiling for message bus initialization (default: 60 seconds)
    #[serde(default = "default_bus_connect_timeout", with = "duration_serde")]
    pub bus_connect_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            status_file: default_status_file(),
            broadcast_url: None,
            refresh_interval: default_refresh_interval(),
            min_write_interval: default_min_write_interval(),
            bus_connect_timeout: default_bus_connect_timeout(),
        }
    }
}

/// Scratch directory purge settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Scratch directory to purge (default: system temp dir)
    #[serde(default = "std::env::temp_dir")]
    pub scratch_dir: PathBuf,

    /// Delete scratch files older than this (default: 12 hours)
    #[serde(default = "default_temp_max_age", with = "duration_serde")]
    pub temp_file_max_age: Duration,

    /// Purge after this many tasks (default: 50)
    #[serde(default = "default_purge_every")]
    pub purge_every_tasks: u32,

    /// Local hour at which the once-daily purge may run (default: 1)
    #[serde(default = "default_purge_hour")]
    pub daily_purge_hour: u32,

    /// Honor the monthly maintenance blackout window (default: true)
    #[serde(default = "default_true")]
    pub maintenance_blackout: bool,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            temp_file_max_age: default_temp_max_age(),
            purge_every_tasks: default_purge_every(),
            daily_purge_hour: default_purge_hour(),
            maintenance_blackout: true,
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include module targets in log lines
    #[serde(default = "default_true")]
    pub with_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            with_targets: true,
        }
    }
}

/// Main configuration for the capture manager
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Manager identity and loop behavior
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Task store connection
    #[serde(default)]
    pub task_store: TaskStoreConfig,

    /// Capture engine settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Destination free space check
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,

    /// Status file and broadcast
    #[serde(default)]
    pub status: StatusConfig,

    /// Scratch purge and maintenance window
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read '{}': {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| Error::Config {
            message: format!("failed to parse '{}': {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that have no sensible fallback
    pub fn validate(&self) -> Result<()> {
        if self.manager.name.trim().is_empty() {
            return Err(config_error("manager name must not be empty", "manager.name"));
        }
        if self.manager.max_task_count == 0 {
            return Err(config_error(
                "max_task_count must be at least 1",
                "manager.max_task_count",
            ));
        }
        if self.capture.copy_chunk_size == 0 {
            return Err(config_error(
                "copy_chunk_size must be greater than zero",
                "capture.copy_chunk_size",
            ));
        }
        if self.capture.max_parallel_checks == 0 {
            return Err(config_error(
                "max_parallel_checks must be at least 1",
                "capture.max_parallel_checks",
            ));
        }
        if self.status.refresh_interval.is_zero() {
            return Err(config_error(
                "refresh_interval must be greater than zero",
                "status.refresh_interval",
            ));
        }
        if let Some(url) = &self.status.broadcast_url {
            url::Url::parse(url).map_err(|e| {
                config_error(
                    &format!("invalid broadcast url '{}': {}", url, e),
                    "status.broadcast_url",
                )
            })?;
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_manager_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("Proto-{}_CTM", host)
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_true() -> bool {
    true
}

fn default_max_task_count() -> u32 {
    1000
}

fn default_settings_reload() -> Duration {
    Duration::from_secs(120)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./capture_tasks.db")
}

fn default_busy_retries() -> u32 {
    3
}

fn default_stability_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_max_parallel_checks() -> usize {
    4
}

fn default_sanitize_replacement() -> String {
    "_".to_string()
}

fn default_locked_files() -> Vec<String> {
    vec![
        "Storage.mcf_idx-journal".into(),
        "lock.file".into(),
        "desktop.ini".into(),
        "Thumbs.db".into(),
    ]
}

fn default_empty_file_rules() -> Vec<EmptyFileSkipRule> {
    vec![EmptyFileSkipRule {
        instrument_class_prefix: "Bruker".into(),
        file_name: "Calibration.ascii".into(),
    }]
}

fn default_embedded_file_rules() -> Vec<EmbeddedFileSkipRule> {
    vec![EmbeddedFileSkipRule {
        instrument_class_prefix: "IMS_Agilent".into(),
        skip_extension: "bin".into(),
        container_extension: "uimf".into(),
    }]
}

fn default_min_free_space() -> u64 {
    30 * 1024 * 1024 * 1024 // 30 GB
}

fn default_exempt_tools() -> Vec<String> {
    vec!["DatasetInfo".into(), "DatasetQuality".into()]
}

fn default_status_file() -> PathBuf {
    PathBuf::from("./status.json")
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_min_write_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_bus_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_temp_max_age() -> Duration {
    Duration::from_secs(12 * 3600)
}

fn default_purge_every() -> u32 {
    50
}

fn default_purge_hour() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
