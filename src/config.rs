//! Configuration system for the taskhost executor
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASKHOST_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Bytes held back from the frame size for message framing overhead
pub const RESERVED_FRAME_BYTES: u64 = 200 * 1024;

/// Main executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executor identity, pool and result settings
    pub executor: ExecutorSettings,

    /// Coordinator connection settings
    pub coordinator: CoordinatorSettings,

    /// Data storage paths
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Unique executor identifier (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Cores advertised to the coordinator (0 = auto)
    pub cores: u32,

    /// Maximum tasks executing at once (0 = unbounded)
    pub max_concurrent_tasks: usize,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// How long to wait for a heartbeat response in milliseconds
    pub heartbeat_timeout_ms: u64,

    /// Bounded wait for the heartbeat loop to stop in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Maximum total serialized result size in bytes (0 = unlimited)
    pub max_result_size: u64,

    /// Maximum inline message frame size in bytes
    pub max_frame_size: u64,

    /// Fail tasks that leak tracked memory instead of logging the leak
    pub strict_leak_detection: bool,

    /// Search user-supplied artifacts before the extra classpath
    pub user_classpath_first: bool,

    /// Extra artifact search path entries
    #[serde(default)]
    pub user_class_path: Vec<String>,

    /// Share downloaded artifacts between executors on this host
    pub fetch_use_cache: bool,
}

/// Coordinator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Coordinator WebSocket URL
    pub url: String,

    /// Initial reconnection interval in milliseconds
    pub reconnect_interval_ms: u64,

    /// Upper bound for the reconnection backoff in milliseconds
    pub max_reconnect_interval_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory fetched artifacts are placed in
    pub work_dir: String,

    /// Shared download cache for artifacts
    pub cache_dir: String,

    /// Directory for disk-backed blocks
    pub block_dir: String,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            id: None,
            cores: 0,
            max_concurrent_tasks: 0,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            shutdown_timeout_ms: 10_000,
            max_result_size: 1024 * 1024 * 1024,
            max_frame_size: 128 * 1024 * 1024,
            strict_leak_detection: false,
            user_classpath_first: false,
            user_class_path: vec![],
            fetch_use_cache: true,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7077".to_string(),
            reconnect_interval_ms: 5000,
            max_reconnect_interval_ms: 60_000,
            max_reconnect_attempts: 0,
            connect_timeout_ms: 30_000,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            work_dir: "~/.taskhost/work".to_string(),
            cache_dir: "~/.taskhost/cache".to_string(),
            block_dir: "~/.taskhost/blocks".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl ExecutorSettings {
    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat response timeout as a duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Bounded shutdown wait as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Largest serialized result that is still sent inline.
    ///
    /// Status data travels base64-encoded, so only three quarters of the
    /// frame left after the reserved margin is available to raw bytes.
    pub fn max_direct_result_size(&self) -> u64 {
        self.max_frame_size.saturating_sub(RESERVED_FRAME_BYTES) / 4 * 3
    }

    /// Cores to advertise, resolving 0 to the detected CPU count
    pub fn effective_cores(&self) -> u32 {
        if self.cores > 0 {
            self.cores
        } else {
            num_cpus::get() as u32
        }
    }
}

impl WorkerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("taskhost.toml"),
            dirs::config_dir()
                .map(|p| p.join("taskhost").join("executor.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".taskhost").join("executor.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/taskhost/executor.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TASKHOST_EXECUTOR_ID") {
            self.executor.id = Some(val);
        }
        if let Some(n) = env_parse("TASKHOST_CORES") {
            self.executor.cores = n;
        }
        if let Some(n) = env_parse("TASKHOST_MAX_CONCURRENT_TASKS") {
            self.executor.max_concurrent_tasks = n;
        }
        if let Some(n) = env_parse("TASKHOST_HEARTBEAT_INTERVAL_MS") {
            self.executor.heartbeat_interval_ms = n;
        }
        if let Some(n) = env_parse("TASKHOST_MAX_RESULT_SIZE") {
            self.executor.max_result_size = n;
        }
        if let Some(n) = env_parse("TASKHOST_MAX_FRAME_SIZE") {
            self.executor.max_frame_size = n;
        }
        if let Some(b) = env_flag("TASKHOST_STRICT_LEAK_DETECTION") {
            self.executor.strict_leak_detection = b;
        }
        if let Some(b) = env_flag("TASKHOST_USER_CLASSPATH_FIRST") {
            self.executor.user_classpath_first = b;
        }

        if let Ok(val) = std::env::var("TASKHOST_COORDINATOR_URL") {
            self.coordinator.url = val;
        }
        if let Some(n) = env_parse("TASKHOST_MAX_RECONNECT_ATTEMPTS") {
            self.coordinator.max_reconnect_attempts = n;
        }

        if let Ok(val) = std::env::var("TASKHOST_WORK_DIR") {
            self.storage.work_dir = val;
        }
        if let Ok(val) = std::env::var("TASKHOST_CACHE_DIR") {
            self.storage.cache_dir = val;
        }
        if let Ok(val) = std::env::var("TASKHOST_BLOCK_DIR") {
            self.storage.block_dir = val;
        }

        if let Ok(val) = std::env::var("TASKHOST_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TASKHOST_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(b) = env_flag("TASKHOST_LOG_JSON") {
            self.logging.json_format = b;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.work_dir = expand_path(&self.storage.work_dir);
        self.storage.cache_dir = expand_path(&self.storage.cache_dir);
        self.storage.block_dir = expand_path(&self.storage.block_dir);
        self.executor.user_class_path = self
            .executor
            .user_class_path
            .iter()
            .map(|p| expand_path(p))
            .collect();

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = &self.coordinator.url;
        if url.is_empty() {
            return Err(Error::config_field_invalid("coordinator.url", "Coordinator URL cannot be empty"));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "coordinator.url",
                "Coordinator URL must start with ws:// or wss://",
            ));
        }

        if self.executor.heartbeat_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "executor.heartbeat_interval_ms",
                "heartbeat_interval_ms must be greater than 0",
            ));
        }

        if self.executor.max_frame_size <= RESERVED_FRAME_BYTES {
            return Err(Error::config_field_invalid(
                "executor.max_frame_size",
                format!("max_frame_size must exceed the reserved {} bytes", RESERVED_FRAME_BYTES),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Executor id, generating one when none is configured
    pub fn executor_id(&self) -> String {
        self.executor.id.clone().unwrap_or_else(|| {
            format!("exec-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        })
    }

    /// Get the artifact work directory as a PathBuf
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.work_dir)
    }

    /// Get the shared fetch cache directory as a PathBuf
    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.cache_dir)
    }

    /// Get the block directory as a PathBuf
    pub fn block_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.block_dir)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".taskhost")
                .join("executor.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, DEFAULT_CONFIG).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

const DEFAULT_CONFIG: &str = r#"# taskhost executor configuration

[executor]
# Unique executor identifier (auto-generated if not set)
# id = "exec-1"

# Cores advertised to the coordinator (0 = detect)
cores = 0

# Maximum tasks executing at once (0 = unbounded)
max_concurrent_tasks = 0

# Heartbeat interval in milliseconds
heartbeat_interval_ms = 10000

# How long to wait for a heartbeat response in milliseconds
heartbeat_timeout_ms = 30000

# Bounded wait for the heartbeat loop on shutdown in milliseconds
shutdown_timeout_ms = 10000

# Maximum total result size in bytes (0 = unlimited)
max_result_size = 1073741824

# Maximum message frame size in bytes; results that would not fit inline
# (200 KiB reserved, base64 encoded) go to the block store
max_frame_size = 134217728

# Fail tasks that leak tracked memory (false = log the leak only)
strict_leak_detection = false

# Search user artifacts before the extra classpath
user_classpath_first = false

# Extra artifact search path entries
user_class_path = []

# Share downloaded artifacts between executors on this host
fetch_use_cache = true

[coordinator]
# Coordinator WebSocket URL
url = "ws://127.0.0.1:7077"

# Initial reconnection interval in milliseconds
reconnect_interval_ms = 5000

# Upper bound for the reconnection backoff in milliseconds
max_reconnect_interval_ms = 60000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# Connection timeout in milliseconds
connect_timeout_ms = 30000

[storage]
work_dir = "~/.taskhost/work"
cache_dir = "~/.taskhost/cache"
block_dir = "~/.taskhost/blocks"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.taskhost/logs/executor.log"

max_file_size_mb = 100
max_files = 5
json_format = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.coordinator.url, "ws://127.0.0.1:7077");
        assert_eq!(config.executor.heartbeat_interval_ms, 10_000);
        assert_eq!(config.executor.max_concurrent_tasks, 0);
        assert!(!config.executor.strict_leak_detection);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_max_direct_result_size_reserves_margin() {
        let mut settings = ExecutorSettings::default();
        settings.max_frame_size = RESERVED_FRAME_BYTES + 4096;
        assert_eq!(settings.max_direct_result_size(), 3072);

        settings.max_frame_size = 10;
        assert_eq!(settings.max_direct_result_size(), 0);
    }

    #[test]
    fn test_largest_inline_result_fits_frame() {
        use crate::protocol::{Message, MessageEnvelope, StatusUpdateMessage, TaskState};

        for max_frame_size in [RESERVED_FRAME_BYTES + 4096, RESERVED_FRAME_BYTES + 100_001] {
            let settings = ExecutorSettings {
                max_frame_size,
                ..ExecutorSettings::default()
            };
            // the largest size that still routes inline
            let size = settings.max_direct_result_size() - 1;
            let envelope = MessageEnvelope::new(Message::StatusUpdate(StatusUpdateMessage {
                task_id: i64::MAX,
                state: TaskState::Finished,
                data: vec![0xff; size as usize],
            }));

            let frame = envelope.to_json().unwrap();
            assert!(
                frame.len() as u64 <= max_frame_size,
                "inline frame {} exceeds max_frame_size {}",
                frame.len(),
                max_frame_size
            );
        }
    }

    #[test]
    fn test_env_override() {
        env::set_var("TASKHOST_COORDINATOR_URL", "wss://coord.example.com");
        env::set_var("TASKHOST_STRICT_LEAK_DETECTION", "true");
        env::set_var("TASKHOST_MAX_CONCURRENT_TASKS", "3");

        let mut config = WorkerConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.coordinator.url, "wss://coord.example.com");
        assert!(config.executor.strict_leak_detection);
        assert_eq!(config.executor.max_concurrent_tasks, 3);

        env::remove_var("TASKHOST_COORDINATOR_URL");
        env::remove_var("TASKHOST_STRICT_LEAK_DETECTION");
        env::remove_var("TASKHOST_MAX_CONCURRENT_TASKS");
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut config = WorkerConfig::default();
        config.coordinator.url = "http://invalid.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_heartbeat() {
        let mut config = WorkerConfig::default();
        config.executor.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_frame_size_below_margin() {
        let mut config = WorkerConfig::default();
        config.executor.max_frame_size = RESERVED_FRAME_BYTES;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = WorkerConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_file_parses() {
        let config: WorkerConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.max_result_size, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: WorkerConfig = toml::from_str(
            r#"
[executor]
id = "exec-7"
max_result_size = 0
strict_leak_detection = true
user_class_path = ["/opt/udfs"]

[coordinator]
url = "wss://coord.example.com"
"#,
        )
        .unwrap();

        assert_eq!(config.executor_id(), "exec-7");
        assert_eq!(config.executor.max_result_size, 0);
        assert!(config.executor.strict_leak_detection);
        assert_eq!(config.executor.user_class_path, vec!["/opt/udfs"]);
        assert_eq!(config.executor.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn test_generated_executor_id() {
        let config = WorkerConfig::default();
        let id = config.executor_id();
        assert!(id.starts_with("exec-"));
        assert_eq!(id.len(), "exec-".len() + 8);
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("executor.toml");
        let path_str = path.to_str().unwrap();

        assert!(init_config(Some(path_str), false).is_ok());
        assert!(init_config(Some(path_str), false).is_err());
        assert!(init_config(Some(path_str), true).is_ok());
    }
}
