//! Error types for the taskhost executor
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI
//!
//! Failures raised by task bodies are not represented here; see
//! `executor::failure` for the task failure taxonomy.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    RegistrationRejected = 403,

    // Execution errors (5xx)
    ExecutionFailed = 500,
    DuplicateTask = 504,
    ExecutorStopped = 505,
    UnknownTaskKind = 506,
    MemoryLeak = 507,

    // Dependency errors (6xx)
    DependencyFetch = 600,

    // Block store errors (7xx)
    BlockStore = 700,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            700..=799 => 70,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the executor
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Request to {target} timed out after {timeout_ms}ms")]
    ConnectionTimeout { target: String, timeout_ms: u64 },

    /// Generic connection error
    #[error("Connection error: {0}")]
    Connection(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message or task payload
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Coordinator refused to register this executor
    #[error("Executor registration rejected: {message}")]
    RegistrationRejected { message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// A live runner already exists for this task id
    #[error("Task {task_id} is already running on this executor")]
    DuplicateTask { task_id: i64 },

    /// Launch attempted after the executor was stopped
    #[error("Executor is stopped and no longer accepts tasks")]
    ExecutorStopped,

    /// The task kind is not registered in the catalog
    #[error("No task body registered for kind '{kind}'")]
    UnknownTaskKind { kind: String },

    /// Tracked memory was still outstanding after the task finished
    #[error("Managed memory leak detected; size = {bytes} bytes, TID = {task_id}")]
    MemoryLeak { task_id: i64, bytes: u64 },

    /// Generic execution error
    #[error("Execution error: {0}")]
    Execution(String),

    // ─────────────────────────────────────────────────────────────
    // Dependency Errors
    // ─────────────────────────────────────────────────────────────

    /// An artifact could not be fetched
    #[error("Failed to fetch dependency {name}: {message}")]
    DependencyFetch { name: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Block Store Errors
    // ─────────────────────────────────────────────────────────────

    /// Block store rejected a read or write
    #[error("Block store error for {block_id}: {message}")]
    BlockStore { block_id: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Connection(_) => ErrorCode::ConnectionLost,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::RegistrationRejected { .. } => ErrorCode::RegistrationRejected,

            Error::DuplicateTask { .. } => ErrorCode::DuplicateTask,
            Error::ExecutorStopped => ErrorCode::ExecutorStopped,
            Error::UnknownTaskKind { .. } => ErrorCode::UnknownTaskKind,
            Error::MemoryLeak { .. } => ErrorCode::MemoryLeak,
            Error::Execution(_) => ErrorCode::ExecutionFailed,

            Error::DependencyFetch { .. } => ErrorCode::DependencyFetch,
            Error::BlockStore { .. } => ErrorCode::BlockStore,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Connection(_)
                | Error::WebSocket(_)
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
                | Error::DependencyFetch { .. }
        )
    }

    /// Check if the error is fatal (executor should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::RegistrationRejected { .. }
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'taskhost config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'taskhost config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => Some(
                "Check your network connection and verify the coordinator URL is correct."
            ),
            Error::RegistrationRejected { .. } => Some(
                "The coordinator refused this executor. Check the executor id is not already in use."
            ),
            Error::ProtocolVersion { .. } => Some(
                "The coordinator speaks a different protocol major version. Upgrade the executor."
            ),
            Error::DependencyFetch { .. } => Some(
                "Verify the artifact URL is reachable from this host and the work directory is writable."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a dependency fetch error
    pub fn dependency_fetch(name: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::DependencyFetch {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Create a block store error
    pub fn block_store(block_id: impl fmt::Display, message: impl fmt::Display) -> Self {
        Error::BlockStore {
            block_id: block_id.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::DependencyFetch.as_str(), "E600");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigValidation.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::DuplicateTask.exit_code(), 50);
        assert_eq!(ErrorCode::BlockStore.exit_code(), 70);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::DuplicateTask { task_id: 7 }.code(), ErrorCode::DuplicateTask);
        assert_eq!(Error::dependency_fetch("a.jar", "404").code(), ErrorCode::DependencyFetch);
        assert_eq!(Error::MemoryLeak { task_id: 1, bytes: 64 }.code(), ErrorCode::MemoryLeak);
    }

    #[test]
    fn test_memory_leak_message() {
        let err = Error::MemoryLeak { task_id: 12, bytes: 4096 };
        assert_eq!(
            err.to_string(),
            "Managed memory leak detected; size = 4096 bytes, TID = 12"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::connection_failed("ws://x", "refused").is_retryable());
        assert!(Error::dependency_fetch("a.jar", "timeout").is_retryable());
        assert!(!Error::DuplicateTask { task_id: 1 }.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::config_validation("bad").is_fatal());
        assert!(Error::RegistrationRejected { message: "dup".into() }.is_fatal());
        assert!(!Error::ExecutorStopped.is_fatal());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::ConfigNotFound { path: PathBuf::from("/x/taskhost.toml") };
        let formatted = err.format_for_terminal();
        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let formatted = Error::ExecutorStopped.format_for_log();
        assert!(formatted.starts_with("[E505]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
