//! Error types for capture-manager
//!
//! This module provides the error taxonomy shared by the controller and the
//! capture engine:
//! - [`Error`], the top-level error returned by library operations
//! - [`DatabaseError`] for the sqlite task store implementation
//! - [`TaskStoreError`] for protocol-level failures against the task store
//! - [`CaptureError`] for everything that can go wrong while touching a share

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for capture-manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for capture-manager
///
/// Each variant carries enough context to produce an operator-facing message
/// without re-inspecting the lower-level cause.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "working_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Task store protocol error
    #[error("task store error: {0}")]
    TaskStore(#[from] TaskStoreError),

    /// Capture error (share access, stability, copy, validation)
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No capture strategy is registered for a step tool
    #[error("no capture strategy registered for step tool '{0}'")]
    UnknownStepTool(String),

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// External tool execution failed (share connect/disconnect commands)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Config file watcher error
    #[error("config watch error: {0}")]
    ConfigWatch(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Task store protocol errors
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// The store reported a generic failure for the call
    #[error("{procedure} returned code {code}: {message}")]
    CallFailed {
        /// Store operation that failed (e.g. "request_task")
        procedure: &'static str,
        /// Numeric result code reported by the store
        code: i32,
        /// Message reported by the store
        message: String,
    },

    /// The store chose this worker as the victim of lock contention
    #[error("{procedure} was chosen as a deadlock victim")]
    Deadlock {
        /// Store operation that failed
        procedure: &'static str,
    },

    /// The task referenced by a close call is not assigned to this worker
    #[error("job {job} step {step} is not assigned to this manager")]
    NotAssigned {
        /// Job number
        job: i64,
        /// Step number
        step: i32,
    },
}

/// Errors raised while connecting to a share, sampling sizes, validating a
/// dataset layout or copying data.
///
/// Every strategy resolves these into exactly one
/// [`CaptureOutcome`](crate::types::CaptureOutcome) before returning.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Authentication failure reported by the share (user name / password)
    #[error("credential error accessing {path}: {message}")]
    Credential {
        /// Path being accessed
        path: PathBuf,
        /// Message copied from the underlying fault
        message: String,
    },

    /// Authorization failure (access denied); never retried
    #[error("access denied to {path}: {message}")]
    Unauthorized {
        /// Path being accessed
        path: PathBuf,
        /// Message copied from the underlying fault
        message: String,
    },

    /// A transfer fault that may succeed when retried
    #[error("transient I/O error copying {path}: {message}")]
    Transient {
        /// File being copied when the fault occurred
        path: PathBuf,
        /// Message copied from the underlying fault
        message: String,
    },

    /// The dataset layout violates a capture rule
    #[error("{0}")]
    Validation(String),

    /// The source is still being written
    #[error("{0}")]
    NotReady(String),

    /// The source file or directory does not exist
    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),

    /// Retrying a copy exceeded the wall-clock ceiling
    #[error("copy of {path} exceeded the {hours} hour limit")]
    CopyTimeout {
        /// Directory or file being copied
        path: PathBuf,
        /// Ceiling in hours
        hours: u64,
    },

    /// Any other I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// Wrap an I/O error for `path`, classifying authentication failures by
    /// their message text.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        let message = err.to_string();
        if crate::capture::is_credential_message(&message) {
            return CaptureError::Credential { path, message };
        }
        CaptureError::Io { path, source: err }
    }

    /// True for authentication and authorization failures
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            CaptureError::Credential { .. } | CaptureError::Unauthorized { .. }
        )
    }
}
