//! Retry logic with exponential backoff
//!
//! Two policies live here:
//! - [`with_retry`], a generic exponential-backoff loop driven by
//!   [`IsRetryable`], used for best-effort task store calls
//! - [`copy_retry_decision`], the pure policy the copier applies to faults
//!   raised mid-transfer
//!
//! # Example
//!
//! ```no_run
//! use capture_manager::retry::{IsRetryable, with_retry};
//! use capture_manager::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Busy,
//!     Rejected,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Busy)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{CaptureError, Error, TaskStoreError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Minimum time a copy attempt must have been running before a fault is retried
pub const COPY_RETRY_MIN_ELAPSED: Duration = Duration::from_secs(10);

/// Wall-clock ceiling for all attempts of one copy
pub const COPY_RETRY_CEILING: Duration = Duration::from_secs(6 * 3600);

/// Number of whole-call retries allowed for one copy
pub const COPY_MAX_RETRIES: u32 = 1;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (lock contention, timeouts, connection reset) should return `true`.
/// Permanent failures (bad credentials, invalid data, configuration) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => is_transient_io(e),
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6)
            Error::Sqlx(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            Error::Sqlx(sqlx::Error::PoolTimedOut) => true,
            Error::Sqlx(_) | Error::Database(_) => false,
            Error::TaskStore(e) => e.is_retryable(),
            Error::Capture(e) => e.is_retryable(),
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            Error::Config { .. }
            | Error::Serialization(_)
            | Error::UnknownStepTool(_)
            | Error::InsufficientSpace { .. }
            | Error::DiskSpaceCheckFailed(_)
            | Error::ConfigWatch(_)
            | Error::Other(_) => false,
        }
    }
}

impl IsRetryable for TaskStoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, TaskStoreError::Deadlock { .. })
    }
}

impl IsRetryable for CaptureError {
    fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Transient { .. } => true,
            CaptureError::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Execute an async operation with exponential backoff retry logic
///
/// `config.max_attempts` counts retries, so the operation runs at most
/// `max_attempts + 1` times. Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let wait = if config.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(wait).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Uniform jitter between 0% and 100% of the delay
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

/// What the copier should do after a fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyRetryDecision {
    /// Run the whole copy call again
    Retry,
    /// Give up; the fault is final for this task
    Fail,
    /// Give up; the wall-clock ceiling was exceeded
    CeilingExceeded,
}

/// Decide whether a copy fault is retried
///
/// * `attempt_elapsed` - time since the failing attempt started
/// * `total_elapsed` - time since the first attempt started
/// * `retries_used` - whole-call retries already performed
///
/// Credential and authorization faults are never retried. Any other I/O
/// fault is retried once, and only when the failing attempt had been running
/// for at least ten seconds.
pub fn copy_retry_decision(
    fault: &CaptureError,
    attempt_elapsed: Duration,
    total_elapsed: Duration,
    retries_used: u32,
) -> CopyRetryDecision {
    if fault.is_credential() {
        return CopyRetryDecision::Fail;
    }
    if total_elapsed >= COPY_RETRY_CEILING {
        return CopyRetryDecision::CeilingExceeded;
    }
    let transfer_fault = matches!(
        fault,
        CaptureError::Transient { .. } | CaptureError::Io { .. }
    );
    if transfer_fault
        && retries_used < COPY_MAX_RETRIES
        && attempt_elapsed >= COPY_RETRY_MIN_ELAPSED
    {
        CopyRetryDecision::Retry
    } else {
        CopyRetryDecision::Fail
    }
}
