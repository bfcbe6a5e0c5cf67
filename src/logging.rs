//! Logging setup and the shared observability context
//!
//! [`init_logging`] installs the global `tracing` subscriber once at startup.
//! [`Observability`] is the explicit context handed to every component that
//! needs to surface errors on the status snapshot; it replaces any
//! process-wide error list.

use crate::config::{LogFormat, LoggingConfig};
use crate::utils::truncate_chars;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Maximum length of one recent-error entry
pub const MAX_ERROR_ENTRY_LEN: usize = 255;

/// Number of recent errors kept in the ring
pub const ERROR_RING_CAPACITY: usize = 25;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Filter directive could not be parsed
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    /// A global subscriber was installed already
    #[error("logger has been already initialized")]
    AlreadyInitialized,
    /// Any other installation failure
    #[error("failed to initialize logger: {0}")]
    InitializationFailed(String),
}

/// Install the global subscriber
///
/// `trace` forces debug output for this crate regardless of the configured
/// level (the `--trace` command line flag).
pub fn init_logging(cfg: &LoggingConfig, trace: bool) -> Result<(), LoggingError> {
    let directive = if trace {
        format!("{},capture_manager=debug", cfg.level)
    } else {
        cfg.level.clone()
    };
    let filter = EnvFilter::try_new(&directive)
        .map_err(|_| LoggingError::InvalidLogLevel(directive.clone()))?;

    match cfg.format {
        LogFormat::Text => {
            let layer = fmt::layer().with_target(cfg.with_targets);
            init_with(tracing_subscriber::registry().with(filter).with(layer))
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(cfg.with_targets);
            init_with(tracing_subscriber::registry().with(filter).with(layer))
        }
    }
}

fn init_with<S>(subscriber: S) -> Result<(), LoggingError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|e| {
        let text = e.to_string();
        if text.contains("SetGlobalDefaultError") || text.contains("already") {
            LoggingError::AlreadyInitialized
        } else {
            LoggingError::InitializationFailed(text)
        }
    })
}

/// Observability context shared by the controller, capture engine and status writer
///
/// Cloning is cheap; all clones share one bounded ring of recent errors.
#[derive(Clone, Debug, Default)]
pub struct Observability {
    errors: Arc<Mutex<VecDeque<String>>>,
}

impl Observability {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Log an error and remember it for the status snapshot
    pub fn record_error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("{}", message);
        self.push(message);
    }

    /// Log a warning without adding it to the ring
    pub fn record_warning(&self, message: impl AsRef<str>) {
        tracing::warn!("{}", message.as_ref());
    }

    fn push(&self, message: &str) {
        let entry = format!(
            "{}, {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            message.trim()
        );
        let entry = truncate_chars(&entry, MAX_ERROR_ENTRY_LEN);
        if let Ok(mut errors) = self.errors.lock() {
            if errors.len() == ERROR_RING_CAPACITY {
                errors.pop_front();
            }
            errors.push_back(entry);
        }
    }

    /// Recent errors, oldest first
    pub fn recent_errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|errors| errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget all recorded errors
    pub fn clear_errors(&self) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.clear();
        }
    }
}
