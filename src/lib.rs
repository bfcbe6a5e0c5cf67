//! # capture-manager
//!
//! Unattended worker that claims dataset capture tasks from a shared task
//! store and copies finished instrument acquisitions to managed storage.
//!
//! ## Design
//!
//! - **One task at a time** - the controller polls, runs one capture, closes
//!   the task and polls again until an exit condition is met
//! - **Every fault becomes a closeout** - strategies never propagate errors;
//!   the store always learns how a task ended
//! - **Crash evidence** - a flag file marks the working directory while a
//!   task runs, so a crashed capture stops the next start until cleaned
//!
//! ## Quick Start
//!
//! ```no_run
//! use capture_manager::capture::{CaptureContext, StrategyRegistry};
//! use capture_manager::logging::Observability;
//! use capture_manager::manager::{CaptureManager, ManagerServices};
//! use capture_manager::status::StatusWriter;
//! use capture_manager::store::SqliteTaskStore;
//! use capture_manager::Config;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("CaptureManager.json".as_ref())?;
//!     let obs = Observability::new();
//!     let store = Arc::new(
//!         SqliteTaskStore::new(&config.task_store.database_path, config.task_store.busy_retries)
//!             .await?,
//!     );
//!     let ctx = Arc::new(CaptureContext::new(config.capture.clone(), obs.clone()));
//!
//!     let services = ManagerServices {
//!         store: store.clone(),
//!         settings: store,
//!         registry: Arc::new(StrategyRegistry::with_builtin(ctx)),
//!         status: Arc::new(StatusWriter::new(&config.status, &config.manager.name, obs.clone())),
//!         obs,
//!     };
//!
//!     let mut manager = CaptureManager::new(config, services);
//!     let code = manager.run().await;
//!     manager.shutdown(code).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Capture engine and strategies
pub mod capture;
/// Configuration types
pub mod config;
/// Local configuration change detection
pub mod config_watcher;
/// Error types
pub mod error;
/// Scratch purge, maintenance window and working directory upkeep
pub mod housekeeping;
/// Logging setup and the recent-error ring
pub mod logging;
/// Task lifecycle controller
pub mod manager;
/// Flag file handling and automatic cleanup
pub mod recovery;
/// Retry logic with exponential backoff
pub mod retry;
/// Status file and broadcast
pub mod status;
/// Task store protocol and the sqlite implementation
pub mod store;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use config::Config;
pub use error::{CaptureError, DatabaseError, Error, Result, TaskStoreError};
pub use manager::{CaptureManager, ManagerServices};
pub use types::{CaptureOutcome, CloseoutKind, EvalCode, JobId, LoopExitCode, Task};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// The controller notices the cancellation at its next loop boundary; a
/// capture in flight is allowed to finish and close its task.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => token.cancel(),
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
