//! Task lifecycle controller
//!
//! [`CaptureManager`] drives the poll → capture → close cycle. It owns no
//! I/O of its own: the task store, remote settings, capture strategies and
//! status sink are all handed in through [`ManagerServices`], so every
//! decision in the loop can be exercised against fakes.
//!
//! ## Submodules
//!
//! - [`main_loop`] - per-iteration guards and task requests
//! - [`execute`] - running one task and closing it
//! - [`shutdown`] - the exit-code → shutdown action decision

use crate::capture::StrategyRegistry;
use crate::config::Config;
use crate::housekeeping::TempPurger;
use crate::logging::Observability;
use crate::status::StatusWriter;
use crate::store::{ManagerSettingsSource, RemoteSettings, TaskStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod execute;
mod main_loop;
mod shutdown;

pub use shutdown::{ShutdownAction, shutdown_decision};

/// Version reported to the task store
pub const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The loop stops once the consecutive request-error count exceeds this
pub const MAX_REQUEST_ERRORS: u32 = 4;

/// Closeout message used when the store hands out a task it could not describe
pub const REQUEST_ERROR_CLOSE_MESSAGE: &str = "Error retrieving task parameters";

/// Collaborators of the controller
#[derive(Clone)]
pub struct ManagerServices {
    /// Task store client
    pub store: Arc<dyn TaskStore>,
    /// Remote manager settings
    pub settings: Arc<dyn ManagerSettingsSource>,
    /// Step tool → capture strategy
    pub registry: Arc<StrategyRegistry>,
    /// Status sink
    pub status: Arc<StatusWriter>,
    /// Error ring shared with the status sink
    pub obs: Observability,
}

/// Poll-loop controller for one manager
pub struct CaptureManager {
    config: Config,
    services: ManagerServices,
    working_dir: PathBuf,
    config_changed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    request_errors: u32,
    tasks_run: u32,
    settings_loaded_at: Option<Instant>,
    remote: RemoteSettings,
    purger: TempPurger,
}

impl CaptureManager {
    /// Controller for `config` using `services`
    pub fn new(config: Config, services: ManagerServices) -> Self {
        let working_dir = config.manager.working_dir.clone();
        let purger = TempPurger::new(config.housekeeping.clone());
        Self {
            config,
            services,
            working_dir,
            config_changed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            request_errors: 0,
            tasks_run: 0,
            settings_loaded_at: None,
            remote: RemoteSettings::default(),
            purger,
        }
    }

    /// Use `flag` as the local config change signal
    pub fn with_config_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.config_changed = flag;
        self
    }

    /// Stop at the next loop boundary once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Working directory in use (may be a fallback)
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Consecutive request errors so far
    pub fn request_errors(&self) -> u32 {
        self.request_errors
    }

    /// Tasks executed by this controller
    pub fn tasks_run(&self) -> u32 {
        self.tasks_run
    }

    /// Manager name
    pub fn name(&self) -> &str {
        &self.config.manager.name
    }
}

#[cfg(test)]
mod tests;
