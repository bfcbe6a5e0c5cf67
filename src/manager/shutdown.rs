use crate::recovery::create_flag_file;
use crate::types::{LoopExitCode, ManagerStatus};

use super::CaptureManager;

/// What to do once the loop stopped with a given exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownAction {
    /// The process may run the loop again
    pub restart_ok: bool,
    /// Manager status to publish
    pub status: ManagerStatus,
    /// Leave a flag file behind so the next start does not request work
    pub create_flag_file: bool,
    /// Acknowledge a pending forced update in the remote settings
    pub ack_update: bool,
    /// Operator-facing reason
    pub message: &'static str,
}

impl ShutdownAction {
    const fn stop(status: ManagerStatus, message: &'static str) -> Self {
        Self {
            restart_ok: false,
            status,
            create_flag_file: false,
            ack_update: false,
            message,
        }
    }

    const fn with_flag_file(mut self) -> Self {
        self.create_flag_file = true;
        self
    }
}

/// Map a loop exit code to its shutdown action
///
/// Only [`LoopExitCode::ConfigChanged`] allows a restart.
pub fn shutdown_decision(code: LoopExitCode) -> ShutdownAction {
    use ManagerStatus::*;

    match code {
        LoopExitCode::ConfigChanged => ShutdownAction {
            restart_ok: true,
            ..ShutdownAction::stop(Stopped, "Configuration changed; reloading")
        },
        LoopExitCode::NoTaskFound => ShutdownAction::stop(Stopped, "No tasks found"),
        LoopExitCode::ExceededMaxTaskCount => {
            ShutdownAction::stop(Stopped, "Reached the maximum task count")
        }
        LoopExitCode::ShutdownRequested => ShutdownAction::stop(Stopped, "Shutdown requested"),
        LoopExitCode::DisabledRemotely => {
            ShutdownAction::stop(DisabledRemote, "Manager disabled in the remote settings")
        }
        LoopExitCode::DisabledLocally => {
            ShutdownAction::stop(DisabledLocal, "Manager disabled in the local configuration")
        }
        LoopExitCode::UpdateRequired => ShutdownAction {
            ack_update: true,
            ..ShutdownAction::stop(Stopped, "Manager update required")
        },
        LoopExitCode::InvalidWorkDir => {
            ShutdownAction::stop(StoppedError, "Working directory is invalid")
        }
        LoopExitCode::FlagFile => {
            ShutdownAction::stop(StoppedError, "Flag file present in the working directory")
        }
        LoopExitCode::ExcessiveRequestErrors => {
            ShutdownAction::stop(StoppedError, "Too many consecutive task request errors")
                .with_flag_file()
        }
        LoopExitCode::NeedToAbortProcessing => {
            ShutdownAction::stop(StoppedError, "A capture requested that processing stop")
                .with_flag_file()
        }
        LoopExitCode::UnhandledError => {
            ShutdownAction::stop(StoppedError, "Unexpected error in the main loop").with_flag_file()
        }
    }
}

impl CaptureManager {
    /// Apply the shutdown action for `code`
    ///
    /// Returns true when the caller may run the loop again.
    pub async fn shutdown(&self, code: LoopExitCode) -> bool {
        let action = shutdown_decision(code);
        tracing::info!(exit_code = %code, restart = action.restart_ok, "{}", action.message);

        let status = &self.services.status;
        status.set_manager_status(action.status);
        status.set_operation(action.message);

        if action.create_flag_file
            && self.config.manager.create_flag_file_on_error
            && let Err(e) = create_flag_file(&self.working_dir).await
        {
            self.services
                .obs
                .record_error(format!("Could not create flag file: {}", e));
        }

        // A failed settings load also exits as UpdateRequired; nothing to acknowledge then
        if action.ack_update
            && self.remote.update_required()
            && let Err(e) = self.services.settings.ack_update_required(self.name()).await
        {
            tracing::warn!(error = %e, "Could not acknowledge the required update");
        }

        status.write(true).await;
        action.restart_ok
    }
}
