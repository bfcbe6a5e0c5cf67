use crate::error::Result;
use crate::housekeeping::{is_maintenance_blackout, resolve_working_dir};
use crate::recovery::{attempt_auto_cleanup, flag_file_exists};
use crate::retry::with_retry;
use crate::store::{CloseTask, RequestTaskResult};
use crate::types::{Assignment, CloseoutKind, EvalCode, LoopExitCode, ManagerStatus};
use std::sync::atomic::Ordering;
use tokio::time::Instant;

use super::{CaptureManager, MANAGER_VERSION, MAX_REQUEST_ERRORS, REQUEST_ERROR_CLOSE_MESSAGE};

/// Outcome of one loop iteration
enum Flow {
    Continue,
    Exit(LoopExitCode),
}

impl CaptureManager {
    /// Run the poll loop until an exit condition is met
    ///
    /// An unexpected error inside the loop stops it with
    /// [`LoopExitCode::UnhandledError`].
    pub async fn run(&mut self) -> LoopExitCode {
        tracing::info!(manager = %self.name(), version = MANAGER_VERSION, "Starting main loop");
        self.services.status.set_manager_status(ManagerStatus::Idle);
        self.services.status.write(true).await;

        loop {
            match self.iterate().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(code)) => {
                    tracing::info!(exit_code = %code, tasks = self.tasks_run, "Main loop stopped");
                    return code;
                }
                Err(e) => {
                    self.services
                        .obs
                        .record_error(format!("Error in the main loop: {}", e));
                    return LoopExitCode::UnhandledError;
                }
            }
        }
    }

    async fn iterate(&mut self) -> Result<Flow> {
        if self.shutdown.is_cancelled() {
            return Ok(Flow::Exit(LoopExitCode::ShutdownRequested));
        }

        if flag_file_exists(&self.working_dir).await {
            let mode = self
                .remote
                .cleanup_mode()
                .unwrap_or(self.config.manager.cleanup_mode);
            let cleaned = attempt_auto_cleanup(
                &self.working_dir,
                mode,
                self.services.settings.as_ref(),
                &self.config.manager.name,
            )
            .await;
            if !cleaned {
                self.services.obs.record_error(format!(
                    "Flag file exists in {}; not requesting work",
                    self.working_dir.display()
                ));
                return Ok(Flow::Exit(LoopExitCode::FlagFile));
            }
            tracing::info!("Cleaned up the working directory after a previous failure");
        }

        if self.config_changed.load(Ordering::SeqCst) {
            return Ok(Flow::Exit(LoopExitCode::ConfigChanged));
        }

        if !self.reload_settings_if_due().await {
            return Ok(Flow::Exit(LoopExitCode::UpdateRequired));
        }

        if !self.remote.mgr_active() {
            return Ok(Flow::Exit(LoopExitCode::DisabledRemotely));
        }
        if !self.config.manager.enabled {
            return Ok(Flow::Exit(LoopExitCode::DisabledLocally));
        }
        if self.remote.update_required() {
            return Ok(Flow::Exit(LoopExitCode::UpdateRequired));
        }

        if self.request_errors > MAX_REQUEST_ERRORS {
            self.services.obs.record_error(format!(
                "Stopping after {} consecutive task request errors",
                self.request_errors
            ));
            return Ok(Flow::Exit(LoopExitCode::ExcessiveRequestErrors));
        }

        match resolve_working_dir(&self.working_dir, &self.config.manager.fallback_working_dirs)
            .await
        {
            Some(dir) if dir != self.working_dir => {
                tracing::warn!(
                    invalid = %self.working_dir.display(),
                    fallback = %dir.display(),
                    "Working directory is invalid; using fallback"
                );
                self.working_dir = dir;
            }
            Some(_) => {}
            None => {
                self.services.obs.record_error(format!(
                    "Working directory {} is invalid and no fallback exists",
                    self.working_dir.display()
                ));
                return Ok(Flow::Exit(LoopExitCode::InvalidWorkDir));
            }
        }

        let now = chrono::Local::now().naive_local();
        if self.config.housekeeping.maintenance_blackout && is_maintenance_blackout(now) {
            tracing::info!("Maintenance window is active; not requesting work");
            return Ok(Flow::Exit(LoopExitCode::NoTaskFound));
        }

        self.purger.purge_if_due(now).await;

        self.request_and_run().await
    }

    /// Reload remote settings when the reload interval has passed
    ///
    /// Returns false when the reload failed.
    async fn reload_settings_if_due(&mut self) -> bool {
        let due = self
            .settings_loaded_at
            .is_none_or(|at| at.elapsed() >= self.config.manager.settings_reload_interval);
        if !due {
            return true;
        }

        match self.services.settings.load_settings(&self.config.manager.name).await {
            Ok(settings) => {
                self.remote = settings;
                self.settings_loaded_at = Some(Instant::now());
                true
            }
            Err(e) => {
                self.services
                    .obs
                    .record_error(format!("Could not reload manager settings: {}", e));
                false
            }
        }
    }

    async fn request_and_run(&mut self) -> Result<Flow> {
        let request = self
            .services
            .store
            .request_task(&self.config.manager.name, MANAGER_VERSION)
            .await;
        let result_name = request.name();

        match request {
            RequestTaskResult::NoTaskFound => {
                tracing::info!("No task found");
                Ok(Flow::Exit(LoopExitCode::NoTaskFound))
            }
            RequestTaskResult::TooManyRetries | RequestTaskResult::Deadlock => {
                tracing::warn!(result = result_name, "Task request did not complete; reporting idle");
                self.report_idle().await;
                Ok(Flow::Exit(LoopExitCode::NoTaskFound))
            }
            RequestTaskResult::ResultError { message, job, step } => {
                self.services
                    .obs
                    .record_error(format!("Error requesting a task: {}", message));
                if let (Some(job), Some(step)) = (job, step) {
                    let close = CloseTask::new(
                        Assignment { job, step },
                        CloseoutKind::Failed,
                        REQUEST_ERROR_CLOSE_MESSAGE,
                        EvalCode::FailureDoNotRetry,
                        &message,
                    );
                    if let Err(e) = self.services.store.close_task(&close).await {
                        self.services.obs.record_error(format!(
                            "Could not close job {} step {}: {}",
                            job, step, e
                        ));
                    }
                }
                self.request_errors += 1;
                Ok(Flow::Continue)
            }
            RequestTaskResult::TaskFound(task) => {
                self.request_errors = 0;
                let outcome = self.execute_task(task).await?;
                self.tasks_run += 1;
                self.purger.note_task();

                // Abort is checked first: it leaves a flag file, the task limit does not
                if outcome.needs_abort() {
                    return Ok(Flow::Exit(LoopExitCode::NeedToAbortProcessing));
                }
                if self.tasks_run >= self.config.manager.max_task_count {
                    return Ok(Flow::Exit(LoopExitCode::ExceededMaxTaskCount));
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Tell the store this manager holds no task, retrying transient failures
    async fn report_idle(&self) {
        let store = &self.services.store;
        let name = &self.config.manager.name;
        if let Err(e) = with_retry(&self.config.task_store.report_idle_retry, || {
            store.report_idle(name)
        })
        .await
        {
            self.services
                .obs
                .record_error(format!("Could not report idle to the task store: {}", e));
        }
    }
}
