use crate::capture::{CapturePaths, InstrumentContext};
use crate::error::Result;
use crate::housekeeping::save_most_recent_job;
use crate::recovery::{create_flag_file, delete_flag_file};
use crate::store::CloseTask;
use crate::types::{Assignment, CaptureOutcome, CloseoutKind, DatasetInfo, EvalCode, RecentJob, Task};
use crate::utils::{check_free_space, format_bytes};
use chrono::Utc;
use std::any::Any;
use tracing::Instrument;

use super::CaptureManager;

impl CaptureManager {
    /// Run one assigned task and close it
    ///
    /// Every path closes the task exactly once and returns the status sink
    /// to idle. Errors are returned only for working-directory failures the
    /// loop cannot recover from.
    pub(crate) async fn execute_task(&mut self, mut task: Task) -> Result<CaptureOutcome> {
        let Some(assignment) = task.close() else {
            let outcome = CaptureOutcome::failed("Task has no job/step assignment");
            self.services.obs.record_error(&outcome.message);
            return Ok(outcome);
        };
        let span = tracing::info_span!("task", job = %assignment.job, step = assignment.step);

        if let Err(e) = create_flag_file(&self.working_dir).await {
            let outcome = CaptureOutcome {
                eval_code: EvalCode::Failed,
                ..CaptureOutcome::failed(format!("Could not create the flag file: {}", e))
            };
            self.services.obs.record_error(&outcome.message);
            self.close(assignment, &outcome).await;
            self.services.status.task_finished(None);
            self.services.status.write(true).await;
            return Err(e);
        }

        let outcome = self
            .run_capture(&task, assignment)
            .instrument(span.clone())
            .await;

        self.close(assignment, &outcome).await;
        span.in_scope(|| {
            tracing::info!(
                closeout = %outcome.closeout,
                message = %outcome.message,
                "Task closed"
            )
        });

        let recent = RecentJob {
            job: assignment.job,
            step: assignment.step,
            step_tool: task.step_tool.clone(),
            dataset: task.dataset.clone(),
            closeout: outcome.closeout,
            finished_at: Utc::now(),
        };
        if let Err(e) = save_most_recent_job(&self.working_dir, &recent).await {
            tracing::warn!(error = %e, "Could not update the most-recent-job marker");
        }
        self.services.status.task_finished(Some(&recent));
        self.services.status.write(true).await;

        delete_flag_file(&self.working_dir).await?;
        Ok(outcome)
    }

    /// Report `outcome` to the store; a failed close is only logged
    async fn close(&self, assignment: Assignment, outcome: &CaptureOutcome) {
        let close = CloseTask::from_outcome(assignment, outcome);
        if let Err(e) = self.services.store.close_task(&close).await {
            // Un-closed tasks are recovered by the store's own staleness timeout
            self.services.obs.record_error(format!(
                "Could not close job {} step {}: {}",
                assignment.job, assignment.step, e
            ));
        }
    }

    async fn run_capture(&self, task: &Task, assignment: Assignment) -> CaptureOutcome {
        let info = DatasetInfo::from_params(&task.params);
        let instrument = InstrumentContext::from_params(&task.params);
        let paths = CapturePaths::from_params(&task.params, &info);
        let resume = task.params.get_bool("Resume");

        self.services
            .status
            .task_started(&task.step_tool, assignment.job, assignment.step, &task.dataset);
        self.services.status.write(false).await;

        let strategy = match self.services.registry.resolve(&task.step_tool) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.services.obs.record_error(e.to_string());
                return CaptureOutcome::failed(e.to_string());
            }
        };

        if let Some(outcome) = self.check_disk_space(&task.step_tool, &paths) {
            return outcome;
        }

        tracing::info!(
            strategy = strategy.name(),
            dataset = %info.dataset_name,
            source = %paths.source.display(),
            destination = %paths.destination.display(),
            resume,
            "Starting capture"
        );

        let handle = tokio::spawn(async move {
            strategy
                .capture(&info, &paths.source, &paths.destination, resume, &instrument)
                .await
        });

        match handle.await {
            Ok(outcome) => {
                if outcome.closeout == CloseoutKind::Failed {
                    self.services
                        .obs
                        .record_error(format!("Capture failed: {}", outcome.message));
                }
                outcome
            }
            Err(e) => {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                self.services
                    .obs
                    .record_error(format!("Capture aborted: {}", message));
                CaptureOutcome {
                    eval_code: EvalCode::Failed,
                    ..CaptureOutcome::failed(message)
                }
            }
        }
    }

    /// Failed outcome when the destination volume is short on space
    fn check_disk_space(&self, step_tool: &str, paths: &CapturePaths) -> Option<CaptureOutcome> {
        let disk = &self.config.disk_space;
        let exempt = disk
            .exempt_tools
            .iter()
            .any(|tool| tool.eq_ignore_ascii_case(step_tool));
        if !disk.enabled || exempt {
            return None;
        }

        match check_free_space(&paths.destination, disk.min_free_space) {
            Ok(available) => {
                tracing::debug!(available = %format_bytes(available), "Destination has enough free space");
                None
            }
            Err(crate::Error::InsufficientSpace {
                required,
                available,
            }) => {
                let message = format!(
                    "Insufficient free space on the destination volume: {} free, {} required",
                    format_bytes(available),
                    format_bytes(required)
                );
                self.services.obs.record_error(&message);
                Some(CaptureOutcome::failed(message))
            }
            Err(e) => {
                self.services.obs.record_error(e.to_string());
                Some(CaptureOutcome::failed(e.to_string()))
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("Exception during capture: {}", text)
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("Exception during capture: {}", text)
    } else {
        "Exception during capture".to_string()
    }
}
