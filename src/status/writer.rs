//! Status file writer and background refresher

use crate::capture::ProgressSink;
use crate::config::StatusConfig;
use crate::logging::Observability;
use crate::types::{JobId, ManagerStatus, RecentJob, TaskStatus};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{StatusPublisher, StatusSnapshot};

/// Owns the live status and writes it to disk and the bus
///
/// Writes are throttled to one per `min_write_interval` unless forced.
/// Broadcasts run on their own task and their failures are only logged.
pub struct StatusWriter {
    path: PathBuf,
    min_write_interval: Duration,
    obs: Observability,
    state: Mutex<StatusSnapshot>,
    last_write: Mutex<Option<Instant>>,
    publisher: RwLock<Option<Arc<dyn StatusPublisher>>>,
}

impl StatusWriter {
    /// Writer for `manager_name` using `config`
    pub fn new(config: &StatusConfig, manager_name: &str, obs: Observability) -> Self {
        let snapshot = StatusSnapshot {
            manager_name: manager_name.to_string(),
            last_update: Utc::now(),
            ..StatusSnapshot::default()
        };
        Self {
            path: config.status_file.clone(),
            min_write_interval: config.min_write_interval,
            obs,
            state: Mutex::new(snapshot),
            last_write: Mutex::new(None),
            publisher: RwLock::new(None),
        }
    }

    /// Attach the broadcast publisher
    pub fn set_publisher(&self, publisher: Arc<dyn StatusPublisher>) {
        if let Ok(mut slot) = self.publisher.write() {
            *slot = Some(publisher);
        }
    }

    /// Current snapshot with recent errors and elapsed time filled in
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = self
            .state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default();
        let now = Utc::now();
        snapshot.recent_errors = self.obs.recent_errors();
        snapshot.elapsed_minutes = snapshot
            .task_started
            .map(|started| (now - started).num_seconds().max(0) as f64 / 60.0)
            .unwrap_or(0.0);
        snapshot.last_update = now;
        snapshot.bounded()
    }

    fn update(&self, change: impl FnOnce(&mut StatusSnapshot)) {
        if let Ok(mut state) = self.state.lock() {
            change(&mut state);
        }
    }

    /// Set the manager status
    pub fn set_manager_status(&self, status: ManagerStatus) {
        self.update(|s| s.manager_status = status);
    }

    /// Set the free-text operation
    pub fn set_operation(&self, operation: impl Into<String>) {
        let operation = operation.into();
        self.update(|s| s.current_operation = operation);
    }

    /// Set task progress in percent
    pub fn set_progress(&self, percent: f32) {
        self.update(|s| s.progress = percent.clamp(0.0, 100.0));
    }

    /// Set the most-recent-job text (loaded at startup)
    pub fn set_most_recent_job(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|s| s.most_recent_job = text);
    }

    /// Record the start of a task
    pub fn task_started(&self, step_tool: &str, job: JobId, step: i32, dataset: &str) {
        self.update(|s| {
            s.manager_status = ManagerStatus::Running;
            s.task_status = TaskStatus::Running;
            s.step_tool = Some(step_tool.to_string());
            s.job = Some(job.get());
            s.step = Some(step);
            s.dataset = Some(dataset.to_string());
            s.task_started = Some(Utc::now());
            s.progress = 0.0;
            s.current_operation = format!("Capturing {}", dataset);
        });
    }

    /// Clear the per-task fields and go idle
    pub fn task_finished(&self, recent: Option<&RecentJob>) {
        self.update(|s| {
            s.manager_status = ManagerStatus::Idle;
            s.task_status = TaskStatus::NoTask;
            s.step_tool = None;
            s.job = None;
            s.step = None;
            s.dataset = None;
            s.task_started = None;
            s.progress = 0.0;
            s.current_operation.clear();
            if let Some(recent) = recent {
                s.most_recent_job = recent.to_string();
            }
        });
    }

    /// Write the snapshot if the throttle allows it (or `force` is set)
    ///
    /// Returns true when the file was written. Write failures are logged,
    /// never returned.
    pub async fn write(&self, force: bool) -> bool {
        {
            let Ok(mut last) = self.last_write.lock() else {
                return false;
            };
            if !force
                && let Some(previous) = *last
                && previous.elapsed() < self.min_write_interval
            {
                return false;
            }
            *last = Some(Instant::now());
        }

        let snapshot = self.snapshot();
        let json = match snapshot.to_bounded_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize status");
                return false;
            }
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %e, "Could not create status directory");
        }
        let written = match tokio::fs::write(&self.path, json).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Could not write status file");
                false
            }
        };

        self.broadcast(snapshot);
        written
    }

    fn broadcast(&self, snapshot: StatusSnapshot) {
        let publisher = self
            .publisher
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        if let Some(publisher) = publisher {
            tokio::spawn(async move {
                if let Err(e) = publisher.publish(&snapshot).await {
                    tracing::debug!(error = %e, "Status broadcast failed");
                }
            });
        }
    }

    /// Rewrite the snapshot every `period` until `cancel` fires
    pub fn spawn_refresher(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        writer.write(true).await;
                    }
                }
            }
            tracing::debug!("Status refresher stopped");
        })
    }
}

/// Copy progress lands in the snapshot; the refresher persists it
impl ProgressSink for StatusWriter {
    fn report(&self, percent: f32) {
        self.set_progress(percent);
    }
}
