//! Status document and its size caps

use crate::error::Result;
use crate::types::{ManagerStatus, TaskStatus};
use crate::utils::truncate_chars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of one recent-error entry
pub const MAX_ERROR_ENTRY_LEN: usize = crate::logging::MAX_ERROR_ENTRY_LEN;

/// Maximum length of the current operation and most-recent-job text
pub const MAX_TEXT_FIELD_LEN: usize = 512;

/// Maximum combined length of the recent-error block
pub const MAX_ERROR_BLOCK_LEN: usize = 1750;

/// Maximum length of the serialized document
pub const MAX_DOCUMENT_LEN: usize = 1850;

/// Point-in-time view of the manager
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Manager name
    pub manager_name: String,
    /// Manager status
    pub manager_status: ManagerStatus,
    /// Task status
    pub task_status: TaskStatus,
    /// Step tool of the running task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_tool: Option<String>,
    /// Job of the running task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<i64>,
    /// Step of the running task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,
    /// Dataset of the running task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// UTC start of the running task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_started: Option<DateTime<Utc>>,
    /// Minutes since the task started
    pub elapsed_minutes: f64,
    /// Completion percentage of the running task
    pub progress: f32,
    /// Free text describing the current operation
    pub current_operation: String,
    /// Summary of the last finished job
    pub most_recent_job: String,
    /// Recent errors, oldest first
    pub recent_errors: Vec<String>,
    /// Time the snapshot was taken
    pub last_update: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Apply the per-field caps
    ///
    /// Each error entry is cut to 255 characters and the oldest entries are
    /// dropped until the block fits in 1750.
    pub fn bounded(mut self) -> Self {
        self.current_operation = truncate_chars(&self.current_operation, MAX_TEXT_FIELD_LEN);
        self.most_recent_job = truncate_chars(&self.most_recent_job, MAX_TEXT_FIELD_LEN);
        self.recent_errors = self
            .recent_errors
            .iter()
            .map(|entry| truncate_chars(entry, MAX_ERROR_ENTRY_LEN))
            .collect();

        while error_block_len(&self.recent_errors) > MAX_ERROR_BLOCK_LEN {
            self.recent_errors.remove(0);
        }
        self
    }

    /// Serialize within [`MAX_DOCUMENT_LEN`]
    ///
    /// Drops the oldest errors first, then shortens the operation and
    /// most-recent-job text.
    pub fn to_bounded_json(&self) -> Result<String> {
        let mut snapshot = self.clone().bounded();
        loop {
            let json = serde_json::to_string(&snapshot)?;
            let len = json.chars().count();
            if len <= MAX_DOCUMENT_LEN {
                return Ok(json);
            }

            let excess = len - MAX_DOCUMENT_LEN;
            if !snapshot.recent_errors.is_empty() {
                snapshot.recent_errors.remove(0);
            } else if !snapshot.current_operation.is_empty() {
                let keep = snapshot.current_operation.chars().count().saturating_sub(excess);
                snapshot.current_operation = truncate_chars(&snapshot.current_operation, keep);
            } else if !snapshot.most_recent_job.is_empty() {
                let keep = snapshot.most_recent_job.chars().count().saturating_sub(excess);
                snapshot.most_recent_job = truncate_chars(&snapshot.most_recent_job, keep);
            } else {
                // Nothing left to shorten
                return Ok(json);
            }
        }
    }
}

fn error_block_len(errors: &[String]) -> usize {
    errors.iter().map(|entry| entry.chars().count()).sum()
}
