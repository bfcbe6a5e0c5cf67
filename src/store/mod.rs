//! Task store protocol and its sqlite implementation
//!
//! The controller only talks to the [`TaskStore`] and
//! [`ManagerSettingsSource`] traits. [`SqliteTaskStore`] implements both on a
//! local sqlite database so a worker can run stand-alone and the full
//! request/close protocol can be tested.
//!
//! ## Submodules
//!
//! Methods on [`SqliteTaskStore`] are organized by domain:
//! - [`migrations`] - connection lifecycle, schema migrations
//! - [`tasks`] - request / close / report-idle and task seeding
//! - [`settings`] - remote manager settings

use crate::config::CleanupMode;
use crate::error::Result;
use crate::types::{
    Assignment, CaptureOutcome, CloseoutKind, EvalCode, JobId, MAX_CLOSEOUT_MESSAGE_LEN,
    MAX_EVAL_MESSAGE_LEN, Task, TaskParams,
};
use crate::utils::clean_message;
use async_trait::async_trait;
use sqlx::{FromRow, sqlite::SqlitePool};
use std::collections::HashMap;

mod migrations;
mod settings;
mod tasks;

/// Outcome of asking the store for work
#[derive(Debug)]
pub enum RequestTaskResult {
    /// A task was assigned to this manager
    TaskFound(Task),
    /// No work is available
    NoTaskFound,
    /// The store reported an error; job/step are set when the failing task is known
    ResultError {
        /// Message reported by the store
        message: String,
        /// Job the error refers to, if resolved
        job: Option<JobId>,
        /// Step the error refers to, if resolved
        step: Option<i32>,
    },
    /// The store exhausted its own retries (busy database)
    TooManyRetries,
    /// The request was chosen as a lock-contention victim
    Deadlock,
}

impl RequestTaskResult {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            RequestTaskResult::TaskFound(_) => "TaskFound",
            RequestTaskResult::NoTaskFound => "NoTaskFound",
            RequestTaskResult::ResultError { .. } => "ResultError",
            RequestTaskResult::TooManyRetries => "TooManyRetries",
            RequestTaskResult::Deadlock => "Deadlock",
        }
    }
}

/// Arguments of a close-task call
///
/// Messages are cleaned on construction: line breaks collapsed, then capped
/// at 512 (closeout) and 256 (evaluation) characters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseTask {
    /// Task being closed
    pub assignment: Assignment,
    /// Closeout kind
    pub closeout: CloseoutKind,
    /// Closeout message
    pub message: String,
    /// Evaluation code
    pub eval_code: EvalCode,
    /// Evaluation message
    pub eval_message: String,
}

impl CloseTask {
    /// Build a close call from explicit values
    pub fn new(
        assignment: Assignment,
        closeout: CloseoutKind,
        message: &str,
        eval_code: EvalCode,
        eval_message: &str,
    ) -> Self {
        Self {
            assignment,
            closeout,
            message: clean_message(message, MAX_CLOSEOUT_MESSAGE_LEN),
            eval_code,
            eval_message: clean_message(eval_message, MAX_EVAL_MESSAGE_LEN),
        }
    }

    /// Build a close call from a strategy outcome
    pub fn from_outcome(assignment: Assignment, outcome: &CaptureOutcome) -> Self {
        Self::new(
            assignment,
            outcome.closeout,
            &outcome.message,
            outcome.eval_code,
            &outcome.eval_message,
        )
    }
}

/// External task store
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Ask for the next task for `manager`
    async fn request_task(&self, manager: &str, version: &str) -> RequestTaskResult;

    /// Report the result of a task
    async fn close_task(&self, close: &CloseTask) -> Result<()>;

    /// Tell the store this manager holds no task (idempotent)
    async fn report_idle(&self, manager: &str) -> Result<()>;
}

/// Remote manager settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    values: HashMap<String, String>,
}

impl RemoteSettings {
    /// Setting that enables the manager
    pub const MGR_ACTIVE: &'static str = "MgrActive";
    /// Setting that forces an update
    pub const UPDATE_REQUIRED: &'static str = "ManagerUpdateRequired";
    /// Setting holding the flag file cleanup mode
    pub const CLEANUP_MODE: &'static str = "ManagerErrorCleanupMode";

    /// Build from (name, value) pairs; names compare case-insensitively
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Look up a setting
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Manager enabled remotely (missing = enabled)
    pub fn mgr_active(&self) -> bool {
        self.get(Self::MGR_ACTIVE).is_none_or(parse_flag)
    }

    /// A forced update is pending (missing = no)
    pub fn update_required(&self) -> bool {
        self.get(Self::UPDATE_REQUIRED).is_some_and(parse_flag)
    }

    /// Cleanup mode override, if the store defines one
    pub fn cleanup_mode(&self) -> Option<CleanupMode> {
        self.get(Self::CLEANUP_MODE).map(CleanupMode::from_setting)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1"
    )
}

/// Source of remote manager settings
#[async_trait]
pub trait ManagerSettingsSource: Send + Sync {
    /// Load the current settings for `manager`
    async fn load_settings(&self, manager: &str) -> Result<RemoteSettings>;

    /// Write one setting
    async fn set_setting(&self, manager: &str, name: &str, value: &str) -> Result<()>;

    /// Acknowledge a forced update so it is not applied twice
    async fn ack_update_required(&self, manager: &str) -> Result<()>;
}

/// Task state codes in `capture_tasks.state`
pub mod task_state {
    /// Waiting for a manager
    pub const PENDING: i32 = 0;
    /// Handed out to a manager
    pub const ASSIGNED: i32 = 1;
    /// Closed by the manager
    pub const CLOSED: i32 = 2;
}

/// New task to be inserted into the store
#[derive(Debug, Clone)]
pub struct NewCaptureTask {
    /// Job number
    pub job: JobId,
    /// Step number
    pub step: i32,
    /// Step tool name
    pub step_tool: String,
    /// Dataset name
    pub dataset: String,
    /// Task parameters
    pub params: TaskParams,
    /// Higher values are handed out first
    pub priority: i32,
}

/// Task record from the store
#[derive(Debug, Clone, FromRow)]
pub struct CaptureTaskRecord {
    /// Job number
    pub job: i64,
    /// Step number
    pub step: i32,
    /// Step tool name
    pub step_tool: String,
    /// Dataset name
    pub dataset: String,
    /// See [`task_state`]
    pub state: i32,
    /// Manager holding or last holding the task
    pub processor: Option<String>,
    /// Closeout code reported by the manager
    pub closeout_code: Option<i32>,
    /// Closeout message reported by the manager
    pub closeout_msg: Option<String>,
    /// Evaluation code reported by the manager
    pub eval_code: Option<i32>,
    /// Evaluation message reported by the manager
    pub eval_msg: Option<String>,
}

/// sqlite-backed task store
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    busy_retries: u32,
}

impl SqliteTaskStore {
    /// Underlying pool (for tests)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests;
