//! Core types for capture-manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maximum length of a closeout message sent to the task store
pub const MAX_CLOSEOUT_MESSAGE_LEN: usize = 512;

/// Maximum length of an evaluation message sent to the task store
pub const MAX_EVAL_MESSAGE_LEN: usize = 256;

/// Job number assigned by the task store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl PartialEq<i64> for JobId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task parameters with case-insensitive keys
///
/// The map is populated wholesale from the task store on assignment. Local
/// code may only add or overwrite entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Keys are stored lowercased; the original spelling is kept for display
    entries: HashMap<String, (String, String)>,
}

impl TaskParams {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a parameter
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .insert(name.to_lowercase(), (name, value.into()));
    }

    /// Look up a parameter by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Look up a parameter, falling back to `default` when absent or empty
    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.get(name) {
            Some(value) if !value.trim().is_empty() => value,
            _ => default,
        }
    }

    /// Interpret a parameter as a boolean ("true", "yes", "1")
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).is_some_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "y" | "1"
            )
        })
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no parameters are defined
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (name, value) pairs using the original key spelling
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TaskParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = TaskParams::new();
        for (name, value) in iter {
            params.set(name, value);
        }
        params
    }
}

/// Identity of an assigned task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Job number
    pub job: JobId,
    /// Step number within the job
    pub step: i32,
}

/// One unit of capture work
///
/// A task is either unassigned (no active job) or assigned (job and step both
/// present and non-negative). Closing transitions it back to unassigned.
#[derive(Clone, Debug, Default)]
pub struct Task {
    assignment: Option<Assignment>,
    /// Step tool name (selects the capture strategy)
    pub step_tool: String,
    /// Dataset name
    pub dataset: String,
    /// Parameters from the task store
    pub params: TaskParams,
}

impl Task {
    /// Build an assigned task; negative job or step numbers leave it unassigned
    pub fn assigned(job: i64, step: i32, params: TaskParams) -> Self {
        let assignment = (job >= 0 && step >= 0).then_some(Assignment {
            job: JobId(job),
            step,
        });
        let step_tool = params.get_or("StepTool", "").to_string();
        let dataset = params.get_or("Dataset", "").to_string();
        Self {
            assignment,
            step_tool,
            dataset,
            params,
        }
    }

    /// Current assignment, if any
    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment
    }

    /// True while a job is active
    pub fn is_assigned(&self) -> bool {
        self.assignment.is_some()
    }

    /// Transition back to unassigned, returning the previous assignment
    pub fn close(&mut self) -> Option<Assignment> {
        self.assignment.take()
    }
}

/// Coarse-grained result of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseoutKind {
    /// Capture finished
    Success,
    /// Capture failed
    Failed,
    /// Source still being written; the store should offer the task again later
    NotReady,
    /// The manager must stop processing after closing this task
    NeedToAbortProcessing,
}

impl CloseoutKind {
    /// Numeric code used by the task store
    pub fn to_i32(self) -> i32 {
        match self {
            CloseoutKind::Success => 0,
            CloseoutKind::Failed => 1,
            CloseoutKind::NotReady => 2,
            CloseoutKind::NeedToAbortProcessing => 3,
        }
    }
}

impl fmt::Display for CloseoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseoutKind::Success => "success",
            CloseoutKind::Failed => "failed",
            CloseoutKind::NotReady => "not ready",
            CloseoutKind::NeedToAbortProcessing => "need to abort processing",
        };
        f.write_str(name)
    }
}

/// Secondary classification telling the store whether to retry a failure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalCode {
    /// No evaluation needed
    #[default]
    Success,
    /// Failure that must not be retried automatically
    FailureDoNotRetry,
    /// Network failure; the store may retry the capture
    NetworkErrorRetry,
    /// Generic failure
    Failed,
}

impl EvalCode {
    /// Numeric code used by the task store
    pub fn to_i32(self) -> i32 {
        match self {
            EvalCode::Success => 0,
            EvalCode::Failed => 1,
            EvalCode::FailureDoNotRetry => 2,
            EvalCode::NetworkErrorRetry => 3,
        }
    }
}

/// Result of running a capture strategy
///
/// Produced once per task execution and consumed by the controller to pick
/// the close-task call.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Closeout kind
    pub closeout: CloseoutKind,
    /// Human-readable closeout message
    pub message: String,
    /// Evaluation code
    pub eval_code: EvalCode,
    /// Evaluation message
    pub eval_message: String,
}

impl CaptureOutcome {
    /// Successful capture
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            closeout: CloseoutKind::Success,
            message: message.into(),
            eval_code: EvalCode::Success,
            eval_message: String::new(),
        }
    }

    /// Failed capture with the generic eval code
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            closeout: CloseoutKind::Failed,
            message: message.into(),
            eval_code: EvalCode::Failed,
            eval_message: String::new(),
        }
    }

    /// Failed capture that the store must not retry
    pub fn failed_do_not_retry(message: impl Into<String>) -> Self {
        Self {
            eval_code: EvalCode::FailureDoNotRetry,
            ..Self::failed(message)
        }
    }

    /// Source still changing
    pub fn not_ready(message: impl Into<String>, eval_message: impl Into<String>) -> Self {
        Self {
            closeout: CloseoutKind::NotReady,
            message: message.into(),
            eval_code: EvalCode::Success,
            eval_message: eval_message.into(),
        }
    }

    /// Attach an evaluation message
    pub fn with_eval_message(mut self, eval_message: impl Into<String>) -> Self {
        self.eval_message = eval_message.into();
        self
    }

    /// True when the manager must stop after closing this task
    pub fn needs_abort(&self) -> bool {
        self.closeout == CloseoutKind::NeedToAbortProcessing
    }
}

/// Shape of a dataset on the instrument share
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    /// One file
    File,
    /// Several files sharing a base name (e.g. `X.wiff` and `X.wiff.scan`)
    MultiFile,
    /// A directory whose name has an extension (e.g. `X.d`)
    DirectoryExt,
    /// A directory without an extension
    DirectoryNoExt,
    /// Spot-based acquisition layout (one subdirectory per spot)
    SpotDirectory,
    /// Unrecognized raw data type
    Unknown,
}

impl DatasetType {
    /// Map the store's raw data type name to a dataset shape
    pub fn from_raw_data_type(raw_data_type: &str) -> Self {
        match raw_data_type.trim().to_ascii_lowercase().as_str() {
            "dot_raw_files" | "dot_uimf_files" | "dot_mzml_files" | "dot_mzxml_files"
            | "dot_qgd_files" | "dot_wiff_files_single" | "sciex_t2d_file" => DatasetType::File,
            "dot_wiff_files" | "sciex_wiff_files" => DatasetType::MultiFile,
            "dot_d_folders" | "dot_raw_folder" | "bruker_tof_tdf" | "agilent_d_folders" => {
                DatasetType::DirectoryExt
            }
            "bruker_ft" | "bruker_tof_baf" | "data_folders" | "zipped_s_folders"
            | "illumina_folder" => DatasetType::DirectoryNoExt,
            "bruker_maldi_spot" => DatasetType::SpotDirectory,
            _ => DatasetType::Unknown,
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetType::File => "file",
            DatasetType::MultiFile => "multiple files",
            DatasetType::DirectoryExt => "directory with extension",
            DatasetType::DirectoryNoExt => "directory without extension",
            DatasetType::SpotDirectory => "spot directory",
            DatasetType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Resolved shape of one dataset prior to capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetInfo {
    /// Dataset name
    pub dataset_name: String,
    /// File or directory name to move
    pub item_name: String,
    /// Dataset shape
    pub dataset_type: DatasetType,
    /// Files to move for multi-file datasets (empty = discover on the share)
    pub file_list: Vec<String>,
}

impl DatasetInfo {
    /// Build dataset info from task parameters
    ///
    /// `Directory` names the item to move and defaults to the dataset name;
    /// `Raw_Data_Type` selects the shape; `File_List` (semicolon separated)
    /// pins the files of a multi-file dataset.
    pub fn from_params(params: &TaskParams) -> Self {
        let dataset_name = params.get_or("Dataset", "").trim().to_string();
        let item_name = params
            .get_or("Directory", &dataset_name)
            .trim()
            .to_string();
        let dataset_type = DatasetType::from_raw_data_type(params.get_or("Raw_Data_Type", ""));
        let file_list = params
            .get("File_List")
            .map(|list| {
                list.split(';')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            dataset_name,
            item_name,
            dataset_type,
            file_list,
        }
    }
}

/// Every reason the controller's poll loop can stop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExitCode {
    /// The store had no work
    NoTaskFound,
    /// Local configuration changed since startup
    ConfigChanged,
    /// The configured task count was reached
    ExceededMaxTaskCount,
    /// Manager disabled in the remote settings
    DisabledRemotely,
    /// Manager disabled in the local configuration
    DisabledLocally,
    /// Too many consecutive task request errors
    ExcessiveRequestErrors,
    /// Working directory invalid and no fallback exists
    InvalidWorkDir,
    /// Shutdown requested (signal)
    ShutdownRequested,
    /// Remote settings flagged (or failed to load) a required update
    UpdateRequired,
    /// An un-cleaned flag file is present
    FlagFile,
    /// A capture strategy requested that processing stop
    NeedToAbortProcessing,
    /// The loop itself failed unexpectedly
    UnhandledError,
}

impl LoopExitCode {
    /// All exit codes, in declaration order
    pub const ALL: [LoopExitCode; 12] = [
        LoopExitCode::NoTaskFound,
        LoopExitCode::ConfigChanged,
        LoopExitCode::ExceededMaxTaskCount,
        LoopExitCode::DisabledRemotely,
        LoopExitCode::DisabledLocally,
        LoopExitCode::ExcessiveRequestErrors,
        LoopExitCode::InvalidWorkDir,
        LoopExitCode::ShutdownRequested,
        LoopExitCode::UpdateRequired,
        LoopExitCode::FlagFile,
        LoopExitCode::NeedToAbortProcessing,
        LoopExitCode::UnhandledError,
    ];
}

impl fmt::Display for LoopExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Manager-level status shown in the status snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStatus {
    /// Starting up
    #[default]
    Starting,
    /// Running a task
    Running,
    /// Waiting for work
    Idle,
    /// Stopped normally
    Stopped,
    /// Stopped because of an error
    StoppedError,
    /// Disabled locally
    DisabledLocal,
    /// Disabled remotely
    DisabledRemote,
}

/// Task-level status shown in the status snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// No task in flight
    #[default]
    NoTask,
    /// Task running
    Running,
    /// Task being closed
    Closing,
    /// Task failed
    Failed,
}

/// Summary of the most recently finished job, persisted across restarts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentJob {
    /// Job number
    pub job: JobId,
    /// Step number
    pub step: i32,
    /// Step tool
    pub step_tool: String,
    /// Dataset name
    pub dataset: String,
    /// Closeout kind reported to the store
    pub closeout: CloseoutKind,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for RecentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job {}, Step {}, Tool {}, Dataset {}, {} at {}",
            self.job,
            self.step,
            self.step_tool,
            self.dataset,
            self.closeout,
            self.finished_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_params_are_case_insensitive() {
        let mut params = TaskParams::new();
        params.set("Dataset", "QC_Shew_24_01");
        assert_eq!(params.get("dataset"), Some("QC_Shew_24_01"));
        assert_eq!(params.get("DATASET"), Some("QC_Shew_24_01"));

        params.set("DATASET", "QC_Shew_24_02");
        assert_eq!(params.len(), 1, "overwrite must not add a second entry");
        assert_eq!(params.get("Dataset"), Some("QC_Shew_24_02"));
    }

    #[test]
    fn task_params_bool_parsing() {
        let params: TaskParams = [("Resume", "Yes"), ("Other", "0")].into_iter().collect();
        assert!(params.get_bool("resume"));
        assert!(!params.get_bool("other"));
        assert!(!params.get_bool("missing"));
    }

    #[test]
    fn task_is_assigned_only_with_non_negative_ids() {
        let task = Task::assigned(1000, 1, TaskParams::new());
        assert!(task.is_assigned());

        let task = Task::assigned(-1, 1, TaskParams::new());
        assert!(!task.is_assigned());

        let task = Task::assigned(1000, -3, TaskParams::new());
        assert!(!task.is_assigned());
    }

    #[test]
    fn closing_a_task_unassigns_it() {
        let mut task = Task::assigned(42, 2, TaskParams::new());
        let closed = task.close().unwrap();
        assert_eq!(closed.job, 42);
        assert_eq!(closed.step, 2);
        assert!(!task.is_assigned());
        assert!(task.close().is_none());
    }

    #[test]
    fn dataset_info_defaults_item_name_to_dataset() {
        let params: TaskParams = [("Dataset", "Sample_01"), ("Raw_Data_Type", "dot_d_folders")]
            .into_iter()
            .collect();
        let info = DatasetInfo::from_params(&params);
        assert_eq!(info.item_name, "Sample_01");
        assert_eq!(info.dataset_type, DatasetType::DirectoryExt);
        assert!(info.file_list.is_empty());
    }

    #[test]
    fn dataset_info_parses_file_list() {
        let params: TaskParams = [
            ("Dataset", "Sciex_01"),
            ("Raw_Data_Type", "dot_wiff_files"),
            ("File_List", "Sciex_01.wiff; Sciex_01.wiff.scan;"),
        ]
        .into_iter()
        .collect();
        let info = DatasetInfo::from_params(&params);
        assert_eq!(info.dataset_type, DatasetType::MultiFile);
        assert_eq!(info.file_list, vec!["Sciex_01.wiff", "Sciex_01.wiff.scan"]);
    }

    #[test]
    fn unknown_raw_data_type_maps_to_unknown() {
        assert_eq!(
            DatasetType::from_raw_data_type("hologram_cubes"),
            DatasetType::Unknown
        );
        assert_eq!(
            DatasetType::from_raw_data_type(" Bruker_MALDI_Spot "),
            DatasetType::SpotDirectory
        );
    }

    #[test]
    fn closeout_and_eval_codes_are_distinct() {
        let closeouts: std::collections::HashSet<i32> = [
            CloseoutKind::Success,
            CloseoutKind::Failed,
            CloseoutKind::NotReady,
            CloseoutKind::NeedToAbortProcessing,
        ]
        .iter()
        .map(|c| c.to_i32())
        .collect();
        assert_eq!(closeouts.len(), 4);

        let evals: std::collections::HashSet<i32> = [
            EvalCode::Success,
            EvalCode::Failed,
            EvalCode::FailureDoNotRetry,
            EvalCode::NetworkErrorRetry,
        ]
        .iter()
        .map(|c| c.to_i32())
        .collect();
        assert_eq!(evals.len(), 4);
    }
}
