//! Shared fixtures for the integration tests
//!
//! A [`Site`] is one temp directory laid out like a capture deployment:
//! an instrument share, a storage volume, a working directory, a scratch
//! directory and a sqlite task store.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use capture_manager::capture::{CaptureContext, StrategyRegistry};
use capture_manager::logging::Observability;
use capture_manager::status::StatusWriter;
use capture_manager::store::{CaptureTaskRecord, NewCaptureTask, SqliteTaskStore};
use capture_manager::types::{JobId, TaskParams};
use capture_manager::{CaptureManager, Config, ManagerServices};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Instrument folder under the share root
pub const SOURCE_PATH: &str = "Proto_Inst_01";

/// Storage folder under the storage volume
pub const STORAGE_PATH: &str = "2026_4";

pub struct Site {
    pub dir: TempDir,
    pub config: Config,
    pub store: Arc<SqliteTaskStore>,
    pub obs: Observability,
}

impl Site {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["share", "storage", "work", "scratch"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("share").join(SOURCE_PATH)).unwrap();

        let mut config = Config::default();
        config.manager.name = "Proto-7_CaptureManager".to_string();
        config.manager.working_dir = dir.path().join("work");
        config.task_store.database_path = dir.path().join("tasks.db");
        config.capture.stability_base_interval = Duration::from_secs(1);
        config.disk_space.enabled = false;
        config.status.status_file = dir.path().join("status.json");
        config.status.min_write_interval = Duration::ZERO;
        config.housekeeping.scratch_dir = dir.path().join("scratch");
        config.housekeeping.maintenance_blackout = false;

        let store = SqliteTaskStore::new(&config.task_store.database_path, 3)
            .await
            .unwrap();

        Self {
            dir,
            config,
            store: Arc::new(store),
            obs: Observability::new(),
        }
    }

    pub fn share(&self) -> PathBuf {
        self.dir.path().join("share")
    }

    pub fn storage(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    pub fn working_dir(&self) -> PathBuf {
        self.config.manager.working_dir.clone()
    }

    /// Where the instrument wrote `item`
    pub fn source_item(&self, item: &str) -> PathBuf {
        self.share().join(SOURCE_PATH).join(item)
    }

    /// Where `dataset` is captured to
    pub fn destination(&self, dataset: &str) -> PathBuf {
        self.storage().join(STORAGE_PATH).join(dataset)
    }

    /// Queue a capture task for `dataset`
    pub async fn enqueue(&self, job: i64, step_tool: &str, dataset: &str, raw_data_type: &str) {
        self.enqueue_with(job, step_tool, dataset, raw_data_type, &[])
            .await;
    }

    /// Queue a capture task with extra parameters
    pub async fn enqueue_with(
        &self,
        job: i64,
        step_tool: &str,
        dataset: &str,
        raw_data_type: &str,
        extra: &[(&str, &str)],
    ) {
        let share = self.share().display().to_string();
        let storage = self.storage().display().to_string();
        let params: TaskParams = [
            ("Dataset", dataset),
            ("Raw_Data_Type", raw_data_type),
            ("Instrument_Name", "Proto_Inst_01"),
            ("Instrument_Class", "BrukerFTMS"),
            ("Capture_Method", "fso"),
            ("Source_Vol", share.as_str()),
            ("Source_Path", SOURCE_PATH),
            ("Storage_Vol_External", storage.as_str()),
            ("Storage_Path", STORAGE_PATH),
        ]
        .into_iter()
        .chain(extra.iter().copied())
        .collect();

        self.store
            .enqueue_task(&NewCaptureTask {
                job: JobId(job),
                step: 1,
                step_tool: step_tool.to_string(),
                dataset: dataset.to_string(),
                params,
                priority: 0,
            })
            .await
            .unwrap();
    }

    pub async fn task(&self, job: i64) -> CaptureTaskRecord {
        self.store.get_task(JobId(job), 1).await.unwrap().unwrap()
    }

    /// Controller wired to the sqlite store and the built-in strategies
    pub fn manager(&self) -> CaptureManager {
        let status = Arc::new(StatusWriter::new(
            &self.config.status,
            &self.config.manager.name,
            self.obs.clone(),
        ));
        let ctx = Arc::new(
            CaptureContext::new(self.config.capture.clone(), self.obs.clone())
                .with_progress(status.clone()),
        );
        let services = ManagerServices {
            store: self.store.clone(),
            settings: self.store.clone(),
            registry: Arc::new(StrategyRegistry::with_builtin(ctx)),
            status,
            obs: self.obs.clone(),
        };
        CaptureManager::new(self.config.clone(), services)
    }

    /// Parsed status file
    pub fn status(&self) -> serde_json::Value {
        let text = std::fs::read_to_string(&self.config.status.status_file).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}

/// Write `contents` to `path`, creating parent directories
pub fn write_file(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// (relative path, length) of every file under `root`, sorted
pub fn file_tree(root: &Path) -> Vec<(String, u64)> {
    let mut files: Vec<(String, u64)> = walkdir::WalkDir::new(root)
        .into_iter()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            (relative, entry.metadata().unwrap().len())
        })
        .collect();
    files.sort();
    files
}
