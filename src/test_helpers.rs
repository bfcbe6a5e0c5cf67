//! Recording fakes shared by the unit tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, ShareConnection, ShareConnector,
};
use crate::capture::StrategyRegistry;
use crate::config::{CaptureConfig, Config};
use crate::manager::{CaptureManager, ManagerServices};
use crate::status::StatusWriter;
use crate::error::{CaptureError, Error, Result, TaskStoreError};
use crate::logging::Observability;
use crate::store::{CloseTask, ManagerSettingsSource, RemoteSettings, RequestTaskResult, TaskStore};
use crate::types::{CaptureOutcome, DatasetInfo, Task, TaskParams};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Share connection that counts connects and disconnects
#[derive(Debug, Default)]
pub(crate) struct CountingShare {
    connects: AtomicU32,
    disconnects: AtomicU32,
    connected: AtomicBool,
    fail_with: Option<String>,
}

impl CountingShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share whose connect always fails with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShareConnection for CountingShare {
    async fn connect(&self) -> std::result::Result<(), CaptureError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(CaptureError::from_io(
                Path::new("/mnt/instrument"),
                std::io::Error::other(message.clone()),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> std::result::Result<(), CaptureError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out the same [`CountingShare`] for every instrument
pub(crate) struct CountingConnector(pub Arc<CountingShare>);

impl ShareConnector for CountingConnector {
    fn connection_for(&self, _instrument: &InstrumentContext) -> Arc<dyn ShareConnection> {
        self.0.clone()
    }
}

/// Capture context over `config` with a counting share
pub(crate) fn capture_context(config: CaptureConfig) -> (Arc<CaptureContext>, Arc<CountingShare>) {
    let share = Arc::new(CountingShare::new());
    let ctx = CaptureContext::new(config, Observability::new())
        .with_shares(Arc::new(CountingConnector(share.clone())));
    (Arc::new(ctx), share)
}

/// Capture settings with a short stability wait
pub(crate) fn fast_capture_config() -> CaptureConfig {
    CaptureConfig {
        stability_base_interval: Duration::from_secs(1),
        copy_chunk_size: 4096,
        ..CaptureConfig::default()
    }
}

/// Task store that replays scripted request results and records calls
#[derive(Default)]
pub(crate) struct RecordingTaskStore {
    responses: Mutex<VecDeque<RequestTaskResult>>,
    closes: Mutex<Vec<CloseTask>>,
    events: Mutex<Vec<&'static str>>,
    idle_failures: AtomicU32,
}

impl RecordingTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request result; an empty queue answers NoTaskFound
    pub fn push(&self, response: RequestTaskResult) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Make the next `count` report-idle calls fail with a deadlock
    pub fn fail_idle_reports(&self, count: u32) {
        self.idle_failures.store(count, Ordering::SeqCst);
    }

    pub fn closes(&self) -> Vec<CloseTask> {
        self.closes.lock().unwrap().clone()
    }

    /// Calls in order: "request", "close", "report_idle"
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn idle_reports(&self) -> usize {
        self.events().iter().filter(|e| **e == "report_idle").count()
    }
}

#[async_trait]
impl TaskStore for RecordingTaskStore {
    async fn request_task(&self, _manager: &str, _version: &str) -> RequestTaskResult {
        self.events.lock().unwrap().push("request");
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RequestTaskResult::NoTaskFound)
    }

    async fn close_task(&self, close: &CloseTask) -> Result<()> {
        self.events.lock().unwrap().push("close");
        self.closes.lock().unwrap().push(close.clone());
        Ok(())
    }

    async fn report_idle(&self, _manager: &str) -> Result<()> {
        self.events.lock().unwrap().push("report_idle");
        let remaining = self.idle_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.idle_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TaskStore(TaskStoreError::Deadlock {
                procedure: "report_idle",
            }));
        }
        Ok(())
    }
}

/// In-memory manager settings
#[derive(Default)]
pub(crate) struct FakeSettings {
    values: Mutex<HashMap<String, String>>,
    fail_load: AtomicBool,
    loads: AtomicU32,
}

impl FakeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_lowercase(), value.to_string());
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.values.lock().unwrap().get(&name.to_lowercase()).cloned()
    }

    pub fn fail_loads(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagerSettingsSource for FakeSettings {
    async fn load_settings(&self, _manager: &str) -> Result<RemoteSettings> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(Error::Other("settings database offline".into()));
        }
        let values = self.values.lock().unwrap().clone();
        Ok(RemoteSettings::from_pairs(values))
    }

    async fn set_setting(&self, _manager: &str, name: &str, value: &str) -> Result<()> {
        self.set(name, value);
        Ok(())
    }

    async fn ack_update_required(&self, manager: &str) -> Result<()> {
        self.set_setting(manager, RemoteSettings::UPDATE_REQUIRED, "False")
            .await
    }
}

/// Strategy returning a fixed outcome (or panicking)
pub(crate) struct FakeStrategy {
    outcome: CaptureOutcome,
    panic_with: Option<String>,
    calls: AtomicU32,
    seen: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeStrategy {
    pub fn returning(outcome: CaptureOutcome) -> Self {
        Self {
            outcome,
            panic_with: None,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn panicking(message: &str) -> Self {
        Self {
            panic_with: Some(message.to_string()),
            ..Self::returning(CaptureOutcome::success(""))
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// (source, destination) of every call
    pub fn seen(&self) -> Vec<(PathBuf, PathBuf)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureStrategy for FakeStrategy {
    fn name(&self) -> &'static str {
        "FakeStrategy"
    }

    async fn capture(
        &self,
        _info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        _resume: bool,
        _instrument: &InstrumentContext,
    ) -> CaptureOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((source.to_path_buf(), destination.to_path_buf()));
        if let Some(message) = &self.panic_with {
            panic!("{}", message);
        }
        self.outcome.clone()
    }
}

/// Assigned task for `tool` with the usual path parameters
pub(crate) fn assigned_task(job: i64, step: i32, tool: &str, source_vol: &Path, storage_vol: &Path) -> Task {
    let params: TaskParams = [
        ("StepTool", tool.to_string()),
        ("Dataset", format!("Dataset_{job}")),
        ("Raw_Data_Type", "data_folders".to_string()),
        ("Source_Vol", source_vol.display().to_string()),
        ("Source_Path", "Instrument_01".to_string()),
        ("Storage_Vol_External", storage_vol.display().to_string()),
        ("Storage_Path", "2026_4".to_string()),
    ]
    .into_iter()
    .collect();
    Task::assigned(job, step, params)
}

/// Temp-dir backed controller fixture
pub(crate) struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub store: Arc<RecordingTaskStore>,
    pub settings: Arc<FakeSettings>,
    pub obs: Observability,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["work", "source", "storage", "scratch"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }

        let mut config = Config::default();
        config.manager.name = "Proto-Test_CaptureManager".to_string();
        config.manager.working_dir = dir.path().join("work");
        config.manager.max_task_count = 10;
        config.disk_space.enabled = false;
        config.status.status_file = dir.path().join("status.json");
        config.status.min_write_interval = Duration::ZERO;
        config.housekeeping.scratch_dir = dir.path().join("scratch");
        config.housekeeping.maintenance_blackout = false;
        config.task_store.report_idle_retry.initial_delay = Duration::from_millis(1);
        config.task_store.report_idle_retry.max_delay = Duration::from_millis(5);
        config.task_store.report_idle_retry.jitter = false;

        Self {
            dir,
            config,
            store: Arc::new(RecordingTaskStore::new()),
            settings: Arc::new(FakeSettings::new()),
            obs: Observability::new(),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.config.manager.working_dir.clone()
    }

    pub fn source_vol(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn storage_vol(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    /// Assigned task whose paths point into this fixture
    pub fn task(&self, job: i64, step: i32, tool: &str) -> Task {
        assigned_task(job, step, tool, &self.source_vol(), &self.storage_vol())
    }

    /// Controller whose registry maps `tool` to `strategy`
    pub fn manager_with(&self, tool: &str, strategy: Arc<dyn CaptureStrategy>) -> CaptureManager {
        let mut registry = StrategyRegistry::empty();
        registry.register(tool, strategy);
        self.manager(registry)
    }

    pub fn manager(&self, registry: StrategyRegistry) -> CaptureManager {
        let status = Arc::new(StatusWriter::new(
            &self.config.status,
            &self.config.manager.name,
            self.obs.clone(),
        ));
        let services = ManagerServices {
            store: self.store.clone(),
            settings: self.settings.clone(),
            registry: Arc::new(registry),
            status,
            obs: self.obs.clone(),
        };
        CaptureManager::new(self.config.clone(), services)
    }

    /// Parsed status file
    pub fn status_file(&self) -> serde_json::Value {
        let text = std::fs::read_to_string(&self.config.status.status_file).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}
