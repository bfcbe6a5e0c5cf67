#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::capture::{CaptureContext, InstrumentContext};
use crate::config::CaptureConfig;
use crate::test_helpers::{CountingShare, capture_context, fast_capture_config};
use crate::types::{DatasetInfo, DatasetType};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

mod strategies;

/// Instrument share and storage volume in a temp dir
struct Fixture {
    _dir: TempDir,
    share: PathBuf,
    storage: PathBuf,
    ctx: Arc<CaptureContext>,
    counter: Arc<CountingShare>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(fast_capture_config())
    }

    fn with_config(config: CaptureConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let share = dir.path().join("share");
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&share).unwrap();
        std::fs::create_dir_all(&storage).unwrap();
        let (ctx, counter) = capture_context(config);
        Self {
            _dir: dir,
            share,
            storage,
            ctx,
            counter,
        }
    }

    /// Write `contents` to `relative` under the share, creating parents
    fn file(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.share.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn dir(&self, relative: &str) -> PathBuf {
        let path = self.share.join(relative);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn destination(&self, dataset: &str) -> PathBuf {
        self.storage.join(dataset)
    }

    /// The share released exactly as often as it was opened
    fn assert_released_once(&self) {
        assert_eq!(self.counter.connects(), 1, "share connects");
        assert_eq!(self.counter.disconnects(), 1, "share disconnects");
        assert!(!crate::capture::ShareConnection::is_connected(self.counter.as_ref()));
    }
}

fn info(dataset: &str, item: &str, dataset_type: DatasetType) -> DatasetInfo {
    DatasetInfo {
        dataset_name: dataset.to_string(),
        item_name: item.to_string(),
        dataset_type,
        file_list: Vec::new(),
    }
}

fn instrument(class: &str) -> InstrumentContext {
    InstrumentContext {
        instrument_name: "Inst_01".to_string(),
        instrument_class: class.to_string(),
        ..InstrumentContext::default()
    }
}
