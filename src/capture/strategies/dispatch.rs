use crate::capture::{CaptureContext, CaptureStrategy, InstrumentContext};
use crate::types::{CaptureOutcome, DatasetInfo, DatasetType};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{
    DirectoryExtCapture, DirectoryNoExtCapture, MultiFileCapture, SingleFileCapture, SpotCapture,
};

/// Picks the directory strategy from the item name
///
/// `X.d` is captured as a directory with extension, `X` as a plain
/// directory.
pub struct DirectoryCapture {
    with_extension: DirectoryExtCapture,
    without_extension: DirectoryNoExtCapture,
}

impl DirectoryCapture {
    /// Dispatcher sharing `ctx`
    pub fn new(ctx: Arc<CaptureContext>) -> Self {
        Self {
            with_extension: DirectoryExtCapture::new(ctx.clone()),
            without_extension: DirectoryNoExtCapture::new(ctx),
        }
    }

    fn pick(&self, info: &DatasetInfo) -> &dyn CaptureStrategy {
        if Path::new(&info.item_name).extension().is_some() {
            &self.with_extension
        } else {
            &self.without_extension
        }
    }
}

#[async_trait]
impl CaptureStrategy for DirectoryCapture {
    fn name(&self) -> &'static str {
        "DirectoryCapture"
    }

    async fn capture(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
        instrument: &InstrumentContext,
    ) -> CaptureOutcome {
        self.pick(info)
            .capture(info, source, destination, resume, instrument)
            .await
    }
}

/// Fails every capture; used for raw data types with no strategy
pub struct UnknownTypeCapture;

#[async_trait]
impl CaptureStrategy for UnknownTypeCapture {
    fn name(&self) -> &'static str {
        "UnknownTypeCapture"
    }

    async fn capture(
        &self,
        info: &DatasetInfo,
        _source: &Path,
        _destination: &Path,
        _resume: bool,
        _instrument: &InstrumentContext,
    ) -> CaptureOutcome {
        tracing::warn!(dataset = %info.dataset_name, "Dataset type is unknown; cannot capture");
        CaptureOutcome::failed(format!(
            "Unknown dataset type for dataset {}",
            info.dataset_name
        ))
    }
}

/// Chooses a strategy from the dataset's raw data type
pub struct AutoCapture {
    single_file: SingleFileCapture,
    multi_file: MultiFileCapture,
    directory_ext: DirectoryExtCapture,
    directory_no_ext: DirectoryNoExtCapture,
    spot: SpotCapture,
}

impl AutoCapture {
    /// Dispatcher sharing `ctx`
    pub fn new(ctx: Arc<CaptureContext>) -> Self {
        Self {
            single_file: SingleFileCapture::new(ctx.clone()),
            multi_file: MultiFileCapture::new(ctx.clone()),
            directory_ext: DirectoryExtCapture::new(ctx.clone()),
            directory_no_ext: DirectoryNoExtCapture::new(ctx.clone()),
            spot: SpotCapture::new(ctx),
        }
    }

    fn pick(&self, dataset_type: DatasetType) -> &dyn CaptureStrategy {
        match dataset_type {
            DatasetType::File => &self.single_file,
            DatasetType::MultiFile => &self.multi_file,
            DatasetType::DirectoryExt => &self.directory_ext,
            DatasetType::DirectoryNoExt => &self.directory_no_ext,
            DatasetType::SpotDirectory => &self.spot,
            DatasetType::Unknown => &UnknownTypeCapture,
        }
    }
}

#[async_trait]
impl CaptureStrategy for AutoCapture {
    fn name(&self) -> &'static str {
        "DatasetCapture"
    }

    async fn capture(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
        instrument: &InstrumentContext,
    ) -> CaptureOutcome {
        let strategy = self.pick(info.dataset_type);
        tracing::debug!(
            dataset = %info.dataset_name,
            dataset_type = %info.dataset_type,
            strategy = strategy.name(),
            "Dispatching capture"
        );
        strategy
            .capture(info, source, destination, resume, instrument)
            .await
    }
}
