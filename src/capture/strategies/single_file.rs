use crate::capture::sanitize::sanitize_directory;
use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, copy_with_retry, with_share_connection,
};
use crate::error::CaptureError;
use crate::types::{CaptureOutcome, DatasetInfo};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{ensure_stable, prepare_destination};

/// Captures a dataset stored as one file
pub struct SingleFileCapture {
    ctx: Arc<CaptureContext>,
}

impl SingleFileCapture {
    /// Strategy sharing `ctx`
    pub fn new(ctx: Arc<CaptureContext>) -> Self {
        Self { ctx }
    }

    async fn run(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
    ) -> Result<CaptureOutcome, CaptureError> {
        let meta = tokio::fs::metadata(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::SourceNotFound(source.to_path_buf())
            } else {
                CaptureError::from_io(source, e)
            }
        })?;
        if meta.is_dir() {
            return Err(CaptureError::Validation(format!(
                "Expected a file but found a directory: {}",
                source.display()
            )));
        }

        let bytes = ensure_stable(&self.ctx.detector(), source, "file").await?;

        let file_name = source
            .file_name()
            .ok_or_else(|| CaptureError::Validation(format!("no file name in {}", source.display())))?;
        prepare_destination(destination, resume).await?;

        let target = destination.join(file_name);
        let copier = self.ctx.copier(bytes);
        copy_with_retry(source, || copier.copy_file(source, &target)).await?;

        sanitize_directory(destination, &info.dataset_name, &self.ctx.config.sanitize_replacement)
            .await?;

        tracing::info!(
            dataset = %info.dataset_name,
            bytes,
            destination = %destination.display(),
            "Captured single-file dataset"
        );
        Ok(CaptureOutcome::success(""))
    }
}

#[async_trait]
impl CaptureStrategy for SingleFileCapture {
    fn name(&self) -> &'static str {
        "SingleFileCapture"
    }

    async fn capture(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
        instrument: &InstrumentContext,
    ) -> CaptureOutcome {
        let share = self.ctx.shares.connection_for(instrument);
        with_share_connection(share.as_ref(), source, self.run(info, source, destination, resume))
            .await
    }
}
