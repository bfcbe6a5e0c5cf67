use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, Stability, copy_with_retry,
    with_share_connection,
};
use crate::error::CaptureError;
use crate::types::{CaptureOutcome, DatasetInfo};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::prepare_destination;

/// Captures a dataset made of several files sharing a base name
///
/// `source` names the primary file (e.g. `X.wiff`); its siblings are the
/// files in the same directory whose names start with `X.`, unless the task
/// pins an explicit file list. Names are stored unchanged; companion files
/// such as `X.wiff.scan` must keep their vendor spelling.
pub struct MultiFileCapture {
    ctx: Arc<CaptureContext>,
}

impl MultiFileCapture {
    /// Strategy sharing `ctx`
    pub fn new(ctx: Arc<CaptureContext>) -> Self {
        Self { ctx }
    }

    async fn dataset_files(
        &self,
        info: &DatasetInfo,
        source: &Path,
    ) -> Result<Vec<PathBuf>, CaptureError> {
        let parent = source.parent().unwrap_or(Path::new(""));

        if !info.file_list.is_empty() {
            return Ok(info.file_list.iter().map(|name| parent.join(name)).collect());
        }

        let base = Path::new(&info.item_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| info.item_name.to_lowercase());
        let prefix = format!("{}.", base);

        let mut entries = tokio::fs::read_dir(parent).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::SourceNotFound(parent.to_path_buf())
            } else {
                CaptureError::from_io(parent, e)
            }
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CaptureError::from_io(parent, e))?
        {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| CaptureError::from_io(entry.path(), e))?
                .is_file();
            if is_file && name.starts_with(&prefix) {
                files.push(entry.path());
            }
        }

        if files.is_empty() {
            return Err(CaptureError::SourceNotFound(source.to_path_buf()));
        }
        files.sort();
        Ok(files)
    }

    async fn run(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
    ) -> Result<CaptureOutcome, CaptureError> {
        let files = self.dataset_files(info, source).await?;
        tracing::debug!(dataset = %info.dataset_name, files = files.len(), "Checking stability of dataset files");

        let detector = self.ctx.detector();
        let checks: Vec<(PathBuf, Result<Stability, CaptureError>)> = stream::iter(files.clone())
            .map(|path| async move {
                let result = detector.check(&path).await;
                (path, result)
            })
            .buffer_unordered(self.ctx.config.max_parallel_checks.max(1))
            .collect()
            .await;

        let mut total_bytes = 0;
        for (path, result) in checks {
            match result? {
                Stability::Stable { bytes } => total_bytes += bytes,
                Stability::Changed { .. } => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    return Err(CaptureError::NotReady(format!("file size changed: {}", name)));
                }
            }
        }

        prepare_destination(destination, resume).await?;

        let copier = self.ctx.copier(total_bytes);
        for file in &files {
            let Some(file_name) = file.file_name() else {
                continue;
            };
            let target = destination.join(file_name);
            copy_with_retry(file, || copier.copy_file(file, &target)).await?;
        }

        tracing::info!(
            dataset = %info.dataset_name,
            files = files.len(),
            destination = %destination.display(),
            "Captured multi-file dataset"
        );
        Ok(CaptureOutcome::success(""))
    }
}

#[async_trait]
impl CaptureStrategy for MultiFileCapture {
    fn name(&self) -> &'static str {
        "MultiFileCapture"
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
