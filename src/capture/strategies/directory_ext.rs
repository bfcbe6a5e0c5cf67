use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, SkipList, copy_with_retry,
    with_share_connection,
};
use crate::error::CaptureError;
use crate::types::{CaptureOutcome, DatasetInfo};
use crate::utils::name_similarity;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Listing, ensure_stable, lower_extension, prepare_destination, require_directory};

/// Nested directories at least this similar to the dataset item are copied instead
pub const NESTED_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Data files of which an `AcqData` directory must hold at least one
const ACQ_DATA_FILES: [&str; 3] = ["MSScan.bin", "MSPeak.bin", "MSProfile.bin"];

/// Captures a directory whose name carries an extension (e.g. `X.d`)
pub struct DirectoryExtCapture {
    ctx: Arc<CaptureContext>,
}

impl DirectoryExtCapture {
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
        let Some(extension) = lower_extension(&info.item_name) else {
            return Err(CaptureError::Validation(format!(
                "Directory name has no extension: {}",
                info.item_name
            )));
        };
        require_directory(source).await?;

        let copy_root = resolve_nested(source, &info.item_name, &extension).await?;
        validate_vendor_layout(&copy_root).await?;
        let bytes = ensure_stable(&self.ctx.detector(), &copy_root, "directory").await?;

        prepare_destination(destination, resume).await?;

        let target = destination.join(&info.item_name);
        let skip = SkipList::new().names(&self.ctx.config.locked_file_names);
        let copier = self.ctx.copier(bytes);
        let stats = copy_with_retry(&copy_root, || {
            copier.copy_directory(&copy_root, &target, true, &skip)
        })
        .await?;

        tracing::info!(
            dataset = %info.dataset_name,
            copied = stats.files_copied + stats.files_resumed,
            skipped = stats.files_skipped,
            destination = %target.display(),
            "Captured directory dataset"
        );
        Ok(CaptureOutcome::success(""))
    }
}

/// Pick the directory to copy
///
/// Some acquisition software writes `X.d/X.d/...`. When the named directory
/// holds no files and exactly one subdirectory with the same extension whose
/// name is similar enough, that subdirectory is copied instead.
pub(crate) async fn resolve_nested(
    source: &Path,
    item_name: &str,
    extension: &str,
) -> Result<PathBuf, CaptureError> {
    let listing = Listing::read(source).await?;
    if !listing.files.is_empty() {
        return Ok(source.to_path_buf());
    }

    let nested: Vec<&(String, PathBuf)> = listing
        .dirs
        .iter()
        .filter(|(name, _)| lower_extension(name).as_deref() == Some(extension))
        .collect();
    let [(nested_name, nested_path)] = nested.as_slice() else {
        return Ok(source.to_path_buf());
    };

    let similarity = name_similarity(nested_name, item_name);
    if similarity < NESTED_SIMILARITY_THRESHOLD {
        return Ok(source.to_path_buf());
    }

    tracing::warn!(
        source = %source.display(),
        nested = %nested_name,
        similarity,
        "Dataset directory only holds a nested directory of the same type; copying that instead"
    );
    Ok(nested_path.clone())
}

/// Reject directories whose vendor markers show an incomplete acquisition
pub(crate) async fn validate_vendor_layout(directory: &Path) -> Result<(), CaptureError> {
    let listing = Listing::read(directory).await?;

    if let Some((name, _)) = listing
        .files
        .iter()
        .find(|(name, len)| *len == 0 && name.to_lowercase().ends_with("_idx"))
    {
        return Err(CaptureError::Validation(format!(
            "Acquisition incomplete: index file {} is empty",
            name
        )));
    }

    if listing.has_file("analysis.tdf-journal") {
        return Err(CaptureError::Validation(
            "Acquisition incomplete: analysis.tdf-journal file present".to_string(),
        ));
    }

    if listing.has_file("analysis.tdf") && !listing.has_file("analysis.tdf_bin") {
        return Err(CaptureError::Validation(
            "Acquisition incomplete: analysis.tdf_bin file missing".to_string(),
        ));
    }

    if let Some(acq_data) = listing.dir_path("AcqData") {
        let acq_listing = Listing::read(acq_data).await?;
        if !ACQ_DATA_FILES.iter().any(|name| acq_listing.has_file(name)) {
            return Err(CaptureError::Validation(format!(
                "Acquisition incomplete: AcqData has none of {}",
                ACQ_DATA_FILES.join(", ")
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl CaptureStrategy for DirectoryExtCapture {
    fn name(&self) -> &'static str {
        "DirectoryExtCapture"
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
