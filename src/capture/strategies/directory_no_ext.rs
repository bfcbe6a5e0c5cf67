use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, SkipList, copy_with_retry,
    with_share_connection,
};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::types::{CaptureOutcome, DatasetInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{Listing, ensure_stable, lower_extension, prepare_destination, require_directory};

/// Captures a directory without an extension; its contents go straight
/// into the dataset directory
pub struct DirectoryNoExtCapture {
    ctx: Arc<CaptureContext>,
}

impl DirectoryNoExtCapture {
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
        instrument: &InstrumentContext,
    ) -> Result<CaptureOutcome, CaptureError> {
        require_directory(source).await?;

        let listing = Listing::read(source).await?;
        validate_subdirectories(&listing).await?;
        let skip = skip_list(&self.ctx.config, instrument, &listing);

        let bytes = ensure_stable(&self.ctx.detector(), source, "directory").await?;
        prepare_destination(destination, resume).await?;

        let copier = self.ctx.copier(bytes);
        let stats = copy_with_retry(source, || {
            copier.copy_directory(source, destination, true, &skip)
        })
        .await?;

        tracing::info!(
            dataset = %info.dataset_name,
            copied = stats.files_copied + stats.files_resumed,
            skipped = stats.files_skipped,
            excluded = stats.files_excluded,
            destination = %destination.display(),
            "Captured directory dataset"
        );
        Ok(CaptureOutcome::success(""))
    }
}

/// Reject layouts that cannot be captured as a plain directory
///
/// - more than one subdirectory with the same extension, except the paired
///   Bruker layout where one holds `ser` and the other `analysis.baf`
/// - a `0.ser` subdirectory (superseded single-scan layout)
/// - `.imf` files (superseded IMS layout)
pub(crate) async fn validate_subdirectories(listing: &Listing) -> Result<(), CaptureError> {
    if listing.has_dir("0.ser") {
        return Err(CaptureError::Validation(
            "Dataset directory has a 0.ser subdirectory; this layout is no longer supported"
                .to_string(),
        ));
    }

    if let Some(imf) = listing.files_with_extension("imf").next() {
        return Err(CaptureError::Validation(format!(
            "Dataset directory has IMF file {}; this layout is no longer supported",
            imf
        )));
    }

    let mut by_extension: HashMap<String, Vec<&Path>> = HashMap::new();
    for (name, path) in &listing.dirs {
        if let Some(extension) = lower_extension(name) {
            by_extension.entry(extension).or_default().push(path.as_path());
        }
    }

    for (extension, dirs) in by_extension {
        if dirs.len() < 2 {
            continue;
        }
        if dirs.len() == 2 && is_ser_baf_pair(dirs[0], dirs[1]).await? {
            tracing::debug!(extension = %extension, "Allowing paired ser/analysis.baf subdirectories");
            continue;
        }
        return Err(CaptureError::Validation(format!(
            "Dataset directory has {} subdirectories with extension .{}",
            dirs.len(),
            extension
        )));
    }

    Ok(())
}

async fn is_ser_baf_pair(a: &Path, b: &Path) -> Result<bool, CaptureError> {
    let a = Listing::read(a).await?;
    let b = Listing::read(b).await?;
    let holds_ser = |l: &Listing| l.has_file("ser");
    let holds_baf = |l: &Listing| l.has_file("analysis.baf");
    Ok((holds_ser(&a) && holds_baf(&b)) || (holds_baf(&a) && holds_ser(&b)))
}

/// Files left behind for this instrument
pub(crate) fn skip_list(
    config: &CaptureConfig,
    instrument: &InstrumentContext,
    listing: &Listing,
) -> SkipList {
    let mut skip = SkipList::new().names(&config.locked_file_names);

    for rule in &config.empty_file_rules {
        if instrument.class_starts_with(&rule.instrument_class_prefix) {
            skip = skip.empty_name(&rule.file_name);
        }
    }

    for rule in &config.embedded_file_rules {
        if instrument.class_starts_with(&rule.instrument_class_prefix)
            && listing
                .files_with_extension(&rule.container_extension)
                .next()
                .is_some()
        {
            tracing::debug!(
                skip_extension = %rule.skip_extension,
                container = %rule.container_extension,
                "Skipping raw files already embedded in a container"
            );
            skip = skip.extension(&rule.skip_extension);
        }
    }

    skip
}

#[async_trait]
impl CaptureStrategy for DirectoryNoExtCapture {
    fn name(&self) -> &'static str {
        "DirectoryNoExtCapture"
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
        with_share_connection(
            share.as_ref(),
            source,
            self.run(info, source, destination, resume, instrument),
        )
        .await
    }
}
