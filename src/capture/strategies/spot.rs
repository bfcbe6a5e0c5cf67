use crate::capture::{
    CaptureContext, CaptureStrategy, InstrumentContext, SkipList, copy_with_retry,
    with_share_connection,
};
use crate::error::CaptureError;
use crate::types::{CaptureOutcome, DatasetInfo};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

use super::{Listing, ensure_stable, prepare_destination, require_directory};

/// Spot subdirectories are named like `0_A1`, `0_P24`
const SPOT_DIRECTORY_PATTERN: &str = r"^0_[A-Z]\d+$";

/// Captures a MALDI spot acquisition (one subdirectory per spot)
pub struct SpotCapture {
    ctx: Arc<CaptureContext>,
}

impl SpotCapture {
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
        require_directory(source).await?;
        validate_spot_layout(&Listing::read(source).await?)?;

        let bytes = ensure_stable(&self.ctx.detector(), source, "directory").await?;
        prepare_destination(destination, resume).await?;

        let skip = SkipList::new();
        let copier = self.ctx.copier(bytes);
        let stats = copy_with_retry(source, || {
            copier.copy_directory(source, destination, true, &skip)
        })
        .await?;

        tracing::info!(
            dataset = %info.dataset_name,
            copied = stats.files_copied + stats.files_resumed,
            skipped = stats.files_skipped,
            "Captured spot dataset"
        );
        Ok(CaptureOutcome::success(""))
    }
}

/// Spot data must be unzipped and every subdirectory must be a spot
pub(crate) fn validate_spot_layout(listing: &Listing) -> Result<(), CaptureError> {
    if let Some(zip) = listing.files_with_extension("zip").next() {
        return Err(CaptureError::Validation(format!(
            "Spot dataset still holds zip file {}; unzip it before capture",
            zip
        )));
    }

    let pattern = Regex::new(SPOT_DIRECTORY_PATTERN)
        .map_err(|e| CaptureError::Validation(format!("invalid spot pattern: {}", e)))?;
    if let Some((name, _)) = listing.dirs.iter().find(|(name, _)| !pattern.is_match(name)) {
        return Err(CaptureError::Validation(format!(
            "Subdirectory {} does not look like a spot directory (expected e.g. 0_A1)",
            name
        )));
    }

    Ok(())
}

#[async_trait]
impl CaptureStrategy for SpotCapture {
    fn name(&self) -> &'static str {
        "SpotCapture"
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
