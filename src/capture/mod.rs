//! Capture engine
//!
//! A [`CaptureStrategy`] moves one dataset from an instrument share to
//! managed storage. Strategies compose the shared building blocks:
//! - [`share`] - scoped share connection ([`with_share_connection`])
//! - [`stability`] - acquisition-complete detection by size sampling
//! - [`copier`] - resumable chunked copy with the retry policy
//! - [`sanitize`] - post-copy file name clean-up
//!
//! [`StrategyRegistry`] maps step tool names to strategies. It is built once
//! at startup; there is no runtime loading.

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::logging::Observability;
use crate::types::{CaptureOutcome, DatasetInfo, EvalCode, TaskParams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod copier;
pub mod sanitize;
pub mod share;
pub mod stability;
pub mod strategies;

pub use copier::{CopyStats, ProgressSink, ResumableCopier, SkipList, copy_with_retry};
pub use share::{
    CommandShare, DefaultShareConnector, DirectShare, ShareConnection, ShareConnector,
    with_share_connection,
};
pub use stability::{Stability, StabilityDetector, compute_wait_interval};
pub use strategies::{
    AutoCapture, DirectoryCapture, DirectoryExtCapture, DirectoryNoExtCapture, MultiFileCapture,
    SingleFileCapture, SpotCapture, UnknownTypeCapture,
};

/// Step tool name that picks a strategy from the dataset's raw data type
pub const DATASET_CAPTURE_TOOL: &str = "DatasetCapture";

/// Decide whether a fault message describes an authentication or
/// authorization failure
///
/// The match is a case-insensitive substring test against "user name",
/// "password", "permission denied" and "access is denied". Message text is
/// OS and locale dependent, so this is a heuristic.
pub fn is_credential_message(message: &str) -> bool {
    const PATTERNS: [&str; 4] = [
        "user name",
        "password",
        "permission denied",
        "access is denied",
    ];
    let message = message.to_lowercase();
    PATTERNS.iter().any(|pattern| message.contains(pattern))
}

/// Instrument details a strategy needs besides the dataset itself
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentContext {
    /// Instrument name
    pub instrument_name: String,
    /// Instrument class (drives per-class skip rules)
    pub instrument_class: String,
    /// Capture method; `secfso` needs an authenticated share connection
    pub capture_method: String,
    /// Root of the instrument share
    pub share_root: PathBuf,
}

impl InstrumentContext {
    /// Build from task parameters
    pub fn from_params(params: &TaskParams) -> Self {
        Self {
            instrument_name: params.get_or("Instrument_Name", "").to_string(),
            instrument_class: params.get_or("Instrument_Class", "").to_string(),
            capture_method: params.get_or("Capture_Method", "").to_string(),
            share_root: PathBuf::from(params.get_or("Source_Vol", "")),
        }
    }

    /// True when the share needs credentials
    pub fn is_secured(&self) -> bool {
        self.capture_method.eq_ignore_ascii_case("secfso")
    }

    /// True when the instrument class starts with `prefix` (case-insensitive)
    pub fn class_starts_with(&self, prefix: &str) -> bool {
        self.instrument_class
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase())
    }
}

/// Source and destination of one capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturePaths {
    /// File or directory on the instrument share
    pub source: PathBuf,
    /// Dataset directory on managed storage
    pub destination: PathBuf,
}

impl CapturePaths {
    /// Resolve paths from task parameters
    ///
    /// Source is `Source_Vol/Source_Path/[Capture_Subdirectory/]<item>`,
    /// destination is `Storage_Vol_External/Storage_Path/Dataset`.
    pub fn from_params(params: &TaskParams, info: &DatasetInfo) -> Self {
        let mut source = PathBuf::from(params.get_or("Source_Vol", ""));
        source.push(params.get_or("Source_Path", ""));
        let subdirectory = params.get_or("Capture_Subdirectory", "").trim();
        if !subdirectory.is_empty() {
            source.push(subdirectory);
        }
        source.push(&info.item_name);

        let mut destination = PathBuf::from(params.get_or("Storage_Vol_External", ""));
        destination.push(params.get_or("Storage_Path", ""));
        destination.push(&info.dataset_name);

        Self {
            source,
            destination,
        }
    }
}

/// Shared dependencies of every strategy
pub struct CaptureContext {
    /// Capture settings
    pub config: CaptureConfig,
    /// Error ring for the status snapshot
    pub obs: Observability,
    /// Share connection factory
    pub shares: Arc<dyn ShareConnector>,
    /// Receives copy progress, usually the status writer
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl CaptureContext {
    /// Build a context with the default share connector
    pub fn new(config: CaptureConfig, obs: Observability) -> Self {
        let shares = Arc::new(DefaultShareConnector::new(config.share.clone()));
        Self {
            config,
            obs,
            shares,
            progress: None,
        }
    }

    /// Replace the share connector
    pub fn with_shares(mut self, shares: Arc<dyn ShareConnector>) -> Self {
        self.shares = shares;
        self
    }

    /// Report copy progress to `sink`
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Stability detector using the configured base interval
    pub fn detector(&self) -> StabilityDetector {
        StabilityDetector::new(self.config.stability_base_interval)
    }

    /// Copier using the configured chunk size, reporting progress
    /// against the stable size `total_bytes`
    pub fn copier(&self, total_bytes: u64) -> ResumableCopier {
        let copier = ResumableCopier::new(self.config.copy_chunk_size);
        match &self.progress {
            Some(sink) => copier.with_progress(total_bytes, sink.clone()),
            None => copier,
        }
    }
}

/// One way of capturing a dataset
///
/// Implementations must resolve every fault into exactly one
/// [`CaptureOutcome`] and must hold the share connection only inside
/// [`with_share_connection`].
#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Capture `source` into `destination`
    async fn capture(
        &self,
        info: &DatasetInfo,
        source: &Path,
        destination: &Path,
        resume: bool,
        instrument: &InstrumentContext,
    ) -> CaptureOutcome;
}

impl CaptureOutcome {
    /// Resolve a capture fault into an outcome
    pub fn from_error(err: &CaptureError) -> Self {
        match err {
            CaptureError::NotReady(message) => CaptureOutcome::not_ready(message.clone(), ""),
            CaptureError::Validation(message) => CaptureOutcome::failed_do_not_retry(message.clone()),
            CaptureError::Credential { message, .. } | CaptureError::Unauthorized { message, .. } => {
                CaptureOutcome::failed(message.clone())
                    .with_eval_message(format!("Credential error: {}", message))
            }
            CaptureError::Transient { .. } => CaptureOutcome {
                eval_code: EvalCode::NetworkErrorRetry,
                ..CaptureOutcome::failed(err.to_string())
            },
            CaptureError::SourceNotFound(path) => {
                CaptureOutcome::failed(format!("Source not found: {}", path.display()))
            }
            CaptureError::CopyTimeout { .. } | CaptureError::Io { .. } => {
                CaptureOutcome::failed(err.to_string())
            }
        }
    }
}

/// Step tool name → strategy
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn CaptureStrategy>>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry with every built-in strategy
    ///
    /// `DatasetCapture` dispatches on the raw data type; the shape-specific
    /// strategies are also available under their own names.
    pub fn with_builtin(ctx: Arc<CaptureContext>) -> Self {
        let mut registry = Self::empty();
        registry.register(DATASET_CAPTURE_TOOL, Arc::new(AutoCapture::new(ctx.clone())));
        registry.register("SingleFileCapture", Arc::new(SingleFileCapture::new(ctx.clone())));
        registry.register("MultiFileCapture", Arc::new(MultiFileCapture::new(ctx.clone())));
        registry.register("DirectoryCapture", Arc::new(DirectoryCapture::new(ctx.clone())));
        registry.register(
            "DirectoryExtCapture",
            Arc::new(DirectoryExtCapture::new(ctx.clone())),
        );
        registry.register(
            "DirectoryNoExtCapture",
            Arc::new(DirectoryNoExtCapture::new(ctx.clone())),
        );
        registry.register("SpotCapture", Arc::new(SpotCapture::new(ctx)));
        registry
    }

    /// Add or replace a strategy; names compare case-insensitively
    pub fn register(&mut self, step_tool: &str, strategy: Arc<dyn CaptureStrategy>) {
        self.strategies.insert(step_tool.to_lowercase(), strategy);
    }

    /// Resolve the strategy for a step tool
    pub fn resolve(&self, step_tool: &str) -> crate::Result<Arc<dyn CaptureStrategy>> {
        self.strategies
            .get(&step_tool.to_lowercase())
            .cloned()
            .ok_or_else(|| crate::Error::UnknownStepTool(step_tool.to_string()))
    }
}

#[cfg(test)]
mod tests;
