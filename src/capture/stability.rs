//! Acquisition-complete detection
//!
//! A source is considered finished when its total size is unchanged across
//! a wait interval. Old data needs a shorter wait than data that was touched
//! recently, so the interval shrinks with the age of the newest item.

use crate::error::CaptureError;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Below this age the base interval is used
pub const MIN_AGE: Duration = Duration::from_secs(10 * 24 * 3600);

/// Above this age the minimum interval is used
pub const MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Wait used for data older than [`MAX_AGE`]
pub const MIN_INTERVAL: Duration = Duration::from_secs(3);

/// Lower clamp of the final interval
pub const INTERVAL_FLOOR: Duration = Duration::from_secs(1);

/// Upper clamp of the final interval
pub const INTERVAL_CEILING: Duration = Duration::from_secs(900);

/// Progress is logged at this period while waiting
const PROGRESS_PERIOD: Duration = Duration::from_secs(5);

/// Wait interval for data whose newest item is `age` old
///
/// Non-increasing in `age`; always within `[1 s, 900 s]`.
pub fn compute_wait_interval(age: Duration, base: Duration) -> Duration {
    let minimum = MIN_INTERVAL.min(base);
    let interval = if age <= MIN_AGE {
        base
    } else if age >= MAX_AGE {
        minimum
    } else {
        let fraction = (age - MIN_AGE).as_secs_f64() / (MAX_AGE - MIN_AGE).as_secs_f64();
        let secs = base.as_secs_f64() - (base.as_secs_f64() - minimum.as_secs_f64()) * fraction;
        Duration::from_secs_f64(secs)
    };
    interval.clamp(INTERVAL_FLOOR, INTERVAL_CEILING)
}

/// Total size and newest modification time under a path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeSample {
    /// Sum of file lengths in bytes
    pub total_bytes: u64,
    /// Number of files seen
    pub file_count: u64,
    /// Most recent modification time of any item
    pub newest_modified: Option<SystemTime>,
}

/// Result of a stability check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stability {
    /// Size unchanged across the wait
    Stable {
        /// Size in bytes
        bytes: u64,
    },
    /// Size changed; the source is still being written
    Changed {
        /// First sample
        before: u64,
        /// Second sample
        after: u64,
    },
}

impl Stability {
    /// True when the samples matched
    pub fn is_stable(&self) -> bool {
        matches!(self, Stability::Stable { .. })
    }
}

/// Sample the size of a file, or the recursive size of a directory
pub async fn sample_size(path: &Path) -> Result<SizeSample, CaptureError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| not_found_or(path, e))?;

    if metadata.is_file() {
        return Ok(SizeSample {
            total_bytes: metadata.len(),
            file_count: 1,
            newest_modified: metadata.modified().ok(),
        });
    }

    let mut sample = SizeSample {
        total_bytes: 0,
        file_count: 0,
        newest_modified: metadata.modified().ok(),
    };
    let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CaptureError::from_io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CaptureError::from_io(&dir, e))?
        {
            let entry_path = entry.path();
            let meta = entry
                .metadata()
                .await
                .map_err(|e| CaptureError::from_io(&entry_path, e))?;
            if let Ok(modified) = meta.modified() {
                sample.newest_modified = Some(match sample.newest_modified {
                    Some(newest) if newest >= modified => newest,
                    _ => modified,
                });
            }
            if meta.is_dir() {
                pending.push(entry_path);
            } else {
                sample.total_bytes += meta.len();
                sample.file_count += 1;
            }
        }
    }

    Ok(sample)
}

fn not_found_or(path: &Path, err: std::io::Error) -> CaptureError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CaptureError::SourceNotFound(path.to_path_buf())
    } else {
        CaptureError::from_io(path, err)
    }
}

/// Two-sample stability check
#[derive(Clone, Copy, Debug)]
pub struct StabilityDetector {
    base_interval: Duration,
}

impl StabilityDetector {
    /// Detector with the configured base interval
    pub fn new(base_interval: Duration) -> Self {
        Self { base_interval }
    }

    /// Sample, wait, sample again
    ///
    /// Errors are I/O faults only; a credential error is reported only when
    /// the fault text matches the credential pattern.
    pub async fn check(&self, path: &Path) -> Result<Stability, CaptureError> {
        let first = sample_size(path).await?;

        let age = first
            .newest_modified
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        let interval = compute_wait_interval(age, self.base_interval);

        tracing::debug!(
            path = %path.display(),
            bytes = first.total_bytes,
            files = first.file_count,
            age_hours = age.as_secs() / 3600,
            wait_secs = interval.as_secs_f64(),
            "Waiting to confirm source is stable"
        );
        wait_with_progress(path, interval).await;

        let second = sample_size(path).await?;
        if first.total_bytes == second.total_bytes {
            Ok(Stability::Stable {
                bytes: second.total_bytes,
            })
        } else {
            tracing::info!(
                path = %path.display(),
                before = first.total_bytes,
                after = second.total_bytes,
                "Source size changed while waiting"
            );
            Ok(Stability::Changed {
                before: first.total_bytes,
                after: second.total_bytes,
            })
        }
    }
}

async fn wait_with_progress(path: &Path, interval: Duration) {
    let mut remaining = interval;
    while !remaining.is_zero() {
        let step = remaining.min(PROGRESS_PERIOD);
        tokio::time::sleep(step).await;
        remaining -= step;
        if !remaining.is_zero() {
            tracing::trace!(
                path = %path.display(),
                remaining_secs = remaining.as_secs(),
                "Still waiting for stability"
            );
        }
    }
}
