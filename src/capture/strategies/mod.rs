//! Built-in capture strategies, one per dataset shape

use crate::error::CaptureError;
use crate::utils::move_aside_path;
use std::path::{Path, PathBuf};

use super::stability::{Stability, StabilityDetector};

mod directory_ext;
mod directory_no_ext;
mod dispatch;
mod multi_file;
mod single_file;
mod spot;

pub use directory_ext::DirectoryExtCapture;
pub use directory_no_ext::DirectoryNoExtCapture;
pub use dispatch::{AutoCapture, DirectoryCapture, UnknownTypeCapture};
pub use multi_file::MultiFileCapture;
pub use single_file::SingleFileCapture;
pub use spot::SpotCapture;

/// Fail with a not-ready fault unless `path` is stable
///
/// `kind` names the source in the message ("file", "directory").
pub(crate) async fn ensure_stable(
    detector: &StabilityDetector,
    path: &Path,
    kind: &str,
) -> Result<u64, CaptureError> {
    match detector.check(path).await? {
        Stability::Stable { bytes } => Ok(bytes),
        Stability::Changed { .. } => Err(CaptureError::NotReady(format!("{} size changed", kind))),
    }
}

/// Create the dataset directory
///
/// Without `resume`, existing data in the directory is moved aside to
/// `x_<name>` first so the capture starts clean.
pub(crate) async fn prepare_destination(destination: &Path, resume: bool) -> Result<(), CaptureError> {
    if !resume && has_entries(destination).await? {
        let aside = move_aside_path(destination)
            .map_err(|e| CaptureError::Validation(format!("cannot move old data aside: {}", e)))?;
        tracing::warn!(
            destination = %destination.display(),
            moved_to = %aside.display(),
            "Destination already holds data; moving it aside"
        );
        tokio::fs::rename(destination, &aside)
            .await
            .map_err(|e| CaptureError::from_io(destination, e))?;
    }

    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|e| CaptureError::from_io(destination, e))
}

async fn has_entries(directory: &Path) -> Result<bool, CaptureError> {
    match tokio::fs::read_dir(directory).await {
        Ok(mut entries) => Ok(entries
            .next_entry()
            .await
            .map_err(|e| CaptureError::from_io(directory, e))?
            .is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CaptureError::from_io(directory, e)),
    }
}

/// Require `source` to be a directory
pub(crate) async fn require_directory(source: &Path) -> Result<(), CaptureError> {
    let meta = tokio::fs::metadata(source).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CaptureError::SourceNotFound(source.to_path_buf())
        } else {
            CaptureError::from_io(source, e)
        }
    })?;
    if !meta.is_dir() {
        return Err(CaptureError::Validation(format!(
            "Expected a directory but found a file: {}",
            source.display()
        )));
    }
    Ok(())
}

/// Top-level listing of a directory
#[derive(Debug, Default)]
pub(crate) struct Listing {
    /// (name, length) of each file
    pub files: Vec<(String, u64)>,
    /// (name, path) of each subdirectory
    pub dirs: Vec<(String, PathBuf)>,
}

impl Listing {
    pub async fn read(directory: &Path) -> Result<Self, CaptureError> {
        let mut listing = Listing::default();
        let mut entries = tokio::fs::read_dir(directory)
            .await
            .map_err(|e| CaptureError::from_io(directory, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CaptureError::from_io(directory, e))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry
                .metadata()
                .await
                .map_err(|e| CaptureError::from_io(&path, e))?;
            if meta.is_dir() {
                listing.dirs.push((name, path));
            } else {
                listing.files.push((name, meta.len()));
            }
        }
        Ok(listing)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.iter().any(|(f, _)| f.eq_ignore_ascii_case(name))
    }

    pub fn has_dir(&self, name: &str) -> bool {
        self.dirs.iter().any(|(d, _)| d.eq_ignore_ascii_case(name))
    }

    pub fn dir_path(&self, name: &str) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|(d, _)| d.eq_ignore_ascii_case(name))
            .map(|(_, path)| path.as_path())
    }

    pub fn files_with_extension(&self, extension: &str) -> impl Iterator<Item = &str> {
        let extension = extension.trim_start_matches('.').to_lowercase();
        self.files.iter().filter_map(move |(name, _)| {
            (lower_extension(name).as_deref() == Some(extension.as_str())).then_some(name.as_str())
        })
    }
}

/// Lowercased extension of a name
pub(crate) fn lower_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
}
