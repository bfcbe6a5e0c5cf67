//! Post-copy file name clean-up
//!
//! Stored file names may not contain spaces, `%`, or an extra `.` before the
//! extension. Offending names are rewritten with the configured replacement
//! character. When the rewritten stem equals the dataset name (ignoring
//! case) the dataset's exact spelling is used. A rename that would collide
//! with an existing file is skipped.

use crate::error::CaptureError;
use std::path::{Path, PathBuf};

/// One rename decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SanitizeAction {
    /// Name already acceptable
    Keep,
    /// Rename to the given file name
    Rename(String),
}

fn has_illegal_chars(stem: &str) -> bool {
    stem.contains(' ') || stem.contains('%') || stem.contains('.')
}

/// Canonical name for `file_name`
pub fn sanitized_name(file_name: &str, dataset_name: &str, replacement: &str) -> SanitizeAction {
    let path = Path::new(file_name);
    let (stem, extension) = match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
    ) {
        (Some(stem), Some(ext)) => (stem, Some(ext)),
        (Some(stem), None) => (stem, None),
        _ => return SanitizeAction::Keep,
    };

    if !has_illegal_chars(stem) {
        return SanitizeAction::Keep;
    }

    let cleaned: String = stem
        .chars()
        .map(|c| match c {
            ' ' | '%' | '.' => replacement.to_string(),
            other => other.to_string(),
        })
        .collect();
    let stem = if cleaned.eq_ignore_ascii_case(dataset_name) {
        dataset_name.to_string()
    } else {
        cleaned
    };

    let renamed = match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    };
    if renamed == file_name {
        SanitizeAction::Keep
    } else {
        SanitizeAction::Rename(renamed)
    }
}

/// Apply [`sanitized_name`] to the files directly inside `directory`
///
/// Returns the renames performed as (old, new) paths.
pub async fn sanitize_directory(
    directory: &Path,
    dataset_name: &str,
    replacement: &str,
) -> Result<Vec<(PathBuf, PathBuf)>, CaptureError> {
    let mut renamed = Vec::new();
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .map_err(|e| CaptureError::from_io(directory, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CaptureError::from_io(directory, e))?
    {
        let is_file = entry
            .file_type()
            .await
            .map_err(|e| CaptureError::from_io(entry.path(), e))?
            .is_file();
        if !is_file {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let SanitizeAction::Rename(target_name) = sanitized_name(&name, dataset_name, replacement)
        else {
            continue;
        };

        let from = entry.path();
        let to = directory.join(&target_name);
        if tokio::fs::try_exists(&to).await.unwrap_or(true) {
            tracing::warn!(
                file = %from.display(),
                target = %to.display(),
                "Not renaming file; target name already exists"
            );
            continue;
        }

        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| CaptureError::from_io(&from, e))?;
        tracing::info!(from = %name, to = %target_name, "Renamed file to a storage-safe name");
        renamed.push((from, to));
    }

    Ok(renamed)
}
