//! Crash recovery through the working-directory flag file
//!
//! The controller writes [`FLAG_FILE_NAME`] before running a task and
//! removes it after the task is closed. A flag file found at loop start
//! means a previous run died mid-task and left the working directory in an
//! unknown state. Depending on the cleanup mode the directory is emptied
//! automatically or the manager refuses to request work.

use crate::config::CleanupMode;
use crate::error::Result;
use crate::housekeeping::MOST_RECENT_JOB_FILE;
use crate::store::{ManagerSettingsSource, RemoteSettings};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the flag file in the working directory
pub const FLAG_FILE_NAME: &str = "flagFile.txt";

/// Path of the flag file for `working_dir`
pub fn flag_file_path(working_dir: &Path) -> PathBuf {
    working_dir.join(FLAG_FILE_NAME)
}

/// True when a flag file exists in `working_dir`
pub async fn flag_file_exists(working_dir: &Path) -> bool {
    tokio::fs::try_exists(flag_file_path(working_dir))
        .await
        .unwrap_or(false)
}

/// Create (or refresh) the flag file
pub async fn create_flag_file(working_dir: &Path) -> Result<()> {
    let content = format!("{}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    tokio::fs::write(flag_file_path(working_dir), content).await?;
    debug!(working_dir = %working_dir.display(), "Created flag file");
    Ok(())
}

/// Remove the flag file; a missing file is not an error
pub async fn delete_flag_file(working_dir: &Path) -> Result<()> {
    match tokio::fs::remove_file(flag_file_path(working_dir)).await {
        Ok(()) => {
            debug!(working_dir = %working_dir.display(), "Removed flag file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Counts from one working directory cleanup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files deleted
    pub files_deleted: usize,
    /// Directories deleted
    pub dirs_deleted: usize,
    /// Entries that could not be deleted
    pub failures: usize,
}

impl CleanupReport {
    /// True when everything was deleted
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// Delete everything in the working directory
///
/// The most-recent-job marker is kept. The flag file is deleted last and
/// only when everything else went away, so a partial cleanup still blocks
/// new work.
pub async fn clean_working_dir(working_dir: &Path) -> Result<CleanupReport> {
    use tokio::fs;

    let flag_file = flag_file_path(working_dir);
    let marker = working_dir.join(MOST_RECENT_JOB_FILE);
    let mut report = CleanupReport::default();
    let mut entries = fs::read_dir(working_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == flag_file || path == marker {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) if is_dir => report.dirs_deleted += 1,
            Ok(()) => report.files_deleted += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not delete working directory entry");
                report.failures += 1;
            }
        }
    }

    if report.is_clean() {
        delete_flag_file(working_dir).await?;
    }

    info!(
        working_dir = %working_dir.display(),
        files = report.files_deleted,
        dirs = report.dirs_deleted,
        failures = report.failures,
        "Working directory cleanup finished"
    );
    Ok(report)
}

/// Try to clear a flag file left by a crashed run
///
/// Returns true when the working directory is clean and work may be
/// requested. With [`CleanupMode::CleanupOnce`] the remote setting is reset
/// to disabled after a successful cleanup.
pub async fn attempt_auto_cleanup(
    working_dir: &Path,
    mode: CleanupMode,
    settings: &dyn ManagerSettingsSource,
    manager: &str,
) -> bool {
    match mode {
        CleanupMode::Disabled => {
            warn!(
                working_dir = %working_dir.display(),
                "Flag file present and automatic cleanup is disabled"
            );
            return false;
        }
        CleanupMode::CleanupOnce | CleanupMode::CleanupAlways => {}
    }

    let report = match clean_working_dir(working_dir).await {
        Ok(report) => report,
        Err(e) => {
            warn!(working_dir = %working_dir.display(), error = %e, "Working directory cleanup failed");
            return false;
        }
    };
    if !report.is_clean() {
        return false;
    }

    if mode == CleanupMode::CleanupOnce
        && let Err(e) = settings
            .set_setting(
                manager,
                RemoteSettings::CLEANUP_MODE,
                CleanupMode::Disabled.as_setting(),
            )
            .await
    {
        warn!(error = %e, "Could not reset the cleanup mode after a one-time cleanup");
    }

    true
}
