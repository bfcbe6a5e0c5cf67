//! Periodic chores around the main loop
//!
//! - working directory fallback
//! - the monthly maintenance blackout
//! - scratch directory purges
//! - the most-recent-job marker

use crate::config::HousekeepingConfig;
use crate::error::Result;
use crate::types::RecentJob;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Marker file holding a summary of the last finished job
pub const MOST_RECENT_JOB_FILE: &str = "most_recent_job.txt";

/// Blackout ends at this local hour
const BLACKOUT_END_HOUR: u32 = 6;

/// First existing directory among `primary` and then `fallbacks`, in order
pub async fn resolve_working_dir(primary: &Path, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    for candidate in std::iter::once(primary).chain(fallbacks.iter().map(PathBuf::as_path)) {
        if tokio::fs::metadata(candidate)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Some(candidate.to_path_buf());
        }
    }
    None
}

/// Sunday after the second Tuesday of the month
pub fn maintenance_sunday(year: i32, month: u32) -> Option<NaiveDate> {
    let second_tuesday = NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Tue, 2)?;
    second_tuesday.checked_add_signed(ChronoDuration::days(5))
}

/// True between 00:00 and 06:00 on the maintenance Sunday
///
/// Hosts are patched in that window, so no task is started.
pub fn is_maintenance_blackout(now: NaiveDateTime) -> bool {
    maintenance_sunday(now.year(), now.month())
        .is_some_and(|sunday| now.date() == sunday && now.hour() < BLACKOUT_END_HOUR)
}

/// Counts from one scratch purge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Files deleted
    pub deleted: usize,
    /// Files that were old enough but could not be deleted
    pub failed: usize,
}

/// Delete files directly inside `dir` that are older than `max_age`
///
/// Individual failures are counted and otherwise ignored.
pub async fn purge_scratch(dir: &Path, max_age: Duration) -> PurgeReport {
    let mut report = PurgeReport::default();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return report;
    };
    let now = SystemTime::now();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let old_enough = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= max_age);
        if !old_enough {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                tracing::debug!(file = %entry.path().display(), error = %e, "Could not purge scratch file");
                report.failed += 1;
            }
        }
    }

    if report.deleted > 0 || report.failed > 0 {
        tracing::info!(
            dir = %dir.display(),
            deleted = report.deleted,
            failed = report.failed,
            "Purged old scratch files"
        );
    }
    report
}

/// Decides when the scratch directory is purged
///
/// A purge runs after every `purge_every_tasks` tasks, and once a day during
/// the `daily_purge_hour` local hour.
#[derive(Debug)]
pub struct TempPurger {
    config: HousekeepingConfig,
    tasks_since_purge: u32,
    last_daily_purge: Option<NaiveDate>,
}

impl TempPurger {
    /// Purger using `config`
    pub fn new(config: HousekeepingConfig) -> Self {
        Self {
            config,
            tasks_since_purge: 0,
            last_daily_purge: None,
        }
    }

    /// Count one finished task
    pub fn note_task(&mut self) {
        self.tasks_since_purge = self.tasks_since_purge.saturating_add(1);
    }

    /// True when a purge should run at `now`
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        let by_count =
            self.config.purge_every_tasks > 0 && self.tasks_since_purge >= self.config.purge_every_tasks;
        let daily = now.hour() == self.config.daily_purge_hour
            && self.last_daily_purge != Some(now.date());
        by_count || daily
    }

    /// Purge when due
    pub async fn purge_if_due(&mut self, now: NaiveDateTime) -> Option<PurgeReport> {
        if !self.is_due(now) {
            return None;
        }
        let report = purge_scratch(&self.config.scratch_dir, self.config.temp_file_max_age).await;
        self.tasks_since_purge = 0;
        if now.hour() == self.config.daily_purge_hour {
            self.last_daily_purge = Some(now.date());
        }
        Some(report)
    }
}

/// Load the most-recent-job text, if any
pub async fn load_most_recent_job(working_dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(working_dir.join(MOST_RECENT_JOB_FILE))
        .await
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Rewrite the most-recent-job marker
pub async fn save_most_recent_job(working_dir: &Path, job: &RecentJob) -> Result<()> {
    tokio::fs::write(working_dir.join(MOST_RECENT_JOB_FILE), format!("{}\n", job)).await?;
    Ok(())
}
