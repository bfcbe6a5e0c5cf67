//! Resumable chunked copy
//!
//! Files are written to `<name>.#FilePart#` and renamed into place once
//! complete. A later attempt resumes a part file from its current length,
//! and skips destination files whose length and modification time already
//! match the source.

use crate::error::CaptureError;
use crate::retry::{COPY_RETRY_CEILING, CopyRetryDecision, copy_retry_decision};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use super::is_credential_message;

/// Suffix of partially copied files
pub const PART_SUFFIX: &str = ".#FilePart#";

/// Modification times closer than this are treated as equal
const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Counters for one copy call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Files copied from scratch
    pub files_copied: u64,
    /// Files already present and identical
    pub files_skipped: u64,
    /// Files finished from a part file
    pub files_resumed: u64,
    /// Files left out by the skip list
    pub files_excluded: u64,
    /// Bytes written
    pub bytes_copied: u64,
}

impl CopyStats {
    fn merge(&mut self, other: CopyStats) {
        self.files_copied += other.files_copied;
        self.files_skipped += other.files_skipped;
        self.files_resumed += other.files_resumed;
        self.files_excluded += other.files_excluded;
        self.bytes_copied += other.bytes_copied;
    }
}

/// File names left out of a directory copy
///
/// Matching is by file name only (never by path), case-insensitive, at
/// every directory level.
#[derive(Clone, Debug, Default)]
pub struct SkipList {
    names: HashSet<String>,
    empty_names: HashSet<String>,
    extensions: HashSet<String>,
}

impl SkipList {
    /// Empty skip list
    pub fn new() -> Self {
        Self::default()
    }

    /// Always skip files with this name
    pub fn name(mut self, name: &str) -> Self {
        self.names.insert(name.to_lowercase());
        self
    }

    /// Always skip every name in `names`
    pub fn names<'a>(mut self, names: impl IntoIterator<Item = &'a String>) -> Self {
        self.names
            .extend(names.into_iter().map(|name| name.to_lowercase()));
        self
    }

    /// Skip files with this name when they are empty
    pub fn empty_name(mut self, name: &str) -> Self {
        self.empty_names.insert(name.to_lowercase());
        self
    }

    /// Skip files with this extension (without the dot)
    pub fn extension(mut self, extension: &str) -> Self {
        self.extensions
            .insert(extension.trim_start_matches('.').to_lowercase());
        self
    }

    /// True when nothing is skipped
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.empty_names.is_empty() && self.extensions.is_empty()
    }

    /// Decide whether a file is skipped
    pub fn skips(&self, file_name: &str, len: u64) -> bool {
        let lower = file_name.to_lowercase();
        if self.names.contains(&lower) {
            return true;
        }
        if len == 0 && self.empty_names.contains(&lower) {
            return true;
        }
        Path::new(&lower)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(ext))
    }
}

/// Classify an I/O fault raised while copying
///
/// Permission faults are never retried; everything else counts as a
/// transient transfer fault.
pub fn classify_copy_fault(path: &Path, err: std::io::Error) -> CaptureError {
    let message = err.to_string();
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        return CaptureError::Unauthorized {
            path: path.to_path_buf(),
            message,
        };
    }
    if is_credential_message(&message) {
        return CaptureError::Credential {
            path: path.to_path_buf(),
            message,
        };
    }
    CaptureError::Transient {
        path: path.to_path_buf(),
        message,
    }
}

/// Receives copy completion in percent
pub trait ProgressSink: Send + Sync {
    /// Called whenever the whole-percent value changes
    fn report(&self, percent: f32);
}

/// Bytes accounted for against the stable size of the item being copied
struct CopyProgress {
    total: u64,
    done: AtomicU64,
    last_percent: AtomicU32,
    sink: Arc<dyn ProgressSink>,
}

impl CopyProgress {
    fn advance(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let done = self.done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let percent = if self.total == 0 {
            100
        } else {
            (done.saturating_mul(100) / self.total).min(100) as u32
        };
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            self.sink.report(percent as f32);
        }
    }

    fn restart(&self) {
        self.done.store(0, Ordering::Relaxed);
        self.last_percent.store(0, Ordering::Relaxed);
    }
}

/// Chunked, resumable copier
#[derive(Clone)]
pub struct ResumableCopier {
    chunk_size: usize,
    progress: Option<Arc<CopyProgress>>,
}

impl ResumableCopier {
    /// Copier writing `chunk_size` bytes per write
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            progress: None,
        }
    }

    /// Report progress to `sink` against `total_bytes`
    ///
    /// Skipped and resumed bytes count as done.
    pub fn with_progress(mut self, total_bytes: u64, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(Arc::new(CopyProgress {
            total: total_bytes,
            done: AtomicU64::new(0),
            last_percent: AtomicU32::new(0),
            sink,
        }));
        self
    }

    fn advance(&self, bytes: u64) {
        if let Some(progress) = &self.progress {
            progress.advance(bytes);
        }
    }

    /// Copy one file to `destination` (the full target file path)
    pub async fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<CopyStats, CaptureError> {
        let mut stats = CopyStats::default();

        let source_meta = tokio::fs::metadata(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::SourceNotFound(source.to_path_buf())
            } else {
                classify_copy_fault(source, e)
            }
        })?;
        let source_len = source_meta.len();
        let source_modified = source_meta.modified().ok();

        if let Ok(existing) = tokio::fs::metadata(destination).await
            && existing.len() == source_len
            && times_match(existing.modified().ok(), source_modified)
        {
            stats.files_skipped = 1;
            self.advance(source_len);
            return Ok(stats);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_copy_fault(parent, e))?;
        }

        let part_path = part_path(destination);
        let mut offset = match tokio::fs::metadata(&part_path).await {
            Ok(meta) if meta.len() <= source_len => meta.len(),
            _ => 0,
        };

        let mut part = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part_path)
            .await
            .map_err(|e| classify_copy_fault(&part_path, e))?;
        if offset > 0 {
            tracing::debug!(file = %source.display(), offset, "Resuming partial copy");
            stats.files_resumed = 1;
            self.advance(offset);
        } else {
            part.set_len(0)
                .await
                .map_err(|e| classify_copy_fault(&part_path, e))?;
        }
        part.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| classify_copy_fault(&part_path, e))?;

        let mut input = tokio::fs::File::open(source)
            .await
            .map_err(|e| classify_copy_fault(source, e))?;
        input
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| classify_copy_fault(source, e))?;

        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = input
                .read(&mut buffer)
                .await
                .map_err(|e| classify_copy_fault(source, e))?;
            if read == 0 {
                break;
            }
            part.write_all(&buffer[..read])
                .await
                .map_err(|e| classify_copy_fault(&part_path, e))?;
            offset += read as u64;
            stats.bytes_copied += read as u64;
            self.advance(read as u64);
        }

        part.flush()
            .await
            .map_err(|e| classify_copy_fault(&part_path, e))?;
        part.sync_all()
            .await
            .map_err(|e| classify_copy_fault(&part_path, e))?;
        let part = part.into_std().await;
        if let Some(modified) = source_modified
            && let Err(e) = part.set_modified(modified)
        {
            tracing::debug!(file = %part_path.display(), error = %e, "Could not preserve modification time");
        }
        drop(part);

        tokio::fs::rename(&part_path, destination)
            .await
            .map_err(|e| classify_copy_fault(destination, e))?;

        if stats.files_resumed == 0 {
            stats.files_copied = 1;
        }
        tracing::trace!(file = %destination.display(), bytes = offset, "File copied");
        Ok(stats)
    }

    /// Copy the contents of `source` into `destination`
    ///
    /// With `recursive` false only the top-level files are copied.
    pub async fn copy_directory(
        &self,
        source: &Path,
        destination: &Path,
        recursive: bool,
        skip: &SkipList,
    ) -> Result<CopyStats, CaptureError> {
        // A retried call walks the whole tree again
        if let Some(progress) = &self.progress {
            progress.restart();
        }
        let mut stats = CopyStats::default();
        let mut pending: Vec<(PathBuf, PathBuf)> =
            vec![(source.to_path_buf(), destination.to_path_buf())];

        while let Some((from_dir, to_dir)) = pending.pop() {
            tokio::fs::create_dir_all(&to_dir)
                .await
                .map_err(|e| classify_copy_fault(&to_dir, e))?;

            let mut entries = tokio::fs::read_dir(&from_dir).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CaptureError::SourceNotFound(from_dir.clone())
                } else {
                    classify_copy_fault(&from_dir, e)
                }
            })?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| classify_copy_fault(&from_dir, e))?
            {
                let from = entry.path();
                let name = entry.file_name();
                let to = to_dir.join(&name);
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| classify_copy_fault(&from, e))?;

                if meta.is_dir() {
                    if recursive {
                        pending.push((from, to));
                    }
                    continue;
                }

                if skip.skips(&name.to_string_lossy(), meta.len()) {
                    tracing::debug!(file = %from.display(), "Skipping file on skip list");
                    stats.files_excluded += 1;
                    self.advance(meta.len());
                    continue;
                }

                stats.merge(self.copy_file(&from, &to).await?);
            }
        }

        tracing::info!(
            source = %source.display(),
            destination = %destination.display(),
            copied = stats.files_copied,
            skipped = stats.files_skipped,
            resumed = stats.files_resumed,
            excluded = stats.files_excluded,
            bytes = stats.bytes_copied,
            "Directory copy complete"
        );
        Ok(stats)
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn times_match(a: Option<SystemTime>, b: Option<SystemTime>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let diff = a.duration_since(b).or_else(|_| b.duration_since(a));
            diff.is_ok_and(|diff| diff <= MTIME_TOLERANCE)
        }
        _ => false,
    }
}

/// Run a copy, retrying it per [`copy_retry_decision`]
///
/// Every attempt runs under the remaining share of the six hour ceiling;
/// running past it fails with [`CaptureError::CopyTimeout`].
pub async fn copy_with_retry<F, Fut>(path: &Path, mut operation: F) -> Result<CopyStats, CaptureError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CopyStats, CaptureError>>,
{
    let started = Instant::now();
    let mut retries = 0;

    loop {
        let attempt_started = Instant::now();
        let remaining = COPY_RETRY_CEILING.saturating_sub(started.elapsed());
        let attempt = match tokio::time::timeout(remaining, operation()).await {
            Ok(result) => result,
            Err(_) => return Err(copy_timeout(path)),
        };

        let fault = match attempt {
            Ok(stats) => return Ok(stats),
            Err(fault) => fault,
        };

        match copy_retry_decision(
            &fault,
            attempt_started.elapsed(),
            started.elapsed(),
            retries,
        ) {
            CopyRetryDecision::Retry => {
                retries += 1;
                tracing::warn!(
                    path = %path.display(),
                    error = %fault,
                    attempt_secs = attempt_started.elapsed().as_secs(),
                    "Copy failed mid-transfer, retrying"
                );
            }
            CopyRetryDecision::CeilingExceeded => return Err(copy_timeout(path)),
            CopyRetryDecision::Fail => return Err(fault),
        }
    }
}

fn copy_timeout(path: &Path) -> CaptureError {
    CaptureError::CopyTimeout {
        path: path.to_path_buf(),
        hours: COPY_RETRY_CEILING.as_secs() / 3600,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("AcqData")).unwrap();
        fs::write(root.join("analysis.tdf"), vec![7u8; 3000]).unwrap();
        fs::write(root.join("AcqData").join("MSScan.bin"), vec![9u8; 5000]).unwrap();
        fs::write(root.join("lock.file"), b"locked").unwrap();
    }

    #[tokio::test]
    async fn copy_file_in_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.raw");
        fs::write(&source, (0..=255u8).cycle().take(10_000).collect::<Vec<_>>()).unwrap();
        let destination = dir.path().join("out").join("data.raw");

        let stats = ResumableCopier::new(333)
            .copy_file(&source, &destination)
            .await
            .unwrap();

        assert_eq!(stats.files_copied, 1);
        assert_eq!(stats.bytes_copied, 10_000);
        assert_eq!(fs::read(&source).unwrap(), fs::read(&destination).unwrap());
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn resumes_from_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.raw");
        let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        fs::write(&source, &content).unwrap();
        let destination = dir.path().join("copy.raw");
        fs::write(part_path(&destination), &content[..1000]).unwrap();

        let stats = ResumableCopier::new(512)
            .copy_file(&source, &destination)
            .await
            .unwrap();

        assert_eq!(stats.files_resumed, 1);
        assert_eq!(stats.files_copied, 0);
        assert_eq!(stats.bytes_copied, 3096);
        assert_eq!(fs::read(&destination).unwrap(), content);
    }

    #[tokio::test]
    async fn oversized_part_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.raw");
        fs::write(&source, b"short").unwrap();
        let destination = dir.path().join("copy.raw");
        fs::write(part_path(&destination), b"much longer stale content").unwrap();

        let stats = ResumableCopier::new(4)
            .copy_file(&source, &destination)
            .await
            .unwrap();
        assert_eq!(stats.files_copied, 1);
        assert_eq!(fs::read(&destination).unwrap(), b"short");
    }

    #[tokio::test]
    async fn second_directory_copy_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Sample_01.d");
        build_tree(&source);
        let destination = dir.path().join("storage").join("Sample_01.d");
        let copier = ResumableCopier::new(1024);
        let skip = SkipList::new();

        let first = copier
            .copy_directory(&source, &destination, true, &skip)
            .await
            .unwrap();
        assert_eq!(first.files_copied, 3);
        assert_eq!(first.files_skipped, 0);

        let second = copier
            .copy_directory(&source, &destination, true, &skip)
            .await
            .unwrap();
        assert_eq!(second.files_copied, 0, "nothing newly copied");
        assert_eq!(second.files_skipped, 3, "all files skipped");
        assert_eq!(second.bytes_copied, 0);
    }

    #[derive(Default)]
    struct RecordingSink(std::sync::Mutex<Vec<f32>>);

    impl ProgressSink for RecordingSink {
        fn report(&self, percent: f32) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[tokio::test]
    async fn directory_copy_reports_progress_up_to_complete() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Sample_01.d");
        build_tree(&source);
        let destination = dir.path().join("storage").join("Sample_01.d");
        let sink = Arc::new(RecordingSink::default());
        let copier = ResumableCopier::new(1000).with_progress(3000 + 5000 + 6, sink.clone());

        copier
            .copy_directory(&source, &destination, true, &SkipList::new())
            .await
            .unwrap();

        let reported = sink.0.lock().unwrap().clone();
        assert!(reported.len() > 2, "reported {reported:?}");
        assert!(reported.windows(2).all(|w| w[0] < w[1]), "reported {reported:?}");
        assert_eq!(reported.last().copied(), Some(100.0));

        // A second pass counts skipped files and reports completion again
        sink.0.lock().unwrap().clear();
        copier
            .copy_directory(&source, &destination, true, &SkipList::new())
            .await
            .unwrap();
        assert_eq!(sink.0.lock().unwrap().last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn skip_list_applies_at_every_level() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        build_tree(&source);
        fs::write(source.join("AcqData").join("LOCK.FILE"), b"x").unwrap();
        let destination = dir.path().join("dst");

        let skip = SkipList::new().name("lock.file");
        let stats = ResumableCopier::new(1024)
            .copy_directory(&source, &destination, true, &skip)
            .await
            .unwrap();

        assert_eq!(stats.files_excluded, 2);
        let copied: Vec<String> = walkdir::WalkDir::new(&destination)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(copied.len(), 2);
        assert!(!copied.iter().any(|name| name.eq_ignore_ascii_case("lock.file")));
    }

    #[tokio::test]
    async fn non_recursive_copy_ignores_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        build_tree(&source);
        let destination = dir.path().join("dst");

        let stats = ResumableCopier::new(1024)
            .copy_directory(&source, &destination, false, &SkipList::new())
            .await
            .unwrap();
        assert_eq!(stats.files_copied, 2);
        assert!(!destination.join("AcqData").exists());
    }

    #[test]
    fn skip_list_rules() {
        let skip = SkipList::new()
            .name("Storage.mcf_idx-journal")
            .empty_name("Calibration.ascii")
            .extension(".bin");
        assert!(skip.skips("storage.MCF_IDX-JOURNAL", 10));
        assert!(skip.skips("calibration.ascii", 0));
        assert!(!skip.skips("calibration.ascii", 12));
        assert!(skip.skips("frame_001.BIN", 12));
        assert!(!skip.skips("Sample.uimf", 12));
        assert!(!skip.is_empty());
        assert!(SkipList::new().is_empty());
    }

    #[test]
    fn permission_denied_is_unauthorized() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            classify_copy_fault(Path::new("/x"), err),
            CaptureError::Unauthorized { .. }
        ));
        let err = std::io::Error::other("connection reset by peer");
        assert!(matches!(
            classify_copy_fault(Path::new("/x"), err),
            CaptureError::Transient { .. }
        ));
    }

    fn transient() -> CaptureError {
        CaptureError::Transient {
            path: PathBuf::from("/mnt/inst/Sample_01"),
            message: "network name no longer available".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fault_at_fifteen_seconds_retries_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = copy_with_retry(Path::new("/mnt/inst/Sample_01"), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(15)).await;
                    Err(transient())
                } else {
                    Ok(CopyStats {
                        files_copied: 1,
                        ..CopyStats::default()
                    })
                }
            }
        })
        .await;

        assert_eq!(result.unwrap().files_copied, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_at_five_seconds_does_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = copy_with_retry(Path::new("/mnt/inst/Sample_01"), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err::<CopyStats, _>(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(CaptureError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_late_faults_stop_after_one_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = copy_with_retry(Path::new("/mnt/inst/Sample_01"), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(20)).await;
                Err::<CopyStats, _>(transient())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_copy_hits_the_ceiling() {
        let result = copy_with_retry(Path::new("/mnt/inst/Sample_01"), || async {
            tokio::time::sleep(COPY_RETRY_CEILING + Duration::from_secs(60)).await;
            Ok(CopyStats::default())
        })
        .await;

        assert!(matches!(result, Err(CaptureError::CopyTimeout { hours: 6, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_fault_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = copy_with_retry(Path::new("/mnt/inst"), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err::<CopyStats, _>(CaptureError::Unauthorized {
                    path: PathBuf::from("/mnt/inst"),
                    message: "Access is denied.".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(CaptureError::Unauthorized { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
