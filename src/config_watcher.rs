//! Local configuration change detection
//!
//! The manager compares nothing itself: a filesystem watcher on the config
//! file's directory flips a shared flag on any event touching the file, and
//! the main loop exits with `ConfigChanged` when it sees the flag.

use crate::error::{Error, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches one configuration file
pub struct ConfigWatcher {
    /// Filesystem watcher instance; dropping it stops the events
    _watcher: RecommendedWatcher,

    /// Set once the file changed
    changed: Arc<AtomicBool>,

    /// Event loop task
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `config_path`
    ///
    /// The parent directory is watched non-recursively so editors that
    /// replace the file atomically are still noticed.
    pub fn start(config_path: &Path, cancel: CancellationToken) -> Result<Self> {
        let file_name = config_path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| Error::ConfigWatch(format!("not a file: {}", config_path.display())))?;
        let dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                // The receiver is gone once the loop stopped
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::ConfigWatch(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::ConfigWatch(format!("failed to watch {}: {}", dir.display(), e)))?;

        info!(config = %config_path.display(), "Watching configuration file for changes");

        let changed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(rx, file_name, changed.clone(), cancel));

        Ok(Self {
            _watcher: watcher,
            changed,
            task,
        })
    }

    /// Flag shared with the main loop
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.changed.clone()
    }

    /// True once the file changed
    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Stop watching
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        debug!("Config watcher stopped");
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    file_name: OsString,
    changed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = rx.recv() => match result {
                Some(result) => result,
                None => break,
            },
        };
        match result {
            Ok(event) if touches_file(&event, &file_name) => {
                info!(kind = ?event.kind, "Configuration file changed");
                changed.store(true, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Config watcher error"),
        }
    }
}

fn touches_file(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}
