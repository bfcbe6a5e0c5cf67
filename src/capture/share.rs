//! Instrument share connections
//!
//! [`with_share_connection`] is the only way strategies touch a share: it
//! connects, runs the capture body, and disconnects exactly once whatever
//! the body does (including panicking).

use crate::config::ShareConfig;
use crate::error::CaptureError;
use crate::types::CaptureOutcome;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;

use super::{InstrumentContext, is_credential_message};

/// Connection to a remote file share
#[async_trait]
pub trait ShareConnection: Send + Sync {
    /// Open the connection (no-op when already open)
    async fn connect(&self) -> Result<(), CaptureError>;

    /// Close the connection if it is open
    async fn disconnect(&self) -> Result<(), CaptureError>;

    /// True while the connection is open
    fn is_connected(&self) -> bool;
}

/// Picks the connection type for an instrument
pub trait ShareConnector: Send + Sync {
    /// Connection for the instrument's share
    fn connection_for(&self, instrument: &InstrumentContext) -> Arc<dyn ShareConnection>;
}

/// Share reachable without credentials (mounted path)
///
/// Connecting only verifies the share root is reachable.
pub struct DirectShare {
    root: PathBuf,
    connected: AtomicBool,
}

impl DirectShare {
    /// Share rooted at `root` (empty = skip the reachability check)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ShareConnection for DirectShare {
    async fn connect(&self) -> Result<(), CaptureError> {
        if !self.root.as_os_str().is_empty() {
            tokio::fs::metadata(&self.root)
                .await
                .map_err(|e| CaptureError::from_io(&self.root, e))?;
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CaptureError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Share that needs credentials; connects by running an external command
pub struct CommandShare {
    share: PathBuf,
    config: ShareConfig,
    connected: AtomicBool,
}

impl CommandShare {
    /// Share at `share` using the configured connect/disconnect commands
    pub fn new(share: impl Into<PathBuf>, config: ShareConfig) -> Self {
        Self {
            share: share.into(),
            config,
            connected: AtomicBool::new(false),
        }
    }

    fn substitute(&self, template: &[String]) -> Vec<String> {
        let share = self.share.display().to_string();
        let user = self.config.user.clone().unwrap_or_default();
        let password = self.config.password.clone().unwrap_or_default();
        template
            .iter()
            .map(|arg| {
                arg.replace("{share}", &share)
                    .replace("{user}", &user)
                    .replace("{password}", &password)
            })
            .collect()
    }

    async fn run(&self, template: &[String], action: &str) -> Result<(), CaptureError> {
        let args = self.substitute(template);
        let Some((program, rest)) = args.split_first() else {
            return Ok(());
        };

        let binary = which::which(program).map_err(|e| CaptureError::Io {
            path: self.share.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} command '{}' not found: {}", action, program, e),
            ),
        })?;

        tracing::debug!(share = %self.share.display(), binary = %binary.display(), "Running share {} command", action);

        let output = Command::new(&binary)
            .args(rest)
            .output()
            .await
            .map_err(|e| CaptureError::from_io(&self.share, e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if stderr.is_empty() { stdout } else { stderr };
        let message = format!("share {} failed ({}): {}", action, output.status, message);

        if is_credential_message(&message) {
            Err(CaptureError::Credential {
                path: self.share.clone(),
                message,
            })
        } else {
            Err(CaptureError::Io {
                path: self.share.clone(),
                source: std::io::Error::other(message),
            })
        }
    }
}

#[async_trait]
impl ShareConnection for CommandShare {
    async fn connect(&self) -> Result<(), CaptureError> {
        if self.is_connected() {
            return Ok(());
        }
        self.run(&self.config.connect_command, "connect").await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(share = %self.share.display(), "Connected to secured share");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CaptureError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.run(&self.config.disconnect_command, "disconnect").await?;
        tracing::debug!(share = %self.share.display(), "Disconnected from secured share");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Chooses [`CommandShare`] for `secfso` instruments and [`DirectShare`] otherwise
pub struct DefaultShareConnector {
    config: ShareConfig,
}

impl DefaultShareConnector {
    /// Connector using `config` for secured shares
    pub fn new(config: ShareConfig) -> Self {
        Self { config }
    }
}

impl ShareConnector for DefaultShareConnector {
    fn connection_for(&self, instrument: &InstrumentContext) -> Arc<dyn ShareConnection> {
        if instrument.is_secured() {
            Arc::new(CommandShare::new(&instrument.share_root, self.config.clone()))
        } else {
            Arc::new(DirectShare::new(&instrument.share_root))
        }
    }
}

/// Run `body` while connected to the share
///
/// Connect failures resolve to an outcome without running the body. The
/// connection is released exactly once on every path; a panic in the body
/// is re-raised after the release.
pub async fn with_share_connection<F>(
    conn: &dyn ShareConnection,
    source: &Path,
    body: F,
) -> CaptureOutcome
where
    F: Future<Output = Result<CaptureOutcome, CaptureError>> + Send,
{
    if let Err(e) = conn.connect().await {
        tracing::warn!(source = %source.display(), error = %e, "Share connection failed");
        if let Err(e) = conn.disconnect().await {
            tracing::warn!(error = %e, "Share disconnect failed");
        }
        return CaptureOutcome::from_error(&e);
    }

    let result = AssertUnwindSafe(body).catch_unwind().await;

    if let Err(e) = conn.disconnect().await {
        tracing::warn!(source = %source.display(), error = %e, "Share disconnect failed");
    }

    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => CaptureOutcome::from_error(&e),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
