use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use capture_manager::capture::{
    CaptureContext, CaptureStrategy, DirectoryCapture, InstrumentContext, StrategyRegistry,
};
use capture_manager::config::{CaptureConfig, LoggingConfig};
use capture_manager::config_watcher::ConfigWatcher;
use capture_manager::housekeeping::load_most_recent_job;
use capture_manager::logging::{Observability, init_logging};
use capture_manager::status::{StatusWriter, init_publisher};
use capture_manager::store::SqliteTaskStore;
use capture_manager::types::{DatasetInfo, DatasetType};
use capture_manager::{CaptureManager, CloseoutKind, Config, ManagerServices, cancel_on_signal};

/// Capture manager - copies finished instrument datasets to managed storage
#[derive(Parser)]
#[command(name = "capture-manager")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "CaptureManager.json")]
    config: PathBuf,

    /// Log debug output for capture-manager regardless of the configured level
    #[arg(long)]
    trace: bool,

    /// Capture a generated dataset into a temp directory and exit
    #[arg(long)]
    code_test: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = if cli.code_test {
        code_test(cli.trace).await
    } else {
        run(&cli.config, cli.trace).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("capture-manager: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config_path: &Path, trace: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    init_logging(&config.logging, trace).context("failed to initialize logging")?;

    let obs = Observability::new();
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    while run_once(config_path, config, &obs, &shutdown).await? {
        tracing::info!(config = %config_path.display(), "Reloading configuration");
        config = load_config(config_path)?;
    }

    shutdown.cancel();
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Run the loop once; returns true when it should run again with a fresh config
async fn run_once(
    config_path: &Path,
    config: Config,
    obs: &Observability,
    shutdown: &CancellationToken,
) -> Result<bool> {
    let store = Arc::new(
        SqliteTaskStore::new(&config.task_store.database_path, config.task_store.busy_retries)
            .await
            .context("task store unavailable")?,
    );

    let status = Arc::new(StatusWriter::new(&config.status, &config.manager.name, obs.clone()));
    if let Some(url) = &config.status.broadcast_url
        && let Some(publisher) = init_publisher(url, config.status.bus_connect_timeout).await
    {
        status.set_publisher(publisher);
    }
    if let Some(text) = load_most_recent_job(&config.manager.working_dir).await {
        status.set_most_recent_job(text);
    }

    let background = shutdown.child_token();
    let refresher = status.spawn_refresher(config.status.refresh_interval, background.clone());
    let watcher = ConfigWatcher::start(config_path, background.clone())
        .context("failed to watch the configuration file")?;

    let ctx = Arc::new(
        CaptureContext::new(config.capture.clone(), obs.clone()).with_progress(status.clone()),
    );
    let services = ManagerServices {
        store: store.clone(),
        settings: store,
        registry: Arc::new(StrategyRegistry::with_builtin(ctx)),
        status,
        obs: obs.clone(),
    };

    let mut manager = CaptureManager::new(config, services)
        .with_config_flag(watcher.flag())
        .with_shutdown(shutdown.clone());
    let code = manager.run().await;
    let restart = manager.shutdown(code).await;

    background.cancel();
    watcher.stop().await;
    if let Err(e) = refresher.await {
        tracing::debug!(error = %e, "Status refresher ended abnormally");
    }

    Ok(restart)
}

/// Self-test: capture a generated directory dataset without a task store
async fn code_test(trace: bool) -> Result<()> {
    init_logging(&LoggingConfig::default(), trace).context("failed to initialize logging")?;

    let root = std::env::temp_dir().join(format!("capture-manager-code-test-{}", std::process::id()));
    let dataset = "CodeTest_Dataset";
    let source = root.join("share").join(dataset);
    let destination = root.join("storage").join(dataset);

    tokio::fs::create_dir_all(source.join("pdata"))
        .await
        .context("failed to create the test dataset")?;
    tokio::fs::write(source.join("acqus"), b"##TITLE= capture-manager code test\n").await?;
    tokio::fs::write(source.join("fid"), vec![0u8; 256 * 1024]).await?;
    tokio::fs::write(source.join("pdata").join("procs"), b"##PROCS\n").await?;

    let capture = CaptureConfig {
        stability_base_interval: Duration::from_secs(1),
        ..CaptureConfig::default()
    };
    let ctx = Arc::new(CaptureContext::new(capture, Observability::new()));
    let info = DatasetInfo {
        dataset_name: dataset.to_string(),
        item_name: dataset.to_string(),
        dataset_type: DatasetType::DirectoryNoExt,
        file_list: Vec::new(),
    };

    let outcome = DirectoryCapture::new(ctx)
        .capture(&info, &source, &destination, false, &InstrumentContext::default())
        .await;

    println!("Code test capture: {}", outcome.closeout);
    if !outcome.message.is_empty() {
        println!("  message: {}", outcome.message);
    }
    println!("  destination: {}", destination.display());

    if let Err(e) = tokio::fs::remove_dir_all(&root).await {
        tracing::warn!(path = %root.display(), error = %e, "Could not remove code test files");
    }

    if outcome.closeout != CloseoutKind::Success {
        anyhow::bail!("code test capture did not succeed: {}", outcome.message);
    }
    Ok(())
}
