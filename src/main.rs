//! Stackdriver Exporter Binary

use clap::Parser;
use stackdriver_exporter::{
    AdapterConfig, CredentialResolver, ExportScheduler, ExporterStats, HttpConnector, MetadataTokenProvider, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Periodic metric, log and trace export")]
struct Args {
    /// Adapter configuration document (YAML, or JSON by extension)
    #[arg(long, env = "EXPORTER_CONFIG")]
    config: PathBuf,

    /// Timeout for metadata server token requests
    #[arg(long, env = "EXPORTER_METADATA_TIMEOUT", default_value = "5s", value_parser = humantime_serde::re::humantime::parse_duration)]
    metadata_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let args = Args::parse();
    info!("Starting Stackdriver Exporter v{}", env!("CARGO_PKG_VERSION"));

    let config = match AdapterConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    let provider = Arc::new(MetadataTokenProvider::new(args.metadata_timeout)?);
    let scheduler = match ExportScheduler::start(
        &config,
        CredentialResolver::new(provider),
        Arc::new(HttpConnector),
        Arc::new(ExporterStats::new()),
    )
    .await
    {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Exporter failed to start: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Exporter configuration - Project: {}, Push interval: {:?}",
        scheduler.project_id(),
        scheduler.push_interval()
    );

    run_until_shutdown(&scheduler, &args.config).await?;

    let report = scheduler.shutdown().await?;
    info!(
        "Final flush - {} series, {} log entries, {} spans; stats: {:?}",
        report.metrics.series_sent,
        report.logs.entries_sent,
        report.spans_sent,
        scheduler.stats()
    );
    Ok(())
}

async fn reload(scheduler: &ExportScheduler, path: &Path) {
    info!("Reloading configuration from {}", path.display());
    let config = match AdapterConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring reload, configuration unreadable: {}", e);
            return;
        }
    };
    if let Err(e) = scheduler.reload(&config).await {
        warn!("Reload failed, previous configuration still active: {}", e);
    }
}

#[cfg(unix)]
async fn run_until_shutdown(scheduler: &ExportScheduler, path: &Path) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload(scheduler, path).await,
            _ = terminate.recv() => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_until_shutdown(_scheduler: &ExportScheduler, _path: &Path) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
