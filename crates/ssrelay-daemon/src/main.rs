//! ssrelay Daemon
//!
//! Keeps the relay catalog tidy in the background: opens the registry,
//! sweeps the recycle bin on a schedule and reports readiness to systemd.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use ssrelay_daemon::{RecycleSweeper, Registry};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "ssrelay-daemon")]
#[command(version, about = "ssrelay daemon - relay fleet housekeeping")]
struct Args {
    /// Configuration file (JSON), merged over the global settings file
    #[arg(long, env = "SSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding services/ and recycle/
    #[arg(long, env = "SSRELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Days a deleted relay stays in the recycle bin
    #[arg(long, env = "SSRELAY_RETENTION_DAYS")]
    retention_days: Option<u64>,

    /// Seconds between recycle bin sweeps
    #[arg(long, env = "SSRELAY_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    /// [default: fleet.log_level, else info]
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SSRELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        ssrelay_core::config::load_config(args.config.as_deref()).context("loading configuration")?;

    let log_level = args
        .log_level
        .or_else(|| config.fleet.log_level.clone())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let log_filter = format!("ssrelay_daemon={log_level}");
    ssrelay_core::tracing_init::init_tracing(&log_filter, args.log_json);
    if let Some(dir) = args.data_dir {
        config.fleet.data_dir = Some(dir);
    }
    if let Some(days) = args.retention_days {
        config.recycle.retention_days = days;
    }
    if let Some(secs) = args.sweep_interval {
        config.recycle.sweep_interval_secs = secs;
    }

    let data_dir = config.fleet.resolved_data_dir();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        retention_days = config.recycle.retention_days,
        "Starting ssrelay-daemon"
    );

    let registry = Arc::new(
        Registry::open(&data_dir)
            .with_context(|| format!("opening registry at {}", data_dir.display()))?,
    );
    info!(relays = registry.list()?.len(), "Registry loaded");

    let mut sweeper = RecycleSweeper::new(Arc::clone(&registry), &config.recycle);
    let purged = sweeper.sweep_once();
    if !purged.is_empty() {
        info!(ports = ?purged, "Purged expired recycle bin entries at startup");
    }
    sweeper.start();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). `true` unsets
    // $NOTIFY_SOCKET so launcher children don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    sweeper.stop().await;
    info!("Daemon stopped");
    Ok(())
}
