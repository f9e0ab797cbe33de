//! postflow-send - Background worker for scheduled posts
//!
//! Publishes due posts, reconciles submitted ones with their platforms,
//! notifies users about failures and applies retention, once per tick.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libpostflow::logging::LoggingConfig;
use libpostflow::{Config, PostflowError, PostflowService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "postflow-send")]
#[command(version)]
#[command(about = "Background worker that publishes scheduled posts")]
#[command(long_about = "\
postflow-send - Background worker that publishes scheduled posts

DESCRIPTION:
    postflow-send runs the publishing pipeline in a loop. Every tick it
    publishes the posts that are due, asks each platform about posts that
    were submitted earlier, notifies users about failures and deletes
    finished posts past their retention period.

USAGE:
    # Run in foreground (logs to stderr)
    postflow-send

    # Run with custom poll interval
    postflow-send --poll-interval 30

    # Run one tick and print its report as JSON
    postflow-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (no new posts are started)

CONFIGURATION:
    Configuration file: $POSTFLOW_CONFIG or ~/.config/postflow/config.toml

    [scheduling]
    poll_interval = 60   # seconds between ticks
    concurrency = 4      # posts published in parallel
    retention_days = 30  # keep finished posts this long

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Configuration file (overrides the default location)
    #[arg(long, value_name = "PATH", env = "POSTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run a single tick, print its report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<PostflowError>() {
        Some(PostflowError::Config(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }?;
    let poll_interval = cli
        .poll_interval
        .unwrap_or(config.scheduling.poll_interval)
        .max(1);

    let service = PostflowService::from_config(config)
        .await
        .context("Failed to start the publishing service")?;

    if cli.once {
        let report = service.run_cycle(&CancellationToken::new()).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone())?;

    info!(poll_interval, "postflow-send starting");
    run_loop(&service, Duration::from_secs(poll_interval), &shutdown).await;
    info!("postflow-send stopped");
    Ok(())
}

async fn run_loop(service: &PostflowService, poll_interval: Duration, shutdown: &CancellationToken) {
    loop {
        if let Err(e) = service.run_cycle(shutdown).await {
            error!(error = %e, "Tick failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, stopping gracefully");
            shutdown.cancel();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully");
            shutdown.cancel();
        }
    });
    Ok(())
}
