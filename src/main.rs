//! Sensor Pipeline - simulated sensors, batched statistics, rotating log
//!
//! This service starts one simulated sensor per configured entry, aggregates
//! their readings into fixed-size batches, and writes one summary line per
//! batch to a log that rotates after a configured number of lines.
//!
//! ## Configuration
//!
//! - `--config` / `SENSOR_PIPELINE_CONFIG`: TOML file (default: config.toml)
//! - `SENSOR_PIPELINE_BATCH_SIZE`: Readings per batch
//! - `SENSOR_PIPELINE_LOG_DIR`: Directory for log files
//! - `SENSOR_PIPELINE_MAX_LINES`: Lines per log file
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! The pipeline runs until SIGINT or SIGTERM.

use std::future::Future;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sensor_pipeline::config::{Config, DEFAULT_CONFIG_PATH};
use sensor_pipeline::pipeline;

#[derive(Parser)]
#[command(name = "sensor-pipeline")]
#[command(about = "Simulated sensor pipeline writing batched statistics to a rotating log")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "SENSOR_PIPELINE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("Starting sensor pipeline...");

    let config = match Config::load(&cli.config) {
        Ok(config) => {
            info!(
                path = %cli.config.display(),
                sensors = config.sensors.len(),
                batch_size = config.processor.batch_size,
                batch_mode = %config.processor.batch_mode,
                log_dir = %config.logger.dir.display(),
                max_lines = config.logger.max_lines,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    match pipeline::run(&config, shutdown_signal()).await {
        Ok(stats) => {
            info!(
                readings = stats.readings_received,
                batches = stats.batches_flushed,
                discarded = stats.values_discarded,
                files = stats.files_opened,
                "Sensor pipeline stopped"
            );
        }
        Err(e) => {
            error!(error = %e, "Sensor pipeline failed");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve once the process receives SIGINT or SIGTERM.
///
/// A handler that fails to install is logged and never resolves, so it cannot
/// be mistaken for a shutdown request.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = wait_for_ctrl_c() => {}
            _ = wait_for_sigterm() => {}
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    resolve_on_signal("SIGINT", tokio::signal::ctrl_c()).await;
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            resolve_on_signal("SIGTERM", async move {
                sigterm.recv().await;
                Ok(())
            })
            .await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve when `signal` delivers; a listener error waits forever instead.
async fn resolve_on_signal<F>(name: &str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!(signal = name, "Received {}, shutting down", name),
        Err(e) => {
            error!(signal = name, error = %e, "Failed to listen for {}", name);
            std::future::pending::<()>().await;
        }
    }
}
