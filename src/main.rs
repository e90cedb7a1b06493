//! `cestx` application entry point.
//!
//! Runs the Machine Orchestrator or the Route Synchronizer, or publishes a
//! single machine event. It uses `eyre` for opaque error handling at the
//! application boundary, converting domain-specific errors into
//! human-readable reports.
//!
//! Configuration is loaded with layered precedence via `OrthoConfig`:
//! 1. Application defaults
//! 2. Configuration file (`~/.config/cestx/config.toml` or path from `CESTX_CONFIG_PATH`)
//! 3. Environment variables (`CESTX_*`)
//! 4. Command-line arguments

use cestx::api::{publish_machine_event, run_orchestrator, run_router};
use cestx::config::{AppConfig, Cli, Commands, load_config};
use cestx::error::Result as CestxResult;
use clap::Parser;
use eyre::{Report, Result as EyreResult, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor `log_level` is set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Application entry point.
///
/// Loads configuration with layered precedence via `OrthoConfig`, installs
/// the log subscriber, then dispatches to the selected command on a Tokio
/// runtime.
fn main() -> EyreResult<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).map_err(Report::from)?;
    init_tracing(&config);

    let runtime = tokio::runtime::Runtime::new().wrap_err("failed to start async runtime")?;
    runtime.block_on(run(&cli, &config)).map_err(Report::from)
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity for one run without editing configuration.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_level.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Execute the CLI command, returning domain-specific errors.
///
/// Keeps semantic errors inside the run loop so the CLI boundary owns
/// conversion to `eyre::Report`.
async fn run(cli: &Cli, config: &AppConfig) -> CestxResult<()> {
    match &cli.command {
        Commands::Orchestrator => run_orchestrator(config, &shutdown_on_ctrl_c()).await,
        Commands::Router => run_router(config, &shutdown_on_ctrl_c()).await,
        Commands::Publish(args) => publish_machine_event(config, &args.to_message()).await,
    }
}

/// A token cancelled when the process receives Ctrl-C.
///
/// Consumers stop pulling new deliveries once it fires; in-flight handlers
/// finish and settle their messages.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl-C; stop the process with a signal instead");
            return;
        }
        info!("shutdown requested");
        trigger.cancel();
    });
    token
}
