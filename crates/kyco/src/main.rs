//! Kyco controller binary.
//!
//! Loads the TOML configuration, applies command line overrides, starts the
//! controller and stops it again on SIGINT/SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::AppConfig;
use controller::Controller;
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_cli(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    logging::setup_logging(&config.logging)?;

    let controller = Controller::new(config.to_controller_config()?);
    info!(
        "Kyco v{} | config: {} | core NApps: {} | NApps: {}",
        env!("CARGO_PKG_VERSION"),
        args.config_path.display(),
        config.napps.core_directory,
        config.napps.directory
    );

    controller.start().await.context("failed to start controller")?;
    info!("Controller is running on {}", config.server.bind_address);
    info!("Press Ctrl+C to shut down");

    if let Err(e) = signals::wait_for_shutdown_signal().await {
        error!("Signal handling failed, shutting down: {}", e);
    }

    info!("Shutdown signal received, stopping controller");
    let stopped = controller.stop().await;

    let stats = controller.stats().await;
    info!(
        events = stats.dispatch.events_dispatched,
        listener_failures = stats.dispatch.listener_failures,
        dropped = stats.dropped_at_stop,
        "Final statistics"
    );

    stopped.context("controller did not stop cleanly")?;
    info!("Kyco shutdown complete");
    Ok(())
}
