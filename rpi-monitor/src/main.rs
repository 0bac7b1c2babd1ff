//! rpi-monitor daemon entry point

use clap::Parser;
use rpi_monitor::cli::Cli;
use rpi_monitor::config::MonitorConfig;
use rpi_monitor::daemon;
use rpi_monitor::notify::Notifier;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level()).init();

    info!("🍓 rpi-monitor v{} starting...", env!("CARGO_PKG_VERSION"));
    let notifier = Notifier::from_env();

    let config_dir = cli.config_dir.clone().unwrap_or_else(MonitorConfig::default_dir);
    let config = match MonitorConfig::load(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            notifier.status(&format!("configuration error: {}", e));
            return ExitCode::FAILURE;
        }
    };

    if !config.daemon.enabled {
        info!("Daemon disabled in {}, exiting", config_dir.display());
        return ExitCode::SUCCESS;
    }

    if cli.stall {
        info!("Stall mode: only the first report will be published");
    }

    match daemon::run(config, cli.stall, &notifier).await {
        Ok(()) => {
            info!("rpi-monitor stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {:#}", e);
            notifier.status(&format!("failed: {:#}", e));
            ExitCode::FAILURE
        }
    }
}
