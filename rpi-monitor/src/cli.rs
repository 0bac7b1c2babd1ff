use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

/// Raspberry Pi monitor: host metrics to Home Assistant over MQTT
#[derive(Parser, Debug)]
#[command(name = "rpi-monitor")]
#[command(version)]
#[command(about, long_about = None)]
pub struct Cli {
    /// Log every reporting step
    #[arg(short, long)]
    pub verbose: bool,

    /// Log raw payloads and timer internals
    #[arg(short, long)]
    pub debug: bool,

    /// Publish only the first report (test aid)
    #[arg(short, long)]
    pub stall: bool,

    /// Directory holding config.toml
    #[arg(short, long = "config_dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        if self.debug {
            Level::TRACE
        } else if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}
