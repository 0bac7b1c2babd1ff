//! Typed error domains of the monitor
//!
//! - `ConfigError`: anything wrong with `config.toml` (always fatal)
//! - `MetricError`: a single host fact could not be read (isolated per field)
//! - `StartupError`: preconditions checked before entering the serve loop

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid \"{key}\" = {value} in configuration file, must be within [{min}-{max}]")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("invalid \"{key}\": {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("{0} is not available on this host")]
    Unavailable(&'static str),
}

impl MetricError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn parse(what: &'static str, detail: impl ToString) -> Self {
        Self::Parse { what, detail: detail.to_string() }
    }
}

pub type MetricResult<T> = Result<T, MetricError>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to locate a shell interpreter (`sh`) required for commands")]
    MissingShell,

    #[error("failed to identify this device: {0}")]
    Identity(#[source] MetricError),

    #[error("MQTT connection refused by broker: {0}")]
    ConnectionRefused(String),

    #[error("MQTT connection failed: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message_names_bounds() {
        let err = ConfigError::OutOfRange {
            key: "reporting_interval_minutes",
            value: 30,
            min: 1,
            max: 20,
        };
        let text = err.to_string();
        assert!(text.contains("reporting_interval_minutes"));
        assert!(text.contains("[1-20]"));
    }
}
