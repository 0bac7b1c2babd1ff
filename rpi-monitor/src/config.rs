//! Configuration loading and validation
//!
//! Reads `config.toml` from the configuration directory once at startup:
//! - `[daemon]` reporting cadence, update-check cadence, fallback domain
//! - `[mqtt]` broker connection, topic layout, TLS and credentials
//! - `[commands]` whitelist of command names mapped to shell templates
//!
//! Broker settings can be overridden from the environment (`MQTT_USERNAME`,
//! `MQTT_PASSWORD`, `MQTT_HOSTNAME`, `MQTT_PORT`). Every range violation is a
//! fatal `ConfigError`; nothing here ever touches the network.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const REPORTING_INTERVAL_RANGE: (i64, i64) = (1, 20);
pub const UPDATE_CHECK_INTERVAL_RANGE: (i64, i64) = (4, 24);

pub const DEFAULT_DEVICE_NAME: &str = "rpi";

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub fallback_domain: String,
    pub reporting_interval_minutes: i64,
    pub update_check_interval_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub hostname: String,
    pub port: u16,
    pub keepalive: u64,
    pub base_topic: String,
    pub device_name: String,
    pub discovery_prefix: String,
    pub tls: bool,
    pub tls_ca_cert: Option<PathBuf>,
    pub tls_certfile: Option<PathBuf>,
    pub tls_keyfile: Option<PathBuf>,
    pub username: Option<String>,
    // Never logged
    pub password: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_domain: "home".to_string(),
            reporting_interval_minutes: 3,
            update_check_interval_hours: 6,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            base_topic: "home/nodes".to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            discovery_prefix: "homeassistant".to_string(),
            tls: false,
            tls_ca_cert: None,
            tls_certfile: None,
            tls_keyfile: None,
            username: None,
            password: None,
        }
    }
}

impl MonitorConfig {
    /// Load, normalise and validate `config.toml` from `config_dir`,
    /// applying broker overrides from the process environment
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(config_dir, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(config_dir: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Err(ConfigError::Missing { path });
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and normalise without environment overrides or validation
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: MonitorConfig = toml::from_str(content)?;
        config.normalise();
        Ok(config)
    }

    fn normalise(&mut self) {
        self.daemon.fallback_domain = self.daemon.fallback_domain.trim().to_lowercase();
        self.mqtt.base_topic = self.mqtt.base_topic.trim().trim_end_matches('/').to_lowercase();
        self.mqtt.device_name = self.mqtt.device_name.trim().to_lowercase();
        self.mqtt.discovery_prefix = self.mqtt.discovery_prefix.trim().trim_end_matches('/').to_lowercase();
    }

    fn apply_env_overrides<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = env("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(hostname) = env("MQTT_HOSTNAME") {
            self.mqtt.hostname = hostname;
        }
        if let Some(port) = env("MQTT_PORT") {
            self.mqtt.port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "MQTT_PORT",
                reason: format!("'{}' is not a valid port", port),
            })?;
        }
        Ok(())
    }

    /// Check every bounded setting; the first violation wins
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "update_check_interval_hours",
            self.daemon.update_check_interval_hours,
            UPDATE_CHECK_INTERVAL_RANGE,
        )?;
        check_range(
            "reporting_interval_minutes",
            self.daemon.reporting_interval_minutes,
            REPORTING_INTERVAL_RANGE,
        )?;

        if self.mqtt.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "mqtt.hostname",
                reason: "broker hostname must not be empty".to_string(),
            });
        }
        if self.mqtt.base_topic.is_empty() {
            return Err(ConfigError::Invalid {
                key: "mqtt.base_topic",
                reason: "base topic must not be empty".to_string(),
            });
        }
        if self.mqtt.device_name.is_empty() || self.mqtt.device_name.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid {
                key: "mqtt.device_name",
                reason: format!("'{}' is not a valid topic segment", self.mqtt.device_name),
            });
        }
        if self.mqtt.keepalive == 0 {
            return Err(ConfigError::Invalid {
                key: "mqtt.keepalive",
                reason: "keepalive must be at least one second".to_string(),
            });
        }

        for (name, template) in &self.commands {
            if name.is_empty() || name.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid {
                    key: "commands",
                    reason: format!("'{}' is not a valid command name", name),
                });
            }
            if name == "status" {
                return Err(ConfigError::Invalid {
                    key: "commands",
                    reason: "'status' is reserved for the availability topic".to_string(),
                });
            }
            if template.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "commands",
                    reason: format!("command '{}' has an empty shell template", name),
                });
            }
        }

        Ok(())
    }

    pub fn reporting_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.reporting_interval_minutes.max(1) as u64 * 60)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.update_check_interval_hours.max(1) as u64 * 3600)
    }

    /// Default configuration directory (`~/.config/rpi-monitor` on Linux)
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("rpi-monitor"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn check_range(key: &'static str, value: i64, (min, max): (i64, i64)) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { key, value, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_config(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), content).unwrap();
        dir
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_applied() {
        let dir = write_config("[mqtt]\n");
        let config = MonitorConfig::load_with_env(dir.path(), no_env).unwrap();

        assert!(config.daemon.enabled);
        assert_eq!(config.daemon.reporting_interval_minutes, 3);
        assert_eq!(config.daemon.update_check_interval_hours, 6);
        assert_eq!(config.mqtt.base_topic, "home/nodes");
        assert_eq!(config.mqtt.device_name, "rpi");
        assert_eq!(config.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.commands.is_empty());
        assert_eq!(config.reporting_interval(), Duration::from_secs(180));
        assert_eq!(config.update_check_interval(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = MonitorConfig::load_with_env(dir.path(), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn test_missing_mqtt_section_is_fatal() {
        let dir = write_config("[daemon]\nenabled = true\n");
        let err = MonitorConfig::load_with_env(dir.path(), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_interval_ranges_enforced() {
        for (content, key) in [
            ("[daemon]\nreporting_interval_minutes = 0\n[mqtt]\n", "reporting_interval_minutes"),
            ("[daemon]\nreporting_interval_minutes = 21\n[mqtt]\n", "reporting_interval_minutes"),
            ("[daemon]\nupdate_check_interval_hours = 3\n[mqtt]\n", "update_check_interval_hours"),
            ("[daemon]\nupdate_check_interval_hours = 25\n[mqtt]\n", "update_check_interval_hours"),
        ] {
            let dir = write_config(content);
            match MonitorConfig::load_with_env(dir.path(), no_env) {
                Err(ConfigError::OutOfRange { key: k, .. }) => assert_eq!(k, key),
                other => panic!("expected range error for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let dir = write_config(
            "[daemon]\nreporting_interval_minutes = 20\nupdate_check_interval_hours = 4\n[mqtt]\n",
        );
        assert!(MonitorConfig::load_with_env(dir.path(), no_env).is_ok());
    }

    #[test]
    fn test_topics_lowercased() {
        let dir = write_config(
            "[mqtt]\nbase_topic = \"Home/Nodes/\"\ndevice_name = \"Garage\"\ndiscovery_prefix = \"HA\"\n",
        );
        let config = MonitorConfig::load_with_env(dir.path(), no_env).unwrap();
        assert_eq!(config.mqtt.base_topic, "home/nodes");
        assert_eq!(config.mqtt.device_name, "garage");
        assert_eq!(config.mqtt.discovery_prefix, "ha");
    }

    #[test]
    fn test_env_overrides_file_values() {
        let dir = write_config("[mqtt]\nhostname = \"broker.lan\"\nusername = \"file-user\"\n");
        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_USERNAME", "env-user"),
            ("MQTT_PASSWORD", "secret"),
            ("MQTT_PORT", "8883"),
        ]);
        let config = MonitorConfig::load_with_env(dir.path(), |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.mqtt.hostname, "broker.lan");
        assert_eq!(config.mqtt.username.as_deref(), Some("env-user"));
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(config.mqtt.port, 8883);
    }

    #[test]
    fn test_bad_env_port_rejected() {
        let dir = write_config("[mqtt]\n");
        let err = MonitorConfig::load_with_env(dir.path(), |k| {
            (k == "MQTT_PORT").then(|| "eighty".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MQTT_PORT", .. }));
    }

    #[test]
    fn test_commands_section() {
        let dir = write_config(
            "[mqtt]\n[commands]\nreboot_now = \"/sbin/reboot {}\"\nrestart_service = \"systemctl restart {}\"\n",
        );
        let config = MonitorConfig::load_with_env(dir.path(), no_env).unwrap();
        assert_eq!(config.commands.len(), 2);
        assert_eq!(config.commands["reboot_now"], "/sbin/reboot {}");
    }

    #[test]
    fn test_reserved_command_name_rejected() {
        let dir = write_config("[mqtt]\n[commands]\nstatus = \"echo {}\"\n");
        assert!(matches!(
            MonitorConfig::load_with_env(dir.path(), no_env),
            Err(ConfigError::Invalid { key: "commands", .. })
        ));
    }
}
