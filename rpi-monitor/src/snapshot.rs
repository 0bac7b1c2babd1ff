//! Device snapshot assembly
//!
//! Static facts are read once at startup; identity (hostname, network) is
//! mandatory, the rest falls back to placeholders. Dynamic facts are read
//! every cycle and each one fails on its own: a broken field is logged and
//! serialised as `null` while the rest of the report goes out.

use crate::error::{MetricResult, StartupError};
use crate::metrics::{
    Capacity, CpuInfo, InterfaceAddresses, LoadAverages, MaintenanceHistory, MetricsProvider,
    NetworkInterfaces, OsRelease, Temperatures,
};
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Key wrapping every snapshot on the wire
pub const PAYLOAD_ENVELOPE: &str = "info";

pub const REPORTER: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct StaticFacts {
    pub hostname: String,
    pub fqdn: String,
    pub model: String,
    pub cpu: CpuInfo,
    pub memory_installed: Capacity,
    pub drive_size: Capacity,
    /// device → `-> mount point`
    pub drives_mounted: BTreeMap<String, String>,
    pub network: NetworkInterfaces,
    pub os: OsRelease,
}

impl StaticFacts {
    pub fn collect<P: MetricsProvider + ?Sized>(
        provider: &P,
        fallback_domain: &str,
    ) -> Result<Self, StartupError> {
        let names = provider.hostname().map_err(StartupError::Identity)?;
        let network = provider.network_interfaces().map_err(StartupError::Identity)?;

        let fqdn = if names.fqdn.contains('.') || fallback_domain.is_empty() {
            names.fqdn
        } else {
            format!("{}.{}", names.short, fallback_domain)
        };

        let facts = Self {
            hostname: names.short,
            fqdn,
            model: field("device model", provider.device_model()).unwrap_or_else(|| "unknown".to_string()),
            cpu: field("cpu info", provider.cpu_info()).unwrap_or_else(CpuInfo::unknown),
            memory_installed: field("memory installed", provider.memory_installed()).unwrap_or_else(Capacity::unknown),
            drive_size: field("drive size", provider.drive_size()).unwrap_or_else(Capacity::unknown),
            drives_mounted: field("mounted filesystems", provider.mounted_filesystems())
                .unwrap_or_default()
                .into_iter()
                .map(|fs| (fs.device, format!("-> {}", fs.mount_point)))
                .collect(),
            network,
            os: field("os release", provider.os_release()).unwrap_or_else(|| OsRelease {
                release: "unknown".to_string(),
                version: "unknown".to_string(),
            }),
        };

        debug!("hostname = [{}], fqdn = [{}]", facts.hostname, facts.fqdn);
        debug!("model = [{}], cpu = [{:?}]", facts.model, facts.cpu);
        debug!("memory = [{}], drive = [{}]", facts.memory_installed, facts.drive_size);
        debug!("mounted = [{:?}], interfaces = [{:?}]", facts.drives_mounted, facts.network.interfaces);
        Ok(facts)
    }
}

/// Values refreshed on every reporting cycle; `None` when the source failed
#[derive(Debug, Clone, Default)]
pub struct DynamicFacts {
    pub uptime: Option<String>,
    pub temperatures: Option<Temperatures>,
    pub memory_used: Option<u8>,
    pub drive_used: Option<u8>,
    pub load: Option<LoadAverages>,
    pub maintenance: Option<MaintenanceHistory>,
}

impl DynamicFacts {
    pub fn gather<P: MetricsProvider + ?Sized>(provider: &P) -> Self {
        let facts = Self {
            uptime: field("uptime", provider.uptime()),
            temperatures: field("temperatures", provider.temperatures()),
            memory_used: field("memory used", provider.memory_used_percent()),
            drive_used: field("drive used", provider.drive_used_percent()),
            load: field("load averages", provider.load_averages()),
            maintenance: field("maintenance history", provider.maintenance_history()),
        };
        debug!(
            "uptime = [{:?}], temps = [{:?}], mem = [{:?}%], drive = [{:?}%], load = [{:?}]",
            facts.uptime, facts.temperatures, facts.memory_used, facts.drive_used, facts.load
        );
        facts
    }
}

fn field<T>(name: &'static str, result: MetricResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to read {}: {}", name, e);
            None
        }
    }
}

/// One report as published on the values topic (under `info`)
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Raspberry_Model")]
    pub model: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "FQDN")]
    pub fqdn: String,
    #[serde(rename = "OS_Release")]
    pub os_release: String,
    #[serde(rename = "OS_Version")]
    pub os_version: String,
    #[serde(rename = "OS_Pending_Updates")]
    pub os_pending_updates: u32,
    #[serde(rename = "OS_Last_Update")]
    pub os_last_update: Option<String>,
    #[serde(rename = "OS_Last_Upgrade")]
    pub os_last_upgrade: Option<String>,
    #[serde(rename = "Up_Time")]
    pub up_time: Option<String>,
    #[serde(rename = "Drive_Size_Installed")]
    pub drive_size_installed: String,
    #[serde(rename = "Drive_Size_Used")]
    pub drive_size_used: Option<u8>,
    #[serde(rename = "Memory_Installed")]
    pub memory_installed: String,
    #[serde(rename = "Memory_Used")]
    pub memory_used: Option<u8>,
    #[serde(rename = "Temp_CPU")]
    pub temp_cpu: Option<f64>,
    #[serde(rename = "Temp_GPU")]
    pub temp_gpu: Option<f64>,
    #[serde(rename = "CPU_Load_1min")]
    pub cpu_load_1min: Option<f64>,
    #[serde(rename = "CPU_Load_5min")]
    pub cpu_load_5min: Option<f64>,
    #[serde(rename = "CPU_Load_15min")]
    pub cpu_load_15min: Option<f64>,
    #[serde(rename = "Reporter")]
    pub reporter: String,
    #[serde(rename = "Reporter_Interval")]
    pub reporter_interval: String,
    #[serde(rename = "CPU")]
    pub cpu: CpuInfo,
    #[serde(rename = "Drive(s)_Mounted")]
    pub drives_mounted: BTreeMap<String, String>,
    #[serde(rename = "Network_Interface(s)")]
    pub network_interfaces: BTreeMap<String, InterfaceAddresses>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    info: &'a DeviceSnapshot,
}

impl DeviceSnapshot {
    pub fn build(
        facts: &StaticFacts,
        dynamic: DynamicFacts,
        pending_updates: u32,
        interval_minutes: i64,
        now: DateTime<Local>,
    ) -> Self {
        let (os_last_update, os_last_upgrade) = match dynamic.maintenance {
            Some(history) => (Some(history.last_update), Some(history.last_upgrade)),
            None => (None, None),
        };

        Self {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, false),
            model: facts.model.clone(),
            hostname: facts.hostname.clone(),
            fqdn: facts.fqdn.clone(),
            os_release: facts.os.release.clone(),
            os_version: facts.os.version.clone(),
            os_pending_updates: pending_updates,
            os_last_update,
            os_last_upgrade,
            up_time: dynamic.uptime,
            drive_size_installed: facts.drive_size.to_string(),
            drive_size_used: dynamic.drive_used,
            memory_installed: facts.memory_installed.to_string(),
            memory_used: dynamic.memory_used,
            temp_cpu: dynamic.temperatures.map(|t| t.cpu_celsius),
            temp_gpu: dynamic.temperatures.map(|t| t.gpu_celsius),
            cpu_load_1min: dynamic.load.map(|l| l.one),
            cpu_load_5min: dynamic.load.map(|l| l.five),
            cpu_load_15min: dynamic.load.map(|l| l.fifteen),
            reporter: REPORTER.to_string(),
            reporter_interval: format!("{} min", interval_minutes),
            cpu: facts.cpu.clone(),
            drives_mounted: facts.drives_mounted.clone(),
            network_interfaces: facts.network.interfaces.clone(),
        }
    }

    /// Wire form: `{"info": {...}}`
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Envelope { info: self })
    }
}
