//! Host facts consumed by the reporting core
//!
//! `MetricsProvider` is the seam between the daemon and the operating
//! system. Every call is synchronous and may block (the reporting engine runs
//! them on the blocking pool). Each fact fails independently with a
//! `MetricError` so one missing tool never blanks a whole report.

pub mod linux;
pub mod subprocess;

use crate::error::MetricResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub use linux::LinuxProvider;

/// Reported when no GPU temperature source exists on the host
pub const GPU_TEMP_UNAVAILABLE: f64 = -1.0;

pub trait MetricsProvider: Send + Sync + 'static {
    /// Short hostname and fully-qualified domain name
    fn hostname(&self) -> MetricResult<HostNames>;
    fn device_model(&self) -> MetricResult<String>;
    fn cpu_info(&self) -> MetricResult<CpuInfo>;
    fn memory_installed(&self) -> MetricResult<Capacity>;
    fn drive_size(&self) -> MetricResult<Capacity>;
    fn mounted_filesystems(&self) -> MetricResult<Vec<MountedFilesystem>>;
    /// Physical interfaces and the MAC of the preferred one (lowercase)
    fn network_interfaces(&self) -> MetricResult<NetworkInterfaces>;
    fn os_release(&self) -> MetricResult<OsRelease>;

    fn uptime(&self) -> MetricResult<String>;
    fn temperatures(&self) -> MetricResult<Temperatures>;
    fn memory_used_percent(&self) -> MetricResult<u8>;
    fn drive_used_percent(&self) -> MetricResult<u8>;
    fn load_averages(&self) -> MetricResult<LoadAverages>;
    fn pending_updates(&self) -> MetricResult<PendingUpdates>;
    fn maintenance_history(&self) -> MetricResult<MaintenanceHistory>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNames {
    pub short: String,
    pub fqdn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    #[serde(rename = "Architecture")]
    pub architecture: String,
    #[serde(rename = "Core(s)")]
    pub cores: usize,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Clock Speed [MHz] (min|max)")]
    pub clock_speed_range: String,
    #[serde(rename = "Serial")]
    pub serial: String,
}

impl CpuInfo {
    pub fn unknown() -> Self {
        Self {
            architecture: std::env::consts::ARCH.to_string(),
            cores: 0,
            model: "unknown".to_string(),
            clock_speed_range: "unknown".to_string(),
            serial: String::new(),
        }
    }

    /// 32-bit ARM cores (`armv6l`, `armv7l`, ...)
    pub fn is_32bit_arm(&self) -> bool {
        self.architecture.contains("armv")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeUnit {
    #[serde(rename = "kB")]
    Kilobytes,
    #[serde(rename = "MB")]
    Megabytes,
    #[serde(rename = "GB")]
    Gigabytes,
    #[serde(rename = "TB")]
    Terabytes,
}

impl SizeUnit {
    fn from_magnitude(magnitude: u32) -> Self {
        match magnitude {
            0 => Self::Kilobytes,
            1 => Self::Megabytes,
            2 => Self::Gigabytes,
            _ => Self::Terabytes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kilobytes => "kB",
            Self::Megabytes => "MB",
            Self::Gigabytes => "GB",
            Self::Terabytes => "TB",
        }
    }
}

/// Nominal size of a memory or storage device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub value: u64,
    pub unit: SizeUnit,
}

impl Capacity {
    /// Round a kilobyte count up to the next power of two and scale it below
    /// 1024 (`3_906_250` kB → 4 GB, `768` kB → 1 MB)
    pub fn from_kilobytes(kb: u64) -> Self {
        let mut value = kb.max(1).checked_next_power_of_two().unwrap_or(1 << 63);
        let mut magnitude = 0;
        while value >= 1024 && magnitude < 3 {
            value /= 1024;
            magnitude += 1;
        }
        Self {
            value,
            unit: SizeUnit::from_magnitude(magnitude),
        }
    }

    pub fn unknown() -> Self {
        Self { value: 0, unit: SizeUnit::Kilobytes }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedFilesystem {
    pub device: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceAddresses {
    #[serde(rename = "IP", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "MAC", skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterfaces {
    pub interfaces: BTreeMap<String, InterfaceAddresses>,
    pub primary_mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    /// e.g. `Raspbian GNU/Linux 11 (bullseye) | 32-bit`
    pub release: String,
    /// Kernel release
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperatures {
    pub cpu_celsius: f64,
    /// `GPU_TEMP_UNAVAILABLE` when the firmware tool is missing
    pub gpu_celsius: f64,
}

/// Load averages scaled to percent of one core, one decimal
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadAverages {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverages {
    pub fn from_raw(one: f64, five: f64, fifteen: f64) -> Self {
        Self {
            one: as_load_percent(one),
            five: as_load_percent(five),
            fifteen: as_load_percent(fifteen),
        }
    }
}

fn as_load_percent(load: f64) -> f64 {
    (load * 1000.0).round() / 10.0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingUpdates {
    pub count: u32,
    /// package → `old -> new`
    pub packages: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceHistory {
    pub last_update: String,
    pub last_upgrade: String,
}

impl MaintenanceHistory {
    pub fn unknown() -> Self {
        Self {
            last_update: "unknown".to_string(),
            last_upgrade: "unknown".to_string(),
        }
    }
}

/// Format an uptime in seconds as `1d 2h04m`, `5d 37m`, `2h05m` or `37m`
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    match (days, hours) {
        (0, 0) => format!("{}m", minutes),
        (0, _) => format!("{}h{:02}m", hours, minutes),
        (_, 0) => format!("{}d {}m", days, minutes),
        _ => format!("{}d {}h{:02}m", days, hours, minutes),
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    //! Deterministic provider for component tests

    use super::*;
    use crate::error::MetricError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct FixedProvider {
        pub hostname: String,
        pub mac: String,
        pub architecture: String,
        pub pending: PendingUpdates,
        pub gpu_missing: bool,
        pub temperature_broken: bool,
        pub temperature_calls: AtomicUsize,
        /// Blocks every temperature read, like a wedged `vcgencmd`
        pub stuck_for: Option<std::time::Duration>,
    }

    impl FixedProvider {
        pub fn new(hostname: &str, mac: &str) -> Self {
            Self {
                hostname: hostname.to_string(),
                mac: mac.to_string(),
                architecture: "armv7l".to_string(),
                pending: PendingUpdates::default(),
                gpu_missing: false,
                temperature_broken: false,
                temperature_calls: AtomicUsize::new(0),
                stuck_for: None,
            }
        }
    }

    impl MetricsProvider for FixedProvider {
        fn hostname(&self) -> MetricResult<HostNames> {
            Ok(HostNames {
                short: self.hostname.clone(),
                fqdn: format!("{}.home", self.hostname),
            })
        }

        fn device_model(&self) -> MetricResult<String> {
            Ok("Raspberry Pi 3B+ r1.3".to_string())
        }

        fn cpu_info(&self) -> MetricResult<CpuInfo> {
            Ok(CpuInfo {
                architecture: self.architecture.clone(),
                cores: 4,
                model: "ARM Cortex-A53 r4".to_string(),
                clock_speed_range: "600 | 1400".to_string(),
                serial: "00000000deadbeef".to_string(),
            })
        }

        fn memory_installed(&self) -> MetricResult<Capacity> {
            Ok(Capacity::from_kilobytes(948_304))
        }

        fn drive_size(&self) -> MetricResult<Capacity> {
            Ok(Capacity::from_kilobytes(30_450_000))
        }

        fn mounted_filesystems(&self) -> MetricResult<Vec<MountedFilesystem>> {
            Ok(vec![MountedFilesystem {
                device: "/dev/sda1".to_string(),
                mount_point: "/mnt/usb".to_string(),
            }])
        }

        fn network_interfaces(&self) -> MetricResult<NetworkInterfaces> {
            let mut interfaces = BTreeMap::new();
            interfaces.insert(
                "eth0".to_string(),
                InterfaceAddresses {
                    ip: Some("192.168.1.20".to_string()),
                    mac: Some(self.mac.to_uppercase()),
                },
            );
            Ok(NetworkInterfaces {
                interfaces,
                primary_mac: self.mac.to_lowercase(),
            })
        }

        fn os_release(&self) -> MetricResult<OsRelease> {
            Ok(OsRelease {
                release: "Raspbian GNU/Linux 11 (bullseye) | 32-bit".to_string(),
                version: "6.1.21-v7+".to_string(),
            })
        }

        fn uptime(&self) -> MetricResult<String> {
            Ok(format_uptime(93_845))
        }

        fn temperatures(&self) -> MetricResult<Temperatures> {
            self.temperature_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.stuck_for {
                std::thread::sleep(delay);
            }
            if self.temperature_broken {
                return Err(MetricError::Unavailable("thermal zone"));
            }
            Ok(Temperatures {
                cpu_celsius: 47.2,
                gpu_celsius: if self.gpu_missing { GPU_TEMP_UNAVAILABLE } else { 46.7 },
            })
        }

        fn memory_used_percent(&self) -> MetricResult<u8> {
            Ok(38)
        }

        fn drive_used_percent(&self) -> MetricResult<u8> {
            Ok(21)
        }

        fn load_averages(&self) -> MetricResult<LoadAverages> {
            Ok(LoadAverages::from_raw(0.57, 0.31, 0.12))
        }

        fn pending_updates(&self) -> MetricResult<PendingUpdates> {
            Ok(self.pending.clone())
        }

        fn maintenance_history(&self) -> MetricResult<MaintenanceHistory> {
            Ok(MaintenanceHistory {
                last_update: "2024-03-01 06:00:00".to_string(),
                last_upgrade: "2024-02-20 18:30:00".to_string(),
            })
        }
    }
}
