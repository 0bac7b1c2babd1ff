//! Native Linux implementation of `MetricsProvider`
//!
//! Reads `/proc`, `/sys` and `/etc` directly and asks `sysinfo`/`nix` for the
//! rest. External tools are only spawned where no native source exists:
//! - `vcgencmd measure_temp` for the GPU temperature (Raspberry Pi firmware)
//! - `hostname -f` for the resolver's idea of the FQDN
//! - `apt-get -s upgrade` for the pending package list

use super::subprocess::{run_with_timeout, DEFAULT_TIMEOUT};
use super::*;
use crate::error::{MetricError, MetricResult};
use chrono::{DateTime, Local};
use if_addrs::{get_if_addrs, IfAddr};
use parking_lot::Mutex;
use std::path::Path;
use sysinfo::System;
use tracing::{debug, info, warn};

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";
const CPUINFO: &str = "/proc/cpuinfo";
const MOUNTS: &str = "/proc/mounts";
const OS_RELEASE: &str = "/etc/os-release";
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const CPUFREQ_DIR: &str = "/sys/devices/system/cpu/cpu0/cpufreq";
// `apt-get update` rewrites this directory, dpkg touches the lock on upgrade
const APT_LISTS_PARTIAL: &str = "/var/lib/apt/lists/partial";
const DPKG_LOCK: &str = "/var/lib/dpkg/lock";

/// Mount points and devices never reported as "mounted drives"
const MOUNT_EXCLUDES: &[&str] = &["tmpfs", "boot", "root", "overlay", "udev"];

pub struct LinuxProvider {
    system: Mutex<System>,
}

impl LinuxProvider {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for LinuxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for LinuxProvider {
    fn hostname(&self) -> MetricResult<HostNames> {
        let fqdn = match run_with_timeout("hostname", &["-f"], DEFAULT_TIMEOUT) {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) | Err(_) => {
                debug!("hostname -f unavailable, using gethostname");
                gethostname::gethostname().to_string_lossy().trim().to_string()
            }
        };

        if fqdn.is_empty() {
            return Err(MetricError::Unavailable("hostname"));
        }

        let short = fqdn.split('.').next().unwrap_or(&fqdn).to_string();
        Ok(HostNames { short, fqdn })
    }

    fn device_model(&self) -> MetricResult<String> {
        match read_trimmed(DEVICE_TREE_MODEL) {
            Ok(raw) => Ok(shorten_model(&raw)),
            Err(_) => {
                let cpuinfo = read_trimmed(CPUINFO)?;
                cpuinfo_field(&cpuinfo, "Model")
                    .map(|raw| shorten_model(&raw))
                    .ok_or(MetricError::Unavailable("device model"))
            }
        }
    }

    fn cpu_info(&self) -> MetricResult<CpuInfo> {
        let mut system = self.system.lock();
        system.refresh_cpu();

        let cores = system
            .physical_core_count()
            .unwrap_or_else(|| system.cpus().len());
        let (brand, vendor) = system
            .cpus()
            .first()
            .map(|cpu| (cpu.brand().trim().to_string(), cpu.vendor_id().trim().to_string()))
            .unwrap_or_default();
        drop(system);

        let cpuinfo = std::fs::read_to_string(CPUINFO).unwrap_or_default();
        let model = compose_cpu_model(&vendor, &brand, &cpuinfo);

        let architecture = nix::sys::utsname::uname()
            .map(|uts| uts.machine().to_string_lossy().into_owned())
            .unwrap_or_else(|_| std::env::consts::ARCH.to_string());

        let clock_speed_range = match (
            read_khz_as_mhz(Path::new(CPUFREQ_DIR).join("cpuinfo_min_freq")),
            read_khz_as_mhz(Path::new(CPUFREQ_DIR).join("cpuinfo_max_freq")),
        ) {
            (Some(min), Some(max)) => format!("{} | {}", min, max),
            _ => "unknown".to_string(),
        };

        Ok(CpuInfo {
            architecture,
            cores,
            model,
            clock_speed_range,
            serial: cpuinfo_field(&cpuinfo, "Serial").unwrap_or_default(),
        })
    }

    fn memory_installed(&self) -> MetricResult<Capacity> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(MetricError::Unavailable("memory size"));
        }
        Ok(Capacity::from_kilobytes(total / 1024))
    }

    fn drive_size(&self) -> MetricResult<Capacity> {
        let stat = root_statvfs()?;
        let bytes = stat.blocks() as u64 * stat.fragment_size() as u64;
        Ok(Capacity::from_kilobytes(bytes / 1024))
    }

    fn mounted_filesystems(&self) -> MetricResult<Vec<MountedFilesystem>> {
        let content = std::fs::read_to_string(MOUNTS).map_err(|e| MetricError::io(MOUNTS, e))?;
        Ok(parse_mounts(&content))
    }

    fn network_interfaces(&self) -> MetricResult<NetworkInterfaces> {
        let addrs = get_if_addrs().map_err(|e| MetricError::io("network interfaces", e))?;

        let mut interfaces: BTreeMap<String, InterfaceAddresses> = BTreeMap::new();
        for if_addr in addrs {
            if if_addr.is_loopback() || !is_physical(&if_addr.name) {
                continue;
            }

            let entry = interfaces.entry(if_addr.name.clone()).or_default();
            if let IfAddr::V4(v4) = &if_addr.addr {
                entry.ip.get_or_insert_with(|| v4.ip.to_string());
            }
            if entry.mac.is_none() {
                match mac_address::mac_address_by_name(&if_addr.name) {
                    Ok(Some(mac)) => entry.mac = Some(mac.to_string().to_uppercase()),
                    Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
                    Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
                }
            }
        }

        let primary_mac = select_primary_mac(&interfaces)
            .ok_or(MetricError::Unavailable("network interface with a MAC address"))?;
        info!("Selected primary MAC {} from {} interfaces", primary_mac, interfaces.len());

        Ok(NetworkInterfaces {
            interfaces,
            primary_mac,
        })
    }

    fn os_release(&self) -> MetricResult<OsRelease> {
        let content = std::fs::read_to_string(OS_RELEASE).map_err(|e| MetricError::io(OS_RELEASE, e))?;
        let name = parse_pretty_name(&content).ok_or_else(|| MetricError::parse("os-release", "no PRETTY_NAME"))?;

        let version = nix::sys::utsname::uname()
            .map(|uts| uts.release().to_string_lossy().into_owned())
            .map_err(|e| MetricError::parse("uname", e))?;

        Ok(OsRelease {
            release: format!("{} | {}-bit", name, usize::BITS),
            version,
        })
    }

    fn uptime(&self) -> MetricResult<String> {
        Ok(format_uptime(System::uptime()))
    }

    fn temperatures(&self) -> MetricResult<Temperatures> {
        let raw = read_trimmed(THERMAL_ZONE)?;
        let millidegrees: f64 = raw.parse().map_err(|e| MetricError::parse("thermal zone", e))?;

        let gpu_celsius = match run_with_timeout("vcgencmd", &["measure_temp"], DEFAULT_TIMEOUT) {
            Ok(out) => parse_vcgencmd_temp(&out).unwrap_or_else(|| {
                warn!("unexpected vcgencmd output: {}", out.trim());
                GPU_TEMP_UNAVAILABLE
            }),
            Err(e) => {
                debug!("GPU temperature unavailable: {}", e);
                GPU_TEMP_UNAVAILABLE
            }
        };

        Ok(Temperatures {
            cpu_celsius: millidegrees / 1000.0,
            gpu_celsius,
        })
    }

    fn memory_used_percent(&self) -> MetricResult<u8> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(MetricError::Unavailable("memory size"));
        }
        let used = total.saturating_sub(system.available_memory());
        Ok(percent(used, total))
    }

    fn drive_used_percent(&self) -> MetricResult<u8> {
        let stat = root_statvfs()?;
        let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64);
        let usable = used + stat.blocks_available() as u64;
        if usable == 0 {
            return Err(MetricError::Unavailable("root filesystem size"));
        }
        Ok(percent(used, usable))
    }

    fn load_averages(&self) -> MetricResult<LoadAverages> {
        let load = System::load_average();
        Ok(LoadAverages::from_raw(load.one, load.five, load.fifteen))
    }

    fn pending_updates(&self) -> MetricResult<PendingUpdates> {
        let out = run_with_timeout(
            "apt-get",
            &["-s", "-o", "Debug::NoLocking=true", "upgrade"],
            std::time::Duration::from_secs(120),
        )?;
        Ok(parse_apt_simulation(&out))
    }

    fn maintenance_history(&self) -> MetricResult<MaintenanceHistory> {
        Ok(MaintenanceHistory {
            last_update: modified_at(APT_LISTS_PARTIAL)?,
            last_upgrade: modified_at(DPKG_LOCK)?,
        })
    }
}

fn read_trimmed(path: &str) -> MetricResult<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .map_err(|e| MetricError::io(path, e))
}

fn read_khz_as_mhz(path: std::path::PathBuf) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse::<u64>().ok().map(|khz| khz / 1000)
}

fn root_statvfs() -> MetricResult<nix::sys::statvfs::Statvfs> {
    nix::sys::statvfs::statvfs("/").map_err(|e| MetricError::io("/", std::io::Error::from(e)))
}

fn modified_at(path: &str) -> MetricResult<String> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| MetricError::io(path, e))?;
    Ok(DateTime::<Local>::from(modified).format("%Y-%m-%d %H:%M:%S").to_string())
}

fn percent(part: u64, whole: u64) -> u8 {
    ((part as f64 / whole as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// `Raspberry Pi 3 Model B Plus Rev 1.3` → `Raspberry Pi 3B+ r1.3`
fn shorten_model(raw: &str) -> String {
    raw.replace(" Model ", "")
        .replace(" Plus ", "+")
        .replace("Rev ", " r")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Value of the first `key : value` line in `/proc/cpuinfo`
fn cpuinfo_field(cpuinfo: &str, key: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

fn compose_cpu_model(vendor: &str, brand: &str, cpuinfo: &str) -> String {
    let brand = if brand.is_empty() {
        cpuinfo_field(cpuinfo, "model name").unwrap_or_else(|| "unknown".to_string())
    } else {
        brand.to_string()
    };
    let revision = cpuinfo_field(cpuinfo, "CPU revision");

    let mut model = if vendor.is_empty() || brand.contains(vendor) {
        brand
    } else {
        format!("{} {}", vendor, brand)
    };
    if let Some(revision) = revision {
        model.push_str(&format!(" r{}", revision));
    }
    model
}

fn parse_mounts(content: &str) -> Vec<MountedFilesystem> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some((device, mount_point))
        })
        .filter(|(device, mount_point)| {
            device.starts_with("/dev/")
                && *mount_point != "/"
                && !MOUNT_EXCLUDES
                    .iter()
                    .any(|ex| device.contains(ex) || mount_point.contains(ex))
        })
        .map(|(device, mount_point)| MountedFilesystem {
            device: device.to_string(),
            mount_point: mount_point.to_string(),
        })
        .collect()
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim().trim_matches('"').to_string())
    })
}

/// `temp=46.7'C` → 46.7
fn parse_vcgencmd_temp(out: &str) -> Option<f64> {
    let value = out.trim().strip_prefix("temp=")?;
    value.split('\'').next()?.parse().ok()
}

/// Collect `Inst` lines of `apt-get -s upgrade`:
/// `Inst libssl1.1 [1.1.1n-0+deb11u3] (1.1.1n-0+deb11u4 Raspbian:11/stable [armhf])`
fn parse_apt_simulation(out: &str) -> PendingUpdates {
    let mut packages = BTreeMap::new();

    for line in out.lines() {
        let Some(rest) = line.strip_prefix("Inst ") else {
            continue;
        };
        let mut tokens = rest.split_whitespace();
        let Some(name) = tokens.next() else {
            continue;
        };

        let installed = rest
            .split_once('[')
            .filter(|(before, _)| !before.contains('('))
            .and_then(|(_, after)| after.split(']').next())
            .map(str::to_string);
        let candidate = rest
            .split_once('(')
            .and_then(|(_, after)| after.split_whitespace().next())
            .map(|v| v.trim_end_matches(')').to_string());

        let change = match (installed, candidate) {
            (Some(from), Some(to)) => format!("{} -> {}", from, to),
            (None, Some(to)) => to,
            (_, None) => "unknown".to_string(),
        };
        packages.insert(name.to_string(), change);
    }

    PendingUpdates {
        count: packages.len() as u32,
        packages,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterfaceType {
    Ethernet,
    Wireless,
    Other,
}

fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();
    if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wlo") || name.contains("wifi") {
        return InterfaceType::Wireless;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

fn is_physical(name: &str) -> bool {
    classify_interface(name) != InterfaceType::Other
}

/// Ethernet first, then wireless; lowercase MAC of the winner
fn select_primary_mac(interfaces: &BTreeMap<String, InterfaceAddresses>) -> Option<String> {
    [InterfaceType::Ethernet, InterfaceType::Wireless]
        .iter()
        .find_map(|wanted| {
            interfaces
                .iter()
                .filter(|(name, _)| classify_interface(name) == *wanted)
                .find_map(|(_, addrs)| addrs.mac.as_ref())
        })
        .map(|mac| mac.to_lowercase())
}
