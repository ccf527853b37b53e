//! Host metrics sampling using sysinfo and direct /proc and /sys access.
//!
//! Stateless apart from sysinfo's refresh bookkeeping. Every metric is
//! read independently: a failure (missing thermal zone, no vcgencmd) only
//! omits that metric from the published set.

use serde::Serialize;
use std::fs;
use sysinfo::{Disks, System};

/// One round of host metrics. `None` means the metric could not be read
/// this tick; it is skipped in both the per-metric topics and the
/// combined JSON document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_1m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_5m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_15m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<bool>,
}

impl HostStats {
    /// The metrics that were successfully read, as `(name, value)` pairs
    /// for the per-metric stats topics.
    pub fn metrics(&self) -> Vec<(&'static str, f64)> {
        let mut metrics = Vec::new();
        let mut push = |name, value: Option<f64>| {
            if let Some(v) = value {
                metrics.push((name, v));
            }
        };
        push("cpu_usage", self.cpu_usage);
        push("memory_usage", self.memory_usage);
        push("disk_usage_percent", self.disk_usage_percent);
        push("load_1m", self.load_1m);
        push("load_5m", self.load_5m);
        push("load_15m", self.load_15m);
        push("temperature", self.temperature);
        push("throttled", self.throttled.map(|t| if t { 1.0 } else { 0.0 }));
        metrics
    }
}

/// Host metrics sampler over sysinfo plus Raspberry Pi specific sources.
pub struct StatsSampler {
    system: System,
    disks: Disks,
}

impl StatsSampler {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let disks = Disks::new_with_refreshed_list();
        Self { system, disks }
    }

    /// Collect one round of metrics. Never fails as a whole.
    pub fn sample(&mut self) -> HostStats {
        self.system.refresh_all();
        self.disks.refresh();

        let load = read_load_average();

        HostStats {
            cpu_usage: self.cpu_usage(),
            memory_usage: self.memory_usage(),
            disk_usage_percent: self.disk_usage(),
            load_1m: load.map(|l| l.0),
            load_5m: load.map(|l| l.1),
            load_15m: load.map(|l| l.2),
            temperature: read_soc_temperature(),
            throttled: read_throttled(),
        }
    }

    fn cpu_usage(&self) -> Option<f64> {
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return None;
        }
        let total: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        Some((total / cpus.len() as f32) as f64)
    }

    fn memory_usage(&self) -> Option<f64> {
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some(self.system.used_memory() as f64 / total as f64 * 100.0)
    }

    /// Usage of the root filesystem, or of the largest disk when no mount
    /// is reported at `/`.
    fn disk_usage(&self) -> Option<f64> {
        let disk = self
            .disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.iter().max_by_key(|d| d.total_space()))?;

        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total - disk.available_space();
        Some(used as f64 / total as f64 * 100.0)
    }
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Read system load averages from /proc/loadavg.
fn read_load_average() -> Option<(f64, f64, f64)> {
    let loadavg = fs::read_to_string("/proc/loadavg").ok()?;
    let mut parts = loadavg.split_whitespace();
    let one = parts.next()?.parse().ok()?;
    let five = parts.next()?.parse().ok()?;
    let fifteen = parts.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

/// SoC temperature from the kernel thermal zone, falling back to
/// vcgencmd on Pi images that expose neither consistently.
fn read_soc_temperature() -> Option<f64> {
    if let Ok(raw) = fs::read_to_string("/sys/class/thermal/thermal_zone0/temp") {
        if let Ok(millicelsius) = raw.trim().parse::<i64>() {
            return Some(millicelsius as f64 / 1000.0);
        }
    }

    let output = std::process::Command::new("vcgencmd")
        .arg("measure_temp")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_vcgencmd_temp(&String::from_utf8_lossy(&output.stdout))
}

/// Thermal throttling state via vcgencmd (Raspberry Pi specific).
fn read_throttled() -> Option<bool> {
    let output = std::process::Command::new("vcgencmd")
        .arg("get_throttled")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_throttled(&String::from_utf8_lossy(&output.stdout))
}

fn parse_vcgencmd_temp(output: &str) -> Option<f64> {
    output
        .trim()
        .strip_prefix("temp=")?
        .strip_suffix("'C")?
        .parse()
        .ok()
}

fn parse_throttled(output: &str) -> Option<bool> {
    let hex = output.trim().strip_prefix("throttled=0x")?;
    let value = u32::from_str_radix(hex, 16).ok()?;
    // Bit 1: arm frequency capped, bit 2: currently throttled,
    // bit 3: soft temperature limit active.
    Some(value & 0x000e != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_skip_unread_values() {
        let stats = HostStats {
            cpu_usage: Some(12.5),
            memory_usage: Some(40.0),
            temperature: None,
            throttled: Some(false),
            ..Default::default()
        };

        let metrics = stats.metrics();
        assert!(metrics.contains(&("cpu_usage", 12.5)));
        assert!(metrics.contains(&("throttled", 0.0)));
        assert!(!metrics.iter().any(|(name, _)| *name == "temperature"));
        assert!(!metrics.iter().any(|(name, _)| *name == "load_1m"));
    }

    #[test]
    fn test_json_skips_unread_values() {
        let stats = HostStats {
            cpu_usage: Some(12.5),
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("cpu_usage"));
        assert!(!json.contains("temperature"));
    }

    #[test]
    fn test_parse_vcgencmd_temp() {
        assert_eq!(parse_vcgencmd_temp("temp=48.3'C\n"), Some(48.3));
        assert_eq!(parse_vcgencmd_temp("temp=48.3'C"), Some(48.3));
        assert_eq!(parse_vcgencmd_temp("garbage"), None);
    }

    #[test]
    fn test_parse_throttled() {
        assert_eq!(parse_throttled("throttled=0x0\n"), Some(false));
        assert_eq!(parse_throttled("throttled=0x50000\n"), Some(false));
        assert_eq!(parse_throttled("throttled=0x4\n"), Some(true));
        assert_eq!(parse_throttled("nope"), None);
    }

    #[test]
    fn test_sampler_never_panics() {
        let mut sampler = StatsSampler::new();
        let stats = sampler.sample();
        // On any Linux host at least CPU and memory should be readable.
        assert!(stats.cpu_usage.is_some());
        assert!(stats.memory_usage.is_some());
    }
}
