//! Daemon configuration, loaded once at startup from a TOML file.
//!
//! The daemon refuses to start on an invalid configuration: an undefined
//! pin table or inverted fan thresholds would leave the hardware in an
//! unknown state, which is the one failure mode this process must never
//! have.

use crate::error::{BridgeError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device identity used as the root of the topic namespace.
    /// Defaults to the hostname when unset.
    #[serde(default)]
    pub device: Option<String>,
    pub mqtt: MqttConfig,
    pub gpio: GpioConfig,
    pub sensor: SensorConfig,
    pub fan: FanConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Cap on the reconnect backoff delay, in seconds.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// Output pin assignment table.
#[derive(Debug, Clone, Deserialize)]
pub struct GpioConfig {
    /// Logical function name (kebab-case) to BCM pin number.
    pub pins: BTreeMap<String, u8>,
}

/// DHT22 sensor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// BCM pin the DHT22 data line is attached to.
    pub pin: u8,
    /// How often the climate task samples and publishes.
    #[serde(default = "default_sensor_interval_secs")]
    pub interval_secs: u64,
    /// Physical refresh floor of the sensor; reads requested faster than
    /// this return the cached sample.
    #[serde(default = "default_min_read_interval_secs")]
    pub min_read_interval_secs: u64,
    /// Read attempts before a sample is marked invalid.
    #[serde(default = "default_sensor_retries")]
    pub retries: u32,
}

/// Fan control loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FanConfig {
    /// Pin function driven by the control loop.
    #[serde(default = "default_fan_function")]
    pub function: String,
    /// Temperature (°C) at or above which the fan turns on.
    pub high_threshold: f64,
    /// Temperature (°C) at or below which the fan turns off.
    pub low_threshold: f64,
    #[serde(default = "default_fan_tick_secs")]
    pub tick_secs: u64,
}

/// Host metrics publication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_interval_secs")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_reconnect_max_secs() -> u64 {
    10
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_sensor_interval_secs() -> u64 {
    30
}

fn default_min_read_interval_secs() -> u64 {
    2
}

fn default_sensor_retries() -> u32 {
    3
}

fn default_fan_function() -> String {
    "fan".to_string()
}

fn default_fan_tick_secs() -> u64 {
    30
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| BridgeError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the cross-field invariants the daemon relies on.
    pub fn validate(&self) -> Result<()> {
        if self.gpio.pins.is_empty() {
            return Err(BridgeError::config("gpio.pins must not be empty"));
        }

        let mut seen: BTreeMap<u8, &str> = BTreeMap::new();
        for (function, &pin) in &self.gpio.pins {
            if !is_kebab_case(function) {
                return Err(BridgeError::config(format!(
                    "pin function '{function}' is not kebab-case"
                )));
            }
            if let Some(other) = seen.insert(pin, function.as_str()) {
                return Err(BridgeError::config(format!(
                    "pin {pin} assigned to both '{other}' and '{function}'"
                )));
            }
            if pin == self.sensor.pin {
                return Err(BridgeError::config(format!(
                    "pin {pin} assigned to '{function}' collides with the sensor pin"
                )));
            }
        }

        if !self.gpio.pins.contains_key(&self.fan.function) {
            return Err(BridgeError::config(format!(
                "fan function '{}' has no pin assignment",
                self.fan.function
            )));
        }

        if self.fan.low_threshold >= self.fan.high_threshold {
            return Err(BridgeError::config(format!(
                "fan low_threshold ({}) must be below high_threshold ({})",
                self.fan.low_threshold, self.fan.high_threshold
            )));
        }

        if self.sensor.retries == 0 {
            return Err(BridgeError::config("sensor.retries must be at least 1"));
        }

        for (name, secs) in [
            ("sensor.interval_secs", self.sensor.interval_secs),
            ("fan.tick_secs", self.fan.tick_secs),
            ("stats.interval_secs", self.stats.interval_secs),
            ("mqtt.reconnect_max_secs", self.mqtt.reconnect_max_secs),
        ] {
            if secs == 0 {
                return Err(BridgeError::config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }

    /// The device identity: configured value, or the hostname.
    pub fn device_id(&self) -> String {
        self.device
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "raspberrypi".to_string())
    }
}

impl SensorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_read_interval(&self) -> Duration {
        Duration::from_secs(self.min_read_interval_secs)
    }
}

impl FanConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl MqttConfig {
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Check that a pin function name is `kebab-case`: lowercase alphanumeric
/// runs separated by single hyphens.
pub fn is_kebab_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('-') || s.ends_with('-') || s.contains("--") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        device = "testpi"

        [mqtt]
        host = "broker.local"

        [gpio]
        pins = { fan = 16, relay-1 = 26 }

        [sensor]
        pin = 6

        [fan]
        high_threshold = 28.0
        low_threshold = 25.0
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::from_toml(BASE).unwrap();
        assert_eq!(config.device_id(), "testpi");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.gpio.pins["fan"], 16);
        assert_eq!(config.sensor.interval_secs, 30);
        assert_eq!(config.fan.function, "fan");
        assert_eq!(config.stats.interval_secs, 60);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let raw = BASE.replace("low_threshold = 25.0", "low_threshold = 30.0");
        let err = Config::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("high_threshold"));
    }

    #[test]
    fn test_rejects_duplicate_pin() {
        let raw = BASE.replace("relay-1 = 26", "relay-1 = 16");
        assert!(Config::from_toml(&raw).is_err());
    }

    #[test]
    fn test_rejects_sensor_pin_collision() {
        let raw = BASE.replace("pin = 6", "pin = 16");
        assert!(Config::from_toml(&raw).is_err());
    }

    #[test]
    fn test_rejects_missing_fan_function() {
        let raw = BASE.replace("fan = 16", "heater = 16");
        let err = Config::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("fan"));
    }

    #[test]
    fn test_rejects_non_kebab_function() {
        let raw = BASE.replace("relay-1 = 26", "\"Relay_1\" = 26");
        assert!(Config::from_toml(&raw).is_err());
    }

    #[test]
    fn test_kebab_case() {
        assert!(is_kebab_case("fan"));
        assert!(is_kebab_case("cpu-fan"));
        assert!(is_kebab_case("relay-1"));
        assert!(!is_kebab_case("CpuFan"));
        assert!(!is_kebab_case("cpu_fan"));
        assert!(!is_kebab_case("-fan"));
        assert!(!is_kebab_case("fan-"));
        assert!(!is_kebab_case("cpu--fan"));
        assert!(!is_kebab_case(""));
    }
}
