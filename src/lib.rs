//! # pibridge - Raspberry Pi hardware to MQTT bridge
//!
//! A long-running daemon that bridges Raspberry Pi hardware to an MQTT
//! broker: inbound commands drive GPIO output pins, a DHT22 sensor and
//! host metrics are published periodically, and a hysteresis control
//! loop drives an enclosure fan from measured temperature.
//!
//! ## Design
//!
//! - **Resilient by degradation**: broker or sensor unavailability is
//!   never fatal. The bridge reconnects with bounded backoff and the
//!   control loop holds its last state until valid data returns.
//! - **Hardware safety**: every assigned pin is driven to a safe default
//!   before commands are accepted and again on shutdown, before the
//!   broker connection is torn down.
//! - **Feature-gated hardware**: build with `--features gpio` on the Pi;
//!   other builds get deterministic mock backends.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pibridge::{config::Config, daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("bridge.toml")?;
//!     daemon::run(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod gpio;
pub mod mqtt;
pub mod sensor;
pub mod stats;
pub mod topic;

// Re-export public API
pub use config::Config;
pub use control::{ControlState, FanController};
pub use error::{BridgeError, Result};
pub use gpio::{GpioActuator, PinWrite};
pub use mqtt::MqttBridge;
pub use sensor::{SensorReader, SensorSample};
pub use stats::{HostStats, StatsSampler};
pub use topic::TopicSet;

/// The default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "bridge.toml";
