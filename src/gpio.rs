//! GPIO actuator owning the daemon's output pins.
//!
//! This is the only component that touches output pins. Both producers
//! (the command dispatcher and the fan control loop) go through it, and
//! the daemon serializes access with a mutex around the whole table.
//! Every assigned pin is driven to its safe default (de-energized) before
//! any command is accepted and again on shutdown.
//!
//! The hardware layer is feature-gated so the daemon builds and tests on
//! non-Pi systems.

use crate::error::{BridgeError, Result};
use std::collections::BTreeMap;

/// Result of a pin write: the value before the write, and whether the
/// write actually changed anything. Callers publish state confirmations
/// only when `changed` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinWrite {
    pub previous: bool,
    pub changed: bool,
}

/// Low-level pin write access. Implemented by the rppal backend on the Pi
/// and by an in-memory mock everywhere else.
pub trait PinBackend: Send {
    fn write(&mut self, pin: u8, high: bool) -> Result<()>;
}

/// The actuator: immutable function-to-pin assignments plus the current
/// state of every assigned pin.
pub struct GpioActuator {
    backend: Box<dyn PinBackend>,
    assignments: BTreeMap<String, u8>,
    states: BTreeMap<String, bool>,
}

impl GpioActuator {
    /// Create an actuator over the given backend and pin table. Pins are
    /// claimed by the backend; no write happens until
    /// [`apply_safe_defaults`](Self::apply_safe_defaults) is called.
    pub fn new(backend: Box<dyn PinBackend>, pins: &BTreeMap<String, u8>) -> Self {
        let states = pins.keys().map(|f| (f.clone(), false)).collect();
        Self {
            backend,
            assignments: pins.clone(),
            states,
        }
    }

    /// Create an actuator over the default backend for this build.
    pub fn with_default_backend(pins: &BTreeMap<String, u8>) -> Result<Self> {
        let backend = DefaultPinBackend::open(pins)?;
        Ok(Self::new(Box::new(backend), pins))
    }

    /// Set a pin function to a value. Idempotent: writing the current
    /// value succeeds with `changed: false` and does not touch hardware.
    pub fn set(&mut self, function: &str, value: bool) -> Result<PinWrite> {
        let &pin = self
            .assignments
            .get(function)
            .ok_or_else(|| BridgeError::UnknownFunction(function.to_string()))?;

        let previous = self.states[function];
        if previous == value {
            return Ok(PinWrite {
                previous,
                changed: false,
            });
        }

        self.backend.write(pin, value)?;
        self.states.insert(function.to_string(), value);

        tracing::debug!(function, pin, value, "pin written");

        Ok(PinWrite {
            previous,
            changed: true,
        })
    }

    /// Current value of a pin function.
    pub fn get(&self, function: &str) -> Result<bool> {
        self.states
            .get(function)
            .copied()
            .ok_or_else(|| BridgeError::UnknownFunction(function.to_string()))
    }

    /// All assigned function names.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.assignments.keys().map(String::as_str)
    }

    /// Drive every assigned pin to its safe default (de-energized).
    ///
    /// A failing pin does not stop the others from being written; the
    /// first error is returned after the sweep completes.
    pub fn apply_safe_defaults(&mut self) -> Result<()> {
        let mut first_err = None;
        for (function, &pin) in &self.assignments {
            if let Err(e) = self.backend.write(pin, false) {
                tracing::error!(function, pin, error = %e, "safe default write failed");
                first_err.get_or_insert(e);
            } else {
                self.states.insert(function.clone(), false);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "gpio")]
mod raspberry_pi {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};
    use std::collections::HashMap;

    /// Raspberry Pi pin backend using rppal. Claims every assigned pin as
    /// an output at construction so a bad assignment fails at startup,
    /// not on the first command.
    pub struct RppalBackend {
        pins: HashMap<u8, OutputPin>,
    }

    impl RppalBackend {
        pub fn open(assignments: &BTreeMap<String, u8>) -> Result<Self> {
            let gpio = Gpio::new()
                .map_err(|e| BridgeError::hardware(format!("failed to initialize GPIO: {e}")))?;

            let mut pins = HashMap::new();
            for (function, &pin) in assignments {
                let output = gpio
                    .get(pin)
                    .map_err(|e| {
                        BridgeError::hardware(format!(
                            "failed to claim pin {pin} for '{function}': {e}"
                        ))
                    })?
                    .into_output();
                pins.insert(pin, output);
            }

            Ok(Self { pins })
        }
    }

    impl PinBackend for RppalBackend {
        fn write(&mut self, pin: u8, high: bool) -> Result<()> {
            let output = self
                .pins
                .get_mut(&pin)
                .ok_or_else(|| BridgeError::hardware(format!("pin {pin} not claimed")))?;
            if high {
                output.set_high();
            } else {
                output.set_low();
            }
            Ok(())
        }
    }
}

mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Shared view into a [`MockPinBackend`]'s recorded writes, used by
    /// tests to assert on hardware effects.
    #[derive(Debug, Clone, Default)]
    pub struct MockPinLog {
        inner: Arc<Mutex<MockPinLogInner>>,
    }

    #[derive(Debug, Default)]
    struct MockPinLogInner {
        writes: Vec<(u8, bool)>,
        failing: HashSet<u8>,
    }

    impl MockPinLog {
        /// All writes in order, as `(pin, value)` pairs.
        pub fn writes(&self) -> Vec<(u8, bool)> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner).writes.clone()
        }

        /// Make writes to the given pin fail with a hardware fault.
        pub fn fail_pin(&self, pin: u8) {
            self.inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failing
                .insert(pin);
        }

        /// Stop failing writes to the given pin.
        pub fn restore_pin(&self, pin: u8) {
            self.inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failing
                .remove(&pin);
        }

        fn record(&self, pin: u8, high: bool) -> Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.failing.contains(&pin) {
                return Err(BridgeError::hardware(format!("injected fault on pin {pin}")));
            }
            inner.writes.push((pin, high));
            Ok(())
        }
    }

    /// In-memory pin backend for tests and non-Pi builds.
    pub struct MockPinBackend {
        log: MockPinLog,
    }

    impl MockPinBackend {
        pub fn new() -> Self {
            Self {
                log: MockPinLog::default(),
            }
        }

        pub fn open(_assignments: &BTreeMap<String, u8>) -> Result<Self> {
            tracing::warn!("GPIO support not compiled; pin writes are simulated");
            Ok(Self::new())
        }

        /// Handle for inspecting writes after the backend is boxed.
        pub fn log(&self) -> MockPinLog {
            self.log.clone()
        }
    }

    impl Default for MockPinBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PinBackend for MockPinBackend {
        fn write(&mut self, pin: u8, high: bool) -> Result<()> {
            self.log.record(pin, high)
        }
    }
}

pub use mock::{MockPinBackend, MockPinLog};

#[cfg(feature = "gpio")]
pub use raspberry_pi::RppalBackend as DefaultPinBackend;

#[cfg(not(feature = "gpio"))]
pub use mock::MockPinBackend as DefaultPinBackend;

#[cfg(test)]
mod tests {
    use super::*;

    fn pin_table() -> BTreeMap<String, u8> {
        [("fan".to_string(), 16), ("relay-1".to_string(), 26)]
            .into_iter()
            .collect()
    }

    fn actuator() -> (GpioActuator, MockPinLog) {
        let backend = MockPinBackend::new();
        let log = backend.log();
        (GpioActuator::new(Box::new(backend), &pin_table()), log)
    }

    #[test]
    fn test_read_after_write() {
        let (mut actuator, _) = actuator();
        for value in [true, false, true] {
            actuator.set("fan", value).unwrap();
            assert_eq!(actuator.get("fan").unwrap(), value);
        }
    }

    #[test]
    fn test_idempotent_set_skips_hardware() {
        let (mut actuator, log) = actuator();
        let first = actuator.set("fan", true).unwrap();
        assert!(first.changed);
        assert!(!first.previous);

        let second = actuator.set("fan", true).unwrap();
        assert!(!second.changed);
        assert!(second.previous);

        // Only the first set reached the hardware layer.
        assert_eq!(log.writes(), vec![(16, true)]);
    }

    #[test]
    fn test_unknown_function() {
        let (mut actuator, log) = actuator();
        assert!(matches!(
            actuator.set("heater", true),
            Err(BridgeError::UnknownFunction(_))
        ));
        assert!(matches!(
            actuator.get("heater"),
            Err(BridgeError::UnknownFunction(_))
        ));
        assert!(log.writes().is_empty());
    }

    #[test]
    fn test_safe_defaults_drive_all_pins_low() {
        let (mut actuator, log) = actuator();
        actuator.set("fan", true).unwrap();
        actuator.set("relay-1", true).unwrap();

        actuator.apply_safe_defaults().unwrap();

        assert!(!actuator.get("fan").unwrap());
        assert!(!actuator.get("relay-1").unwrap());
        let writes = log.writes();
        assert_eq!(&writes[writes.len() - 2..], &[(16, false), (26, false)]);
    }

    #[test]
    fn test_hardware_fault_keeps_state() {
        let (mut actuator, log) = actuator();
        log.fail_pin(16);

        assert!(matches!(
            actuator.set("fan", true),
            Err(BridgeError::Hardware(_))
        ));
        // State still reflects the last successful write.
        assert!(!actuator.get("fan").unwrap());

        // Retried on the next trigger once the fault clears.
        log.restore_pin(16);
        let write = actuator.set("fan", true).unwrap();
        assert!(write.changed);
        assert!(actuator.get("fan").unwrap());
    }

    #[test]
    fn test_safe_defaults_continue_past_faults() {
        let (mut actuator, log) = actuator();
        actuator.set("fan", true).unwrap();
        actuator.set("relay-1", true).unwrap();
        log.fail_pin(16);

        assert!(actuator.apply_safe_defaults().is_err());
        // The healthy pin was still driven low.
        assert!(!actuator.get("relay-1").unwrap());
        assert!(actuator.get("fan").unwrap());
    }
}
