//! DHT22 single-wire protocol driver.
//!
//! The sensor is triggered by holding its data line low for a few
//! milliseconds; it answers with a presence pulse followed by 40 bits
//! encoded in the width of high pulses (~27µs for 0, ~70µs for 1). The
//! whole exchange takes under 6ms and is decoded by busy-waiting on edge
//! transitions, which is why the reader runs it on the blocking pool.
//!
//! Feature-gated like the actuator backend so non-Pi builds get a mock.

use crate::error::Result;

/// A single raw read attempt: `(temperature °C, humidity %RH)`.
/// Retries and caching live in [`SensorReader`](super::SensorReader).
pub trait Dht22Backend: Send {
    fn read(&mut self) -> Result<(f64, f64)>;
}

#[cfg(feature = "gpio")]
mod raspberry_pi {
    use super::*;
    use crate::error::BridgeError;
    use rppal::gpio::{Gpio, IoPin, Level, Mode};
    use std::time::{Duration, Instant};

    /// High pulses longer than this are decoded as a 1 bit.
    const BIT_THRESHOLD_US: u64 = 48;

    /// Per-edge timeout; generous against scheduling jitter but still
    /// bounds a wedged line to well under the reader's hard timeout.
    const EDGE_TIMEOUT_US: u64 = 300;

    pub struct Dht22Driver {
        pin: IoPin,
    }

    impl Dht22Driver {
        pub fn open(bcm_pin: u8) -> Result<Self> {
            let pin = Gpio::new()
                .map_err(|e| BridgeError::hardware(format!("failed to initialize GPIO: {e}")))?
                .get(bcm_pin)
                .map_err(|e| {
                    BridgeError::hardware(format!("failed to claim sensor pin {bcm_pin}: {e}"))
                })?
                .into_io(Mode::Input);
            Ok(Self { pin })
        }

        /// Busy-wait until the line reads `level`.
        fn wait_for(&self, level: Level, timeout_us: u64) -> Result<()> {
            let deadline = Instant::now() + Duration::from_micros(timeout_us);
            while self.pin.read() != level {
                if Instant::now() >= deadline {
                    return Err(BridgeError::SensorTimeout);
                }
            }
            Ok(())
        }

        /// Busy-wait until the line reads `level`, returning the elapsed
        /// time in microseconds.
        fn pulse_width(&self, until: Level, timeout_us: u64) -> Result<u64> {
            let start = Instant::now();
            let deadline = start + Duration::from_micros(timeout_us);
            while self.pin.read() != until {
                if Instant::now() >= deadline {
                    return Err(BridgeError::SensorTimeout);
                }
            }
            Ok(start.elapsed().as_micros() as u64)
        }
    }

    impl Dht22Backend for Dht22Driver {
        fn read(&mut self) -> Result<(f64, f64)> {
            // Start signal: hold the line low for at least 1ms, then
            // release it back to input (the pull-up raises it).
            self.pin.set_mode(Mode::Output);
            self.pin.set_low();
            std::thread::sleep(Duration::from_millis(3));
            self.pin.set_high();
            self.pin.set_mode(Mode::Input);

            // Presence pulse: ~80µs low, ~80µs high, then the first bit's
            // low preamble.
            self.wait_for(Level::Low, EDGE_TIMEOUT_US)?;
            self.wait_for(Level::High, EDGE_TIMEOUT_US)?;
            self.wait_for(Level::Low, EDGE_TIMEOUT_US)?;

            let mut frame = [0u8; 5];
            for bit in 0..40 {
                // 50µs low preamble, then a high pulse whose width is the bit.
                self.wait_for(Level::High, EDGE_TIMEOUT_US)?;
                let width = self.pulse_width(Level::Low, EDGE_TIMEOUT_US)?;
                if width > BIT_THRESHOLD_US {
                    frame[bit / 8] |= 1 << (7 - bit % 8);
                }
            }

            let sum = frame[..4].iter().map(|&b| b as u16).sum::<u16>();
            if frame[4] != (sum & 0xff) as u8 {
                return Err(BridgeError::ChecksumMismatch);
            }

            let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f64 / 10.0;
            let raw_temp = u16::from_be_bytes([frame[2] & 0x7f, frame[3]]) as f64 / 10.0;
            let temperature = if frame[2] & 0x80 != 0 {
                -raw_temp
            } else {
                raw_temp
            };

            Ok((temperature, humidity))
        }
    }
}

mod mock {
    use super::*;
    use crate::error::BridgeError;
    use std::collections::VecDeque;

    /// Scripted sensor backend for tests and non-Pi builds. Each entry is
    /// one read attempt: `Some` succeeds, `None` times out. An exhausted
    /// script keeps timing out.
    pub struct MockDht22 {
        readings: VecDeque<Option<(f64, f64)>>,
    }

    impl MockDht22 {
        pub fn with_readings(readings: impl IntoIterator<Item = Option<(f64, f64)>>) -> Self {
            Self {
                readings: readings.into_iter().collect(),
            }
        }

        /// A backend that always fails, for builds without sensor access.
        pub fn disconnected() -> Self {
            Self::with_readings([])
        }

        pub fn open(_bcm_pin: u8) -> Result<Self> {
            tracing::warn!("sensor support not compiled; all reads will fail");
            Ok(Self::disconnected())
        }
    }

    impl Dht22Backend for MockDht22 {
        fn read(&mut self) -> Result<(f64, f64)> {
            match self.readings.pop_front() {
                Some(Some(reading)) => Ok(reading),
                _ => Err(BridgeError::SensorTimeout),
            }
        }
    }
}

pub use mock::MockDht22;

#[cfg(feature = "gpio")]
pub use raspberry_pi::Dht22Driver as DefaultSensorBackend;

#[cfg(not(feature = "gpio"))]
pub use mock::MockDht22 as DefaultSensorBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_mock_script_order() {
        let mut sensor = MockDht22::with_readings([Some((21.0, 40.0)), None, Some((22.0, 41.0))]);
        assert_eq!(sensor.read().unwrap(), (21.0, 40.0));
        assert!(matches!(sensor.read(), Err(BridgeError::SensorTimeout)));
        assert_eq!(sensor.read().unwrap(), (22.0, 41.0));
        assert!(sensor.read().is_err());
    }

    #[test]
    fn test_disconnected_always_fails() {
        let mut sensor = MockDht22::disconnected();
        assert!(sensor.read().is_err());
        assert!(sensor.read().is_err());
    }
}
