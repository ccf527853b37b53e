//! DHT22 sensor reading with retries, a minimum inter-read interval, and
//! explicit sample validity.
//!
//! The DHT22 is unreliable on a single read and must not be polled more
//! than once every couple of seconds. The reader absorbs both quirks:
//! transient failures are retried a bounded number of times, and callers
//! asking faster than the physical refresh floor get the cached sample.

pub mod dht22;

pub use dht22::{DefaultSensorBackend, Dht22Backend, MockDht22};

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A timestamped temperature/humidity sample.
///
/// Samples with `valid: false` are never published as telemetry and never
/// drive a fan control transition; their numeric fields hold the last
/// known readings and are not meaningful on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSample {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub read_at: DateTime<Utc>,
    pub valid: bool,
}

impl SensorSample {
    pub fn valid(temperature_c: f64, humidity_pct: f64) -> Self {
        Self {
            temperature_c,
            humidity_pct,
            read_at: Utc::now(),
            valid: true,
        }
    }

    pub fn invalid(temperature_c: f64, humidity_pct: f64) -> Self {
        Self {
            temperature_c,
            humidity_pct,
            read_at: Utc::now(),
            valid: false,
        }
    }
}

/// Owns exclusive access to the DHT22 line.
pub struct SensorReader {
    backend: Arc<Mutex<Box<dyn Dht22Backend>>>,
    min_interval: Duration,
    retries: u32,
    retry_delay: Duration,
    read_timeout: Duration,
    last: Option<SensorSample>,
    last_valid: Option<SensorSample>,
    last_poll: Option<Instant>,
}

impl SensorReader {
    pub fn new(backend: Box<dyn Dht22Backend>, min_interval: Duration, retries: u32) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            min_interval,
            retries: retries.max(1),
            retry_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(2),
            last: None,
            last_valid: None,
            last_poll: None,
        }
    }

    /// Set the delay between retry attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the hard timeout on a single hardware read.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// The most recent sample, valid or not.
    pub fn last_sample(&self) -> Option<&SensorSample> {
        self.last.as_ref()
    }

    /// Read the sensor, respecting the minimum inter-read interval.
    ///
    /// Always returns a sample: a failed read (after bounded retries)
    /// yields one marked invalid rather than an error, so tick loops can
    /// treat the result uniformly. Reads requested faster than the
    /// interval return the last valid sample without touching hardware
    /// (or the last invalid one when nothing valid was ever read).
    pub async fn read(&mut self) -> SensorSample {
        if let Some(at) = self.last_poll {
            if at.elapsed() < self.min_interval {
                if let Some(cached) = self.last_valid.as_ref().or(self.last.as_ref()) {
                    return cached.clone();
                }
            }
        }
        self.last_poll = Some(Instant::now());

        for attempt in 1..=self.retries {
            match self.poll().await {
                Ok((temperature_c, humidity_pct)) => {
                    let sample = SensorSample::valid(temperature_c, humidity_pct);
                    self.last = Some(sample.clone());
                    self.last_valid = Some(sample.clone());
                    return sample;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "sensor read attempt failed");
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        tracing::warn!(retries = self.retries, "sensor read failed, marking sample invalid");
        let (temperature_c, humidity_pct) = self
            .last
            .as_ref()
            .map(|s| (s.temperature_c, s.humidity_pct))
            .unwrap_or((0.0, 0.0));
        let sample = SensorSample::invalid(temperature_c, humidity_pct);
        self.last = Some(sample.clone());
        sample
    }

    /// One hardware read on the blocking pool, bounded by the read timeout.
    /// The DHT22 protocol busy-waits on microsecond edges, so it must not
    /// run on the async worker threads.
    async fn poll(&self) -> Result<(f64, f64)> {
        let backend = Arc::clone(&self.backend);
        let read = tokio::task::spawn_blocking(move || {
            backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .read()
        });

        match tokio::time::timeout(self.read_timeout, read).await {
            Err(_) => Err(BridgeError::SensorTimeout),
            Ok(Err(join)) => Err(BridgeError::hardware(format!("sensor task failed: {join}"))),
            Ok(Ok(result)) => result,
        }
    }
}
