//! Task wiring and lifecycle for the bridge daemon.
//!
//! Each ticking activity (climate sampling, fan control, host metrics,
//! command dispatch, the broker event loop) runs as its own tokio task so
//! the timing-sensitive sensor read can never stall command handling.
//!
//! Shutdown ordering matters: tick loops stop first, then the actuator
//! re-applies its safe defaults, and only then is the broker connection
//! torn down. Hardware safety before network teardown.

use crate::config::Config;
use crate::control::{ControlState, FanController};
use crate::dispatch::{self, COMMAND_QUEUE_CAPACITY};
use crate::error::Result;
use crate::gpio::GpioActuator;
use crate::mqtt::MqttBridge;
use crate::sensor::{DefaultSensorBackend, SensorReader, SensorSample};
use crate::stats::StatsSampler;
use crate::topic::TopicSet;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// How long to wait for tick tasks to finish during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long to let the event loop flush the final offline publish.
const OFFLINE_FLUSH_DELAY: Duration = Duration::from_millis(250);

/// Run the daemon until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let device = config.device_id();
    let topics = TopicSet::new(&device);
    tracing::info!(device, broker = %config.mqtt.host, "starting bridge daemon");

    // Hardware first: every assigned pin is driven to its safe default
    // before any command or control input is accepted.
    let mut actuator = GpioActuator::with_default_backend(&config.gpio.pins)?;
    actuator.apply_safe_defaults()?;
    let actuator = Arc::new(Mutex::new(actuator));

    let sensor_backend = DefaultSensorBackend::open(config.sensor.pin)?;
    let reader = SensorReader::new(
        Box::new(sensor_backend),
        config.sensor.min_read_interval(),
        config.sensor.retries,
    );

    let (bridge, eventloop) = MqttBridge::connect(&config.mqtt, &device, &topics.status());

    // Tick loops and the bridge stop on separate signals: the bridge must
    // outlive the others to flush the final state publishes.
    let (ticks_tx, ticks_rx) = watch::channel(false);
    let (bridge_tx, bridge_rx) = watch::channel(false);

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    dispatch::subscribe_commands(&bridge, &topics, command_tx);

    let bridge_task = tokio::spawn(bridge.clone().run(eventloop, bridge_rx));

    // The fan loop observes the climate task's samples through a watch
    // channel rather than polling the sensor itself.
    let (sample_tx, sample_rx) = watch::channel(None::<SensorSample>);

    let tick_tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(dispatch::run(
            Arc::clone(&actuator),
            bridge.clone(),
            topics.clone(),
            command_rx,
            ticks_rx.clone(),
        )),
        tokio::spawn(climate_task(
            reader,
            bridge.clone(),
            topics.clone(),
            config.sensor.interval(),
            sample_tx,
            ticks_rx.clone(),
        )),
        tokio::spawn(stats_task(
            bridge.clone(),
            topics.clone(),
            config.stats.interval(),
            ticks_rx.clone(),
        )),
        tokio::spawn(fan_task(
            FanController::new(config.fan.high_threshold, config.fan.low_threshold),
            config.fan.function.clone(),
            Arc::clone(&actuator),
            bridge.clone(),
            topics.clone(),
            config.fan.tick(),
            sample_rx,
            ticks_rx,
        )),
    ];

    wait_for_signal().await?;
    tracing::info!("shutdown signal received, stopping tick loops");

    let _ = ticks_tx.send(true);
    for task in tick_tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!("task did not stop within the shutdown grace period");
        }
    }

    if let Err(e) = actuator.lock().await.apply_safe_defaults() {
        tracing::error!(error = %e, "failed to re-apply safe defaults on shutdown");
    }

    // Best-effort retained offline marker for clean shutdowns; unclean
    // ones are covered by the last will.
    bridge.publish(&topics.status(), "offline", QoS::AtLeastOnce, true);
    tokio::time::sleep(OFFLINE_FLUSH_DELAY).await;
    if let Err(e) = bridge.disconnect().await {
        tracing::debug!(error = %e, "disconnect failed");
    }
    let _ = bridge_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, bridge_task).await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Climate tick: sample the sensor, publish valid readings, and feed the
/// fan control loop.
async fn climate_task(
    mut reader: SensorReader,
    bridge: MqttBridge,
    topics: TopicSet,
    interval: Duration,
    sample_tx: watch::Sender<Option<SensorSample>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let sample = reader.read().await;
                if sample.valid {
                    bridge.publish(
                        &topics.climate_temperature(),
                        format!("{:.2}", sample.temperature_c),
                        QoS::AtMostOnce,
                        false,
                    );
                    bridge.publish(
                        &topics.climate_humidity(),
                        format!("{:.2}", sample.humidity_pct),
                        QoS::AtMostOnce,
                        false,
                    );
                }
                let _ = sample_tx.send(Some(sample));
            }
        }
    }
    tracing::info!("climate task stopped");
}

/// Fan control tick: evaluate the hysteresis state machine against the
/// latest sample and drive the fan pin on transitions.
#[allow(clippy::too_many_arguments)]
async fn fan_task(
    mut controller: FanController,
    function: String,
    actuator: Arc<Mutex<GpioActuator>>,
    bridge: MqttBridge,
    topics: TopicSet,
    tick: Duration,
    sample_rx: watch::Receiver<Option<SensorSample>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let sample = sample_rx.borrow().clone();
                let Some(sample) = sample else { continue };
                let Some(next) = controller.evaluate(&sample) else { continue };

                let previous = match next {
                    ControlState::On => ControlState::Off,
                    ControlState::Off => ControlState::On,
                };

                match actuator.lock().await.set(&function, next.is_on()) {
                    Ok(_) => {
                        tracing::info!(
                            state = next.as_str(),
                            temperature = sample.temperature_c,
                            "fan transition"
                        );
                        bridge.publish(&topics.fan_state(), next.as_str(), QoS::AtLeastOnce, true);
                        bridge.publish(
                            &topics.gpio_state(&function),
                            next.as_str(),
                            QoS::AtLeastOnce,
                            true,
                        );
                    }
                    Err(e) => {
                        // Hold the previous state so the transition is
                        // retried on the next tick.
                        tracing::error!(error = %e, "fan pin write failed");
                        controller.hold(previous);
                    }
                }
            }
        }
    }
    tracing::info!("fan control task stopped");
}

/// Stats tick: publish host metrics individually and as one JSON document.
async fn stats_task(
    bridge: MqttBridge,
    topics: TopicSet,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sampler = StatsSampler::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let stats = sampler.sample();
                for (metric, value) in stats.metrics() {
                    bridge.publish(
                        &topics.stat(metric),
                        format!("{value:.2}"),
                        QoS::AtMostOnce,
                        false,
                    );
                }
                match serde_json::to_string(&stats) {
                    Ok(json) => bridge.publish(&topics.stats(), json, QoS::AtMostOnce, false),
                    Err(e) => tracing::error!(error = %e, "failed to serialize stats"),
                }
            }
        }
    }
    tracing::info!("stats task stopped");
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
