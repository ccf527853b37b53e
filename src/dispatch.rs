//! GPIO command dispatcher.
//!
//! Subscribes to `<device>/gpio/+/set`, validates payload and target
//! function, and forwards accepted instructions to the actuator. Invalid
//! payloads and unknown functions are logged and dropped; commands arrive
//! at-least-once and the actuator's idempotent writes make duplicates
//! harmless. Successful actuations that changed a pin are confirmed on
//! `<device>/gpio/<function>/state`.
//!
//! The bridge handler itself only parses the topic and queues the
//! command; the actual hardware write happens on the dispatcher task.

use crate::error::{BridgeError, Result};
use crate::gpio::GpioActuator;
use crate::mqtt::MqttBridge;
use crate::topic::TopicSet;
use rumqttc::QoS;
use tokio::sync::{mpsc, watch, Mutex};

/// Queue depth between the bridge handler and the dispatcher task.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

/// A validated-by-topic (but not yet by content) inbound pin command.
#[derive(Debug, Clone)]
pub struct GpioCommand {
    pub function: String,
    pub payload: Vec<u8>,
}

/// Parse a command payload into a pin value. Accepted forms mirror the
/// original deployment: `1`/`on`/`true` and `0`/`off`/`false`,
/// case-insensitive.
pub fn parse_payload(payload: &[u8]) -> Result<bool> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| BridgeError::InvalidPayload("not valid UTF-8".to_string()))?;

    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        other => Err(BridgeError::InvalidPayload(format!(
            "unexpected value '{other}'"
        ))),
    }
}

/// Register the command subscription on the bridge. The handler stays
/// non-blocking: it extracts the function from the topic and queues the
/// command for the dispatcher task, dropping commands when the queue is
/// full (the publisher resends if it needs confirmation).
pub fn subscribe_commands(bridge: &MqttBridge, topics: &TopicSet, tx: mpsc::Sender<GpioCommand>) {
    let topics = topics.clone();
    bridge.subscribe(
        topics.gpio_set_filter(),
        QoS::AtLeastOnce,
        move |topic, payload| {
            let Some(function) = topics.function_from_set_topic(topic) else {
                tracing::debug!(topic, "ignoring non-command topic");
                return;
            };
            let command = GpioCommand {
                function: function.to_string(),
                payload: payload.to_vec(),
            };
            if tx.try_send(command).is_err() {
                tracing::warn!(topic, "command queue full, dropping command");
            }
        },
    );
}

/// Apply one command to the actuator. Returns the state confirmation to
/// publish, or `None` when the command was dropped or changed nothing.
pub async fn apply_command(
    actuator: &Mutex<GpioActuator>,
    topics: &TopicSet,
    command: &GpioCommand,
) -> Option<(String, String)> {
    let value = match parse_payload(&command.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(function = %command.function, error = %e, "dropping command");
            return None;
        }
    };

    let write = match actuator.lock().await.set(&command.function, value) {
        Ok(write) => write,
        Err(e @ BridgeError::UnknownFunction(_)) => {
            tracing::warn!(error = %e, "dropping command for unassigned function");
            return None;
        }
        Err(e) => {
            // Hardware fault: surfaced here, retried when the publisher
            // sends the next command.
            tracing::error!(function = %command.function, error = %e, "pin write failed");
            return None;
        }
    };

    if !write.changed {
        return None;
    }

    tracing::info!(function = %command.function, value, "pin set by command");
    let state = if value { "ON" } else { "OFF" };
    Some((topics.gpio_state(&command.function), state.to_string()))
}

/// Dispatcher task: drains the command queue until shutdown.
pub async fn run(
    actuator: std::sync::Arc<Mutex<GpioActuator>>,
    bridge: MqttBridge,
    topics: TopicSet,
    mut rx: mpsc::Receiver<GpioCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = rx.recv() => {
                let Some(command) = command else { break };
                if let Some((topic, state)) = apply_command(&actuator, &topics, &command).await {
                    bridge.publish(&topic, state, QoS::AtLeastOnce, true);
                }
            }
        }
    }
    tracing::info!("command dispatcher stopped");
}
