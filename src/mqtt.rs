//! MQTT bridge: the daemon's single broker connection.
//!
//! Producers publish through a cloneable handle without ever blocking on
//! the network; inbound messages are dispatched to the handler registered
//! for the most specific matching filter. The event-loop task owns
//! reconnection: bounded exponential backoff, a retained `offline` last
//! will, a retained `online` publish after every successful connect, and
//! re-subscription of every registered filter on every connect (the
//! broker may have dropped session state).

use crate::config::MqttConfig;
use crate::error::Result;
use crate::topic::{filter_matches, filter_specificity};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Capacity of the client's outbound request queue. Publishes beyond this
/// while disconnected are dropped, per the fire-and-forget QoS policy.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Inbound message handler. Must be non-blocking; long work is delegated
/// to a task via a channel.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Bounded exponential backoff for broker reconnection. The delay doubles
/// per consecutive failure up to `max` and resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Handle to the broker connection. Cheap to clone; safe to use from all
/// producer tasks concurrently.
#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    status_topic: String,
    backoff: Backoff,
}

impl MqttBridge {
    /// Build the client and event loop. No network I/O happens until the
    /// returned event loop is driven by [`run`](Self::run).
    pub fn connect(config: &MqttConfig, device: &str, status_topic: &str) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(format!("pibridge-{device}"), &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            status_topic,
            b"offline".to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let bridge = Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            status_topic: status_topic.to_string(),
            backoff: Backoff::new(Duration::from_secs(1), config.reconnect_max()),
        };
        (bridge, eventloop)
    }

    /// Register a handler for a topic filter. The subscription is issued
    /// on the next connect (and re-issued on every reconnect).
    pub fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: impl Fn(&str, &[u8]) + Send + Sync + 'static,
    ) {
        let filter = filter.into();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                filter: filter.clone(),
                qos,
                handler: Arc::new(handler),
            });

        if self.is_connected() {
            if let Err(e) = self.client.try_subscribe(&filter, qos) {
                tracing::error!(filter, error = %e, "subscribe failed");
            }
        }
    }

    /// Fire-and-forget publish: returns immediately regardless of
    /// connection state. Messages queue while disconnected; once the
    /// bounded queue is full they are dropped and logged.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) {
        if let Err(e) = self.client.try_publish(topic, qos, retain, payload) {
            tracing::debug!(topic, error = %e, "publish dropped");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Request a clean disconnect. Used only during shutdown, after the
    /// actuator has re-applied its safe defaults.
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| crate::error::BridgeError::broker(e.to_string()))
    }

    /// Drive the broker connection until shutdown is signaled. Never
    /// returns on broker unavailability; connection errors back off and
    /// retry indefinitely.
    pub async fn run(mut self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connect(),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::warn!("disconnected from MQTT broker");
                        self.connected.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.store(false, Ordering::Relaxed);
                        let delay = self.backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            retry_in_secs = delay.as_secs_f64(),
                            "MQTT connection error, backing off"
                        );
                        // The backoff sleep must not outlive a shutdown
                        // request; the daemon's grace period is shorter
                        // than the backoff cap.
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        tracing::info!("MQTT bridge stopped");
    }

    fn on_connect(&mut self) {
        tracing::info!("connected to MQTT broker");
        self.connected.store(true, Ordering::Relaxed);
        self.backoff.reset();

        let filters: Vec<(String, QoS)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect();
        for (filter, qos) in filters {
            if let Err(e) = self.client.try_subscribe(&filter, qos) {
                tracing::error!(filter, error = %e, "re-subscribe failed");
            }
        }

        // Liveness contract: retained online marker after every connect,
        // mirrored by the offline last will on unclean disconnect.
        self.publish(&self.status_topic, "online", QoS::AtLeastOnce, true);
    }

    /// Hand an inbound message to the most specific matching handler.
    /// Unmatched topics are dropped silently.
    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let best = subscriptions
            .iter()
            .filter(|s| filter_matches(&s.filter, topic))
            .max_by_key(|s| filter_specificity(&s.filter));

        match best {
            Some(subscription) => (subscription.handler)(topic, payload),
            None => tracing::debug!(topic, "no handler for topic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::TopicSet;

    fn test_config(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: None,
            password: None,
            reconnect_max_secs: 10,
            keep_alive_secs: 30,
        }
    }

    fn test_bridge() -> MqttBridge {
        let topics = TopicSet::new("testpi");
        let (bridge, _eventloop) = MqttBridge::connect(&test_config(1883), "testpi", &topics.status());
        bridge
    }

    /// Grab a free local port and release it, so connect attempts fail
    /// until a listener is started on it.
    fn reserve_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));

        let mut previous = Duration::ZERO;
        for _ in 0..8 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(10));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_connect_resets_backoff() {
        let mut bridge = test_bridge();
        bridge.backoff.next_delay();
        bridge.backoff.next_delay();
        assert_eq!(bridge.backoff.next_delay(), Duration::from_secs(4));

        bridge.on_connect();
        assert_eq!(bridge.backoff.next_delay(), Duration::from_secs(1));
    }

    /// The broker is unreachable at first; once a listener answers the
    /// CONNECT with a CONNACK the bridge must come up on its own.
    #[tokio::test]
    async fn test_reconnects_once_broker_becomes_reachable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let port = reserve_port();
        let (bridge, eventloop) =
            MqttBridge::connect(&test_config(port), "testpi", "testpi/status");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(bridge.clone().run(eventloop, shutdown_rx));

        // Let at least one connect attempt fail before the broker exists.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!bridge.is_connected());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        let broker = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 1024];
            if stream.read(&mut buf).await.is_ok() {
                // CONNACK: session not present, connection accepted.
                let _ = stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
            }
            // Hold the connection open until the test finishes.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !bridge.is_connected() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(bridge.is_connected());

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        broker.abort();
    }

    /// A shutdown arriving while the bridge sleeps between reconnect
    /// attempts must not wait out the remaining backoff delay.
    #[tokio::test]
    async fn test_shutdown_interrupts_backoff_sleep() {
        let port = reserve_port();
        let (bridge, eventloop) =
            MqttBridge::connect(&test_config(port), "testpi", "testpi/status");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(bridge.run(eventloop, shutdown_rx));

        // The refused connect puts the task into its first 1s backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("bridge stops during backoff sleep")
            .unwrap();
    }

    #[test]
    fn test_dispatch_most_specific_wins() {
        let bridge = test_bridge();
        let hits = Arc::new(Mutex::new(Vec::new()));

        for filter in ["testpi/#", "testpi/gpio/+/set", "testpi/gpio/fan/set"] {
            let hits = Arc::clone(&hits);
            let name = filter.to_string();
            bridge.subscribe(filter, QoS::AtLeastOnce, move |_, _| {
                hits.lock().unwrap().push(name.clone());
            });
        }

        bridge.dispatch("testpi/gpio/fan/set", b"on");
        bridge.dispatch("testpi/gpio/relay-1/set", b"on");
        bridge.dispatch("testpi/climate/temperature", b"21.5");

        assert_eq!(
            *hits.lock().unwrap(),
            vec!["testpi/gpio/fan/set", "testpi/gpio/+/set", "testpi/#"]
        );
    }

    #[test]
    fn test_dispatch_drops_unmatched() {
        let bridge = test_bridge();
        let hits = Arc::new(Mutex::new(0usize));

        let count = Arc::clone(&hits);
        bridge.subscribe("testpi/gpio/+/set", QoS::AtLeastOnce, move |_, _| {
            *count.lock().unwrap() += 1;
        });

        // Different device, wrong depth: silently ignored.
        bridge.dispatch("otherpi/gpio/fan/set", b"on");
        bridge.dispatch("testpi/gpio/fan/extra/set", b"on");
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_publish_is_fire_and_forget_while_disconnected() {
        let bridge = test_bridge();
        assert!(!bridge.is_connected());
        // Must not block or panic without a broker.
        for i in 0..10 {
            bridge.publish(
                "testpi/stats/cpu_usage",
                format!("{i}"),
                QoS::AtMostOnce,
                false,
            );
        }
    }
}
