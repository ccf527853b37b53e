//! Device-scoped MQTT topic namespace and wildcard matching.
//!
//! Topic strings are built once at startup and stay stable for the
//! process lifetime: one canonical publish topic per datum, one canonical
//! command topic per actuator.

/// Builder for the daemon's topic namespace, rooted at the device identity.
#[derive(Debug, Clone)]
pub struct TopicSet {
    device: String,
}

impl TopicSet {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// `<device>/status` — `online` on connect, `offline` via last will.
    pub fn status(&self) -> String {
        format!("{}/status", self.device)
    }

    /// Command topic for a pin function.
    pub fn gpio_set(&self, function: &str) -> String {
        format!("{}/gpio/{}/set", self.device, function)
    }

    /// Confirmation topic for a pin function.
    pub fn gpio_state(&self, function: &str) -> String {
        format!("{}/gpio/{}/state", self.device, function)
    }

    /// Subscription filter covering every pin command topic.
    pub fn gpio_set_filter(&self) -> String {
        format!("{}/gpio/+/set", self.device)
    }

    pub fn climate_temperature(&self) -> String {
        format!("{}/climate/temperature", self.device)
    }

    pub fn climate_humidity(&self) -> String {
        format!("{}/climate/humidity", self.device)
    }

    pub fn fan_state(&self) -> String {
        format!("{}/climate/fan/state", self.device)
    }

    /// Combined stats document topic.
    pub fn stats(&self) -> String {
        format!("{}/stats", self.device)
    }

    /// Individual metric topic under the stats namespace.
    pub fn stat(&self, metric: &str) -> String {
        format!("{}/stats/{}", self.device, metric)
    }

    /// Extract the pin function from a `<device>/gpio/<function>/set` topic.
    pub fn function_from_set_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.device.as_str())?;
        let rest = rest.strip_prefix("/gpio/")?;
        rest.strip_suffix("/set").filter(|f| !f.is_empty() && !f.contains('/'))
    }
}

/// MQTT topic filter matching with `+` (single level) and `#` (multi level,
/// final position only) wildcards.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Specificity of a filter: the number of literal (non-wildcard) levels.
/// When several registered filters match an inbound topic, the most
/// specific one wins.
pub fn filter_specificity(filter: &str) -> usize {
    filter
        .split('/')
        .filter(|level| *level != "+" && *level != "#")
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_namespace() {
        let topics = TopicSet::new("octopi");
        assert_eq!(topics.status(), "octopi/status");
        assert_eq!(topics.gpio_set("fan"), "octopi/gpio/fan/set");
        assert_eq!(topics.gpio_state("relay-1"), "octopi/gpio/relay-1/state");
        assert_eq!(topics.gpio_set_filter(), "octopi/gpio/+/set");
        assert_eq!(topics.climate_temperature(), "octopi/climate/temperature");
        assert_eq!(topics.fan_state(), "octopi/climate/fan/state");
        assert_eq!(topics.stat("cpu_usage"), "octopi/stats/cpu_usage");
    }

    #[test]
    fn test_function_from_set_topic() {
        let topics = TopicSet::new("octopi");
        assert_eq!(
            topics.function_from_set_topic("octopi/gpio/fan/set"),
            Some("fan")
        );
        assert_eq!(
            topics.function_from_set_topic("octopi/gpio/relay-1/set"),
            Some("relay-1")
        );
        assert_eq!(topics.function_from_set_topic("octopi/gpio/fan/state"), None);
        assert_eq!(topics.function_from_set_topic("other/gpio/fan/set"), None);
        assert_eq!(topics.function_from_set_topic("octopi/gpio//set"), None);
        assert_eq!(
            topics.function_from_set_topic("octopi/gpio/a/b/set"),
            None
        );
    }

    #[test]
    fn test_filter_matching() {
        assert!(filter_matches("pi/gpio/+/set", "pi/gpio/fan/set"));
        assert!(filter_matches("pi/#", "pi/gpio/fan/set"));
        assert!(filter_matches("pi/gpio/fan/set", "pi/gpio/fan/set"));
        assert!(!filter_matches("pi/gpio/+/set", "pi/gpio/fan/state"));
        assert!(!filter_matches("pi/gpio/+/set", "pi/gpio/fan/extra/set"));
        assert!(!filter_matches("pi/gpio/+/set", "pi/gpio/set"));
        assert!(!filter_matches("other/gpio/+/set", "pi/gpio/fan/set"));
    }

    #[test]
    fn test_filter_specificity() {
        assert!(filter_specificity("pi/gpio/fan/set") > filter_specificity("pi/gpio/+/set"));
        assert!(filter_specificity("pi/gpio/+/set") > filter_specificity("pi/#"));
    }
}
