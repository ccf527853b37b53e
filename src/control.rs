//! Hysteresis fan control.
//!
//! Two thresholds instead of one set-point: the fan turns on at or above
//! `high_threshold` and off at or below `low_threshold`, so temperatures
//! wandering inside the band never toggle the pin. The state machine is
//! pure; the surrounding task in the daemon drives the actuator and
//! publishes transitions.

use crate::sensor::SensorSample;

/// Fan control loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Off,
    On,
}

impl ControlState {
    /// Wire representation on the fan state topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

/// The hysteresis state machine. Thresholds are immutable for its
/// lifetime; `low < high` is enforced at config load.
pub struct FanController {
    high_threshold: f64,
    low_threshold: f64,
    state: ControlState,
    last_transition: Option<SensorSample>,
}

impl FanController {
    pub fn new(high_threshold: f64, low_threshold: f64) -> Self {
        Self {
            high_threshold,
            low_threshold,
            state: ControlState::Off,
            last_transition: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// The sample that triggered the most recent transition.
    pub fn last_transition(&self) -> Option<&SensorSample> {
        self.last_transition.as_ref()
    }

    /// Evaluate one sample. Returns the new state on a transition, `None`
    /// otherwise. Invalid samples never transition: the loop holds its
    /// previous state until a valid sample arrives.
    pub fn evaluate(&mut self, sample: &SensorSample) -> Option<ControlState> {
        if !sample.valid {
            return None;
        }

        let next = match self.state {
            ControlState::Off if sample.temperature_c >= self.high_threshold => ControlState::On,
            ControlState::On if sample.temperature_c <= self.low_threshold => ControlState::Off,
            _ => return None,
        };

        self.state = next;
        self.last_transition = Some(sample.clone());
        Some(next)
    }

    /// Force the state back to `state` after a failed actuation, so the
    /// transition is retried on the next tick.
    pub fn hold(&mut self, state: ControlState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(temperature_c: f64) -> SensorSample {
        SensorSample::valid(temperature_c, 50.0)
    }

    #[test]
    fn test_initial_state_is_off() {
        let controller = FanController::new(28.0, 25.0);
        assert_eq!(controller.state(), ControlState::Off);
    }

    #[test]
    fn test_hysteresis_sequence() {
        // With thresholds 28.0/25.0, [24, 26, 29, 27, 24] transitions at
        // index 2 (on) and index 4 (off) only.
        let mut controller = FanController::new(28.0, 25.0);
        let transitions: Vec<_> = [24.0, 26.0, 29.0, 27.0, 24.0]
            .iter()
            .map(|&t| controller.evaluate(&sample(t)))
            .collect();

        assert_eq!(
            transitions,
            vec![
                None,
                None,
                Some(ControlState::On),
                None,
                Some(ControlState::Off)
            ]
        );
    }

    #[test]
    fn test_no_oscillation_inside_band() {
        let mut controller = FanController::new(28.0, 25.0);
        assert_eq!(controller.evaluate(&sample(30.0)), Some(ControlState::On));
        for t in [26.0, 27.9, 25.1, 26.5] {
            assert_eq!(controller.evaluate(&sample(t)), None);
            assert_eq!(controller.state(), ControlState::On);
        }
    }

    #[test]
    fn test_threshold_boundaries_inclusive() {
        let mut controller = FanController::new(28.0, 25.0);
        assert_eq!(controller.evaluate(&sample(28.0)), Some(ControlState::On));
        assert_eq!(controller.evaluate(&sample(25.0)), Some(ControlState::Off));
    }

    #[test]
    fn test_invalid_sample_holds_state() {
        let mut controller = FanController::new(28.0, 25.0);
        controller.evaluate(&sample(30.0));

        let bad = SensorSample::invalid(10.0, 50.0);
        assert_eq!(controller.evaluate(&bad), None);
        assert_eq!(controller.state(), ControlState::On);
    }

    #[test]
    fn test_hold_allows_retry() {
        let mut controller = FanController::new(28.0, 25.0);
        assert_eq!(controller.evaluate(&sample(30.0)), Some(ControlState::On));

        // The actuation failed; hold Off and the next tick re-transitions.
        controller.hold(ControlState::Off);
        assert_eq!(controller.evaluate(&sample(30.0)), Some(ControlState::On));
    }

    #[test]
    fn test_last_transition_records_sample() {
        let mut controller = FanController::new(28.0, 25.0);
        controller.evaluate(&sample(24.0));
        assert!(controller.last_transition().is_none());

        controller.evaluate(&sample(29.0));
        let recorded = controller.last_transition().unwrap();
        assert_eq!(recorded.temperature_c, 29.0);
    }
}
