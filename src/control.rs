//! Hysteresis state machine deciding whether the charger may be connected
//!
//! Two thresholds keep the relay from chattering around a single trip point:
//! the charger is cut at or above `high` and only reconnected once the pack
//! has settled at or below `low`. A missing reading never moves the relay.

use crate::error::{ChargeGuardError, Result};
use crate::sampler::VoltageReading;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical state of the charger relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// Charger is allowed to charge the pack
    Connected,
    /// Charger is cut off (fail-safe state)
    Disconnected,
}

impl RelayState {
    /// The state chosen whenever information is missing or uncertain
    pub const FAIL_SAFE: RelayState = RelayState::Disconnected;
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Connected => write!(f, "connected"),
            RelayState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Immutable hysteresis pair in volts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    high: f64,
    low: f64,
}

impl Thresholds {
    /// Validate and build a threshold pair; `high` must exceed `low`
    pub fn new(high: f64, low: f64) -> Result<Self> {
        if !high.is_finite() || !low.is_finite() {
            return Err(ChargeGuardError::validation(
                "control.thresholds",
                "Thresholds must be finite numbers",
            ));
        }
        if high <= low {
            return Err(ChargeGuardError::validation(
                "control.low_threshold_v".to_string(),
                format!("Low threshold {low} V must be below high threshold {high} V"),
            ));
        }
        Ok(Self { high, low })
    }

    /// Disconnect at or above this voltage
    pub fn high(&self) -> f64 {
        self.high
    }

    /// Reconnect at or below this voltage
    pub fn low(&self) -> f64 {
        self.low
    }
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    /// Reading reached the high threshold while connected
    HighThresholdExceeded,
    /// Reading fell to the low threshold while disconnected
    LowThresholdRecovered,
    /// Reading did not cross the threshold relevant to the current state
    NoChange,
    /// No reading was available; state held
    FailsafeNoData,
    /// Loop is stopping; relay driven to the safe state
    Shutdown,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::HighThresholdExceeded => "high-threshold exceeded",
            DecisionReason::LowThresholdRecovered => "low-threshold recovered",
            DecisionReason::NoChange => "no-change",
            DecisionReason::FailsafeNoData => "failsafe-no-data",
            DecisionReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlDecision {
    pub previous: RelayState,
    pub target: RelayState,
    pub reason: DecisionReason,
    /// Voltage the decision was based on, if any
    pub volts: Option<f64>,
}

impl ControlDecision {
    /// Whether the relay has to move
    pub fn changed(&self) -> bool {
        self.previous != self.target
    }
}

/// Charger control state machine; sole owner of the relay state
#[derive(Debug, Clone)]
pub struct ChargerControl {
    state: RelayState,
    thresholds: Thresholds,
}

impl ChargerControl {
    pub fn new(thresholds: Thresholds, initial: RelayState) -> Self {
        Self {
            state: initial,
            thresholds,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Apply one reading (or its absence) and return the decision
    pub fn evaluate(&mut self, reading: Option<&VoltageReading>) -> ControlDecision {
        let previous = self.state;
        let Some(reading) = reading else {
            return ControlDecision {
                previous,
                target: previous,
                reason: DecisionReason::FailsafeNoData,
                volts: None,
            };
        };

        let volts = reading.volts();
        let (target, reason) = match previous {
            RelayState::Connected if volts >= self.thresholds.high => (
                RelayState::Disconnected,
                DecisionReason::HighThresholdExceeded,
            ),
            RelayState::Disconnected if volts <= self.thresholds.low => (
                RelayState::Connected,
                DecisionReason::LowThresholdRecovered,
            ),
            state => (state, DecisionReason::NoChange),
        };

        self.state = target;
        ControlDecision {
            previous,
            target,
            reason,
            volts: Some(volts),
        }
    }

    /// Transition to the fail-safe state ahead of stopping
    pub fn shutdown(&mut self) -> ControlDecision {
        let previous = self.state;
        self.state = RelayState::FAIL_SAFE;
        ControlDecision {
            previous,
            target: self.state,
            reason: DecisionReason::Shutdown,
            volts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(volts: f64) -> VoltageReading {
        VoltageReading::from_millivolts((volts * 1000.0).round() as i64, chrono::Utc::now())
    }

    fn fsm(initial: RelayState) -> ChargerControl {
        ChargerControl::new(Thresholds::new(24.8, 24.5).unwrap(), initial)
    }

    #[test]
    fn thresholds_require_high_above_low() {
        assert!(Thresholds::new(24.8, 24.5).is_ok());
        assert!(Thresholds::new(24.5, 24.5).is_err());
        assert!(Thresholds::new(24.0, 24.5).is_err());
        assert!(Thresholds::new(f64::NAN, 24.5).is_err());
    }

    #[test]
    fn connected_trips_at_high_threshold() {
        let mut c = fsm(RelayState::Connected);
        let d = c.evaluate(Some(&reading(24.8)));
        assert_eq!(d.target, RelayState::Disconnected);
        assert_eq!(d.reason, DecisionReason::HighThresholdExceeded);
        assert!(d.changed());
    }

    #[test]
    fn connected_holds_below_high() {
        let mut c = fsm(RelayState::Connected);
        let d = c.evaluate(Some(&reading(24.79)));
        assert_eq!(d.target, RelayState::Connected);
        assert_eq!(d.reason, DecisionReason::NoChange);
        assert!(!d.changed());
    }

    #[test]
    fn disconnected_recovers_at_low_threshold() {
        let mut c = fsm(RelayState::Disconnected);
        let d = c.evaluate(Some(&reading(24.5)));
        assert_eq!(d.target, RelayState::Connected);
        assert_eq!(d.reason, DecisionReason::LowThresholdRecovered);
    }

    #[test]
    fn hysteresis_band_never_reconnects() {
        let mut c = fsm(RelayState::Disconnected);
        let mut mv = 24_501;
        while mv < 24_800 {
            let r = VoltageReading::from_millivolts(mv, chrono::Utc::now());
            let d = c.evaluate(Some(&r));
            assert_eq!(d.target, RelayState::Disconnected, "{mv} mV");
            mv += 7;
        }
    }

    #[test]
    fn unavailable_reading_holds_state() {
        for initial in [RelayState::Connected, RelayState::Disconnected] {
            let mut c = fsm(initial);
            for _ in 0..20 {
                let d = c.evaluate(None);
                assert_eq!(d.target, initial);
                assert_eq!(d.reason, DecisionReason::FailsafeNoData);
                assert_eq!(d.volts, None);
            }
            assert_eq!(c.state(), initial);
        }
    }

    #[test]
    fn documented_sequence() {
        let mut c = fsm(RelayState::Disconnected);
        let states: Vec<_> = [24.2, 24.9, 24.6, 24.4]
            .iter()
            .map(|v| c.evaluate(Some(&reading(*v))).target)
            .collect();
        assert_eq!(
            states,
            vec![
                RelayState::Connected,
                RelayState::Disconnected,
                RelayState::Disconnected,
                RelayState::Connected
            ]
        );
    }

    #[test]
    fn shutdown_forces_fail_safe() {
        let mut c = fsm(RelayState::Connected);
        let d = c.shutdown();
        assert_eq!(d.previous, RelayState::Connected);
        assert_eq!(d.target, RelayState::Disconnected);
        assert_eq!(d.reason, DecisionReason::Shutdown);
        assert_eq!(c.state(), RelayState::Disconnected);
    }

    #[test]
    fn reason_display_matches_log_vocabulary() {
        assert_eq!(
            DecisionReason::HighThresholdExceeded.to_string(),
            "high-threshold exceeded"
        );
        assert_eq!(DecisionReason::FailsafeNoData.to_string(), "failsafe-no-data");
    }
}
