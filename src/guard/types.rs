use crate::control::{ControlDecision, RelayState, Thresholds};
use crate::sampler::{SampleFailure, VoltageReading};
use crate::vedirect::DecoderStats;
use serde::Serialize;
use tokio::sync::oneshot;

/// Commands accepted by the control loop from its handles
#[derive(Debug)]
pub enum GuardCommand {
    /// Run one sample/decide/actuate cycle now and report the decision
    Evaluate(oneshot::Sender<ControlDecision>),
}

/// Notable things that happened inside the control loop
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardEvent {
    Started {
        state: RelayState,
        thresholds: Thresholds,
    },
    StateChanged {
        decision: ControlDecision,
    },
    /// Readings have been unavailable for the configured number of polls
    SensorLoss {
        consecutive_failures: u32,
        state: RelayState,
    },
    /// Readings have stayed unavailable long enough to need intervention
    SensorLossCritical {
        consecutive_failures: u32,
        state: RelayState,
    },
    TelemetryRecovered {
        after_failures: u32,
        volts: f64,
    },
    ActuationFailed {
        target: RelayState,
        message: String,
    },
    /// Relay changed state suspiciously often within the watch window
    RapidToggling {
        transitions: usize,
        window_secs: u64,
    },
    ShutdownComplete {
        state: RelayState,
    },
    ShutdownFailed {
        message: String,
    },
}

/// Point-in-time view of the control loop
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub timestamp: String,
    /// State decided by the state machine
    pub relay_state: RelayState,
    /// State last successfully written to the relay
    pub commanded_state: Option<RelayState>,
    pub last_reading: Option<VoltageReading>,
    pub last_decision: Option<ControlDecision>,
    pub last_failure: Option<SampleFailure>,
    pub consecutive_failures: u32,
    pub sensor_loss_active: bool,
    pub sensor_loss_critical: bool,
    pub total_polls: u64,
    pub actuation_failures: u64,
    pub relay_writes: u64,
    pub decoder: DecoderStats,
    pub thresholds: Thresholds,
    pub poll_interval_ms: u64,
}
