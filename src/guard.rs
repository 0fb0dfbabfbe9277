//! Charger control loop for chargeguard
//!
//! [`ChargeGuard`] owns the sampler, the hysteresis state machine and the
//! relay driver, and runs them from a single task so no two actuations ever
//! overlap. Everything outside the loop talks to it through a cloneable
//! [`GuardHandle`].

use crate::config::Config;
use crate::control::{ChargerControl, ControlDecision, RelayState};
use crate::error::{ChargeGuardError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::relay::{ActuatorDriver, OutputLine, Polarity};
use crate::sampler::{VoltageReading, VoltageSampler};
use crate::telemetry::TelemetrySource;
use crate::vedirect::FrameDecoder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

mod commands;
mod runtime;
mod snapshot;
mod toggle;
mod types;

pub use types::{GuardCommand, GuardEvent, GuardSnapshot};

use toggle::ToggleMonitor;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Battery-protecting charger controller
pub struct ChargeGuard {
    config: Config,
    sampler: VoltageSampler,
    fsm: ChargerControl,
    actuator: ActuatorDriver,
    toggles: ToggleMonitor,
    logger: StructuredLogger,

    commands_tx: mpsc::UnboundedSender<GuardCommand>,
    commands_rx: mpsc::UnboundedReceiver<GuardCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<Arc<GuardSnapshot>>,
    events_tx: broadcast::Sender<GuardEvent>,

    last_reading: Option<VoltageReading>,
    last_decision: Option<ControlDecision>,
    consecutive_failures: u32,
    sensor_loss_active: bool,
    sensor_loss_critical: bool,
    total_polls: u64,
    actuation_failures: u64,
    actuation_pending: bool,
    last_status_log: Instant,
}

impl ChargeGuard {
    /// Build a controller around an already opened telemetry source and output line
    pub fn new(
        config: Config,
        source: Box<dyn TelemetrySource>,
        line: Box<dyn OutputLine>,
    ) -> Result<Self> {
        config.validate()?;
        let thresholds = config.control.thresholds()?;

        let sampler = VoltageSampler::new(
            source,
            FrameDecoder::new(config.telemetry.max_block_bytes),
            &config.telemetry.voltage_label,
            config.sample_timeout(),
        );
        let fsm = ChargerControl::new(thresholds, config.control.initial_state);
        let actuator = ActuatorDriver::new(line, Polarity::new(config.relay.connected_level));
        let toggles = ToggleMonitor::new(
            config.control.rapid_toggle_count,
            Duration::from_secs(config.control.rapid_toggle_window_secs),
            Duration::from_secs(config.control.rapid_toggle_cooldown_secs),
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let guard = Self {
            config,
            sampler,
            fsm,
            actuator,
            toggles,
            logger: get_logger("guard"),
            commands_tx,
            commands_rx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            snapshot_tx: watch::channel(Arc::new(placeholder_snapshot(thresholds))).0,
            events_tx,
            last_reading: None,
            last_decision: None,
            consecutive_failures: 0,
            sensor_loss_active: false,
            sensor_loss_critical: false,
            total_polls: 0,
            actuation_failures: 0,
            actuation_pending: false,
            last_status_log: Instant::now(),
        };
        guard.publish_snapshot();
        Ok(guard)
    }

    /// Handle for inspecting and stopping this controller
    pub fn handle(&self) -> GuardHandle {
        GuardHandle {
            commands_tx: self.commands_tx.clone(),
            stop_tx: self.stop_tx.clone(),
            snapshot_rx: self.snapshot_tx.subscribe(),
            events_tx: self.events_tx.clone(),
        }
    }

    /// State currently decided by the state machine
    pub fn relay_state(&self) -> RelayState {
        self.fsm.state()
    }

    fn emit(&self, event: GuardEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

fn placeholder_snapshot(thresholds: crate::control::Thresholds) -> GuardSnapshot {
    GuardSnapshot {
        timestamp: chrono::Utc::now().to_rfc3339(),
        relay_state: RelayState::FAIL_SAFE,
        commanded_state: None,
        last_reading: None,
        last_decision: None,
        last_failure: None,
        consecutive_failures: 0,
        sensor_loss_active: false,
        sensor_loss_critical: false,
        total_polls: 0,
        actuation_failures: 0,
        relay_writes: 0,
        decoder: Default::default(),
        thresholds,
        poll_interval_ms: 0,
    }
}

/// Cloneable access to a running [`ChargeGuard`]
///
/// The handle can observe the loop and ask for an immediate evaluation but
/// can never drive the relay directly.
#[derive(Clone)]
pub struct GuardHandle {
    commands_tx: mpsc::UnboundedSender<GuardCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
    snapshot_rx: watch::Receiver<Arc<GuardSnapshot>>,
    events_tx: broadcast::Sender<GuardEvent>,
}

impl GuardHandle {
    /// State currently decided by the controller
    pub fn relay_state(&self) -> RelayState {
        self.snapshot_rx.borrow().relay_state
    }

    /// Most recent valid reading, if any
    pub fn last_reading(&self) -> Option<VoltageReading> {
        self.snapshot_rx.borrow().last_reading
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<GuardSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver that updates after every cycle
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<GuardSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Receive loop events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<GuardEvent> {
        self.events_tx.subscribe()
    }

    /// Run one cycle through the state machine immediately
    pub async fn request_evaluation(&self) -> Result<ControlDecision> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(GuardCommand::Evaluate(reply_tx))
            .map_err(|_| ChargeGuardError::generic("Control loop is not running"))?;
        reply_rx
            .await
            .map_err(|_| ChargeGuardError::generic("Control loop stopped before evaluating"))
    }

    /// Ask the loop to drive the relay safe and exit
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }
}
