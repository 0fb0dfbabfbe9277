use std::time::Instant;
use tokio::time::{MissedTickBehavior, interval, sleep};

use crate::control::{ControlDecision, RelayState};
use crate::error::{ChargeGuardError, Result};
use crate::sampler::VoltageReading;

use super::types::GuardEvent;

impl super::ChargeGuard {
    /// Run the control loop until a stop is requested
    ///
    /// The relay is driven to the disconnected state before this returns. An
    /// error means that final actuation never succeeded.
    pub async fn run(&mut self) -> Result<()> {
        let thresholds = self.fsm.thresholds();
        self.logger.info(&format!(
            "Starting charge guard: disconnect at {:.2} V, reconnect at {:.2} V, initial state {}, poll every {} ms",
            thresholds.high(),
            thresholds.low(),
            self.fsm.state(),
            self.config.poll_interval_ms
        ));
        self.emit(GuardEvent::Started {
            state: self.fsm.state(),
            thresholds,
        });
        self.reconcile().await;
        self.publish_snapshot();

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.stop_rx.borrow_and_update() {
                break;
            }

            let keep_running = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => false,
                Some(cmd) = self.commands_rx.recv() => self.handle_command(cmd).await,
                _ = ticker.tick() => self.tick().await.is_some(),
            };
            if !keep_running {
                break;
            }
        }

        self.logger.info("Stop requested, shutting down control loop");
        self.close_commands();
        self.shutdown().await
    }

    /// Refuse further commands and fail the ones still queued
    fn close_commands(&mut self) {
        self.commands_rx.close();
        let mut dropped = 0;
        while self.commands_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.logger
                .debug(&format!("Dropped {} queued evaluation requests", dropped));
        }
    }

    /// One sample/decide/actuate cycle; `None` if a stop cut the sample short
    pub(crate) async fn tick(&mut self) -> Option<ControlDecision> {
        let sampled = tokio::select! {
            biased;
            _ = self.stop_rx.changed() => None,
            reading = self.sampler.sample() => Some(reading),
        };
        let Some(reading) = sampled else {
            self.logger.debug("Sampling abandoned on stop");
            return None;
        };
        Some(self.process_reading(reading).await)
    }

    pub(crate) async fn process_reading(
        &mut self,
        reading: Option<VoltageReading>,
    ) -> ControlDecision {
        self.total_polls = self.total_polls.saturating_add(1);
        match reading {
            Some(r) => self.note_reading(r),
            None => self.note_missing_reading(),
        }

        let decision = self.fsm.evaluate(reading.as_ref());
        self.last_decision = Some(decision);

        if decision.changed() {
            self.logger.info(&format!(
                "Relay {} -> {} ({}) at {}",
                decision.previous,
                decision.target,
                decision.reason,
                decision
                    .volts
                    .map(|v| format!("{:.3} V", v))
                    .unwrap_or_else(|| "unknown voltage".to_string())
            ));
            self.emit(GuardEvent::StateChanged { decision });
            self.check_toggle_rate(Instant::now());
        } else if let Some(v) = decision.volts {
            self.logger.debug(&format!(
                "Battery {:.3} V, relay {} ({})",
                v, decision.target, decision.reason
            ));
        }

        self.reconcile().await;
        self.maybe_log_status(Instant::now());
        self.publish_snapshot();
        decision
    }

    fn note_reading(&mut self, reading: VoltageReading) {
        if self.sensor_loss_active {
            self.logger.info(&format!(
                "Telemetry recovered after {} failed samples ({:.3} V)",
                self.consecutive_failures,
                reading.volts()
            ));
            self.emit(GuardEvent::TelemetryRecovered {
                after_failures: self.consecutive_failures,
                volts: reading.volts(),
            });
        } else if self.consecutive_failures > 0 {
            self.logger.debug(&format!(
                "Reading restored after {} failed samples",
                self.consecutive_failures
            ));
        }
        self.consecutive_failures = 0;
        self.sensor_loss_active = false;
        self.sensor_loss_critical = false;
        self.last_reading = Some(reading);
    }

    fn note_missing_reading(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let n = self.consecutive_failures;
        let cause = self
            .sampler
            .last_failure()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "no reading".to_string());

        if n == 1 || n % self.config.control.failure_log_every == 0 {
            self.logger.warn(&format!(
                "No voltage reading ({}), holding relay {} [{} consecutive]",
                cause,
                self.fsm.state(),
                n
            ));
        } else {
            self.logger
                .debug(&format!("No voltage reading ({}) [{} consecutive]", cause, n));
        }

        if n == self.config.control.sensor_loss_threshold {
            self.sensor_loss_active = true;
            self.logger.warn(&format!(
                "Sensor loss: {} consecutive samples without a valid reading, relay held {}",
                n,
                self.fsm.state()
            ));
            self.emit(GuardEvent::SensorLoss {
                consecutive_failures: n,
                state: self.fsm.state(),
            });
        }

        if n == self.config.control.sensor_loss_critical_threshold {
            self.sensor_loss_critical = true;
            self.logger.error(&format!(
                "Critical sensor loss: {} consecutive samples without a valid reading, relay held {}; check the battery monitor link",
                n,
                self.fsm.state()
            ));
            self.emit(GuardEvent::SensorLossCritical {
                consecutive_failures: n,
                state: self.fsm.state(),
            });
        }
    }

    fn check_toggle_rate(&mut self, now: Instant) {
        if let Some(transitions) = self.toggles.record(now) {
            let window_secs = self.toggles.window().as_secs();
            self.logger.warn(&format!(
                "Relay toggled {} times within {} s; check thresholds and wiring",
                transitions, window_secs
            ));
            self.emit(GuardEvent::RapidToggling {
                transitions,
                window_secs,
            });
        }
    }

    /// Bring the relay in line with the state machine, retrying earlier failures
    async fn reconcile(&mut self) {
        let target = self.fsm.state();
        if self.actuator.last_commanded() == Some(target) {
            return;
        }
        match self.actuator.apply(target).await {
            Ok(()) => {
                if self.actuation_pending {
                    self.logger
                        .info(&format!("Relay actuation to {} succeeded on retry", target));
                }
                self.actuation_pending = false;
            }
            Err(e) => {
                self.actuation_failures = self.actuation_failures.saturating_add(1);
                self.actuation_pending = true;
                self.logger
                    .error(&format!("Failed to drive relay {}: {}", target, e));
                self.emit(GuardEvent::ActuationFailed {
                    target,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let decision = self.fsm.shutdown();
        self.last_decision = Some(decision);
        self.logger.info(&format!(
            "Driving relay {} before exit (was {})",
            decision.target, decision.previous
        ));

        let attempts = self.config.control.shutdown_retries;
        let delay = std::time::Duration::from_millis(self.config.control.shutdown_retry_delay_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.actuator.apply(RelayState::FAIL_SAFE).await {
                Ok(()) => {
                    self.logger.info("Relay in safe state, control loop stopped");
                    self.emit(GuardEvent::ShutdownComplete {
                        state: RelayState::FAIL_SAFE,
                    });
                    self.publish_snapshot();
                    return Ok(());
                }
                Err(e) => {
                    self.actuation_failures = self.actuation_failures.saturating_add(1);
                    self.logger.warn(&format!(
                        "Shutdown actuation attempt {}/{} failed: {}",
                        attempt, attempts, e
                    ));
                    last_error = e.to_string();
                    if attempt < attempts {
                        sleep(delay).await;
                    }
                }
            }
        }

        let message = format!(
            "Relay did not reach the safe state after {} attempts: {}",
            attempts, last_error
        );
        self.logger.error(&message);
        self.emit(GuardEvent::ShutdownFailed {
            message: message.clone(),
        });
        self.publish_snapshot();
        Err(ChargeGuardError::actuation(message))
    }
}

#[cfg(test)]
mod tests {
    use super::GuardEvent;
    use super::super::ChargeGuard;
    use crate::config::Config;
    use crate::control::{DecisionReason, RelayState};
    use crate::error::Result;
    use crate::relay::{SignalLevel, SimulatedLine};
    use crate::sampler::VoltageReading;
    use crate::telemetry::TelemetrySource;
    use std::time::Duration;

    struct SilentSource;

    #[async_trait::async_trait]
    impl TelemetrySource for SilentSource {
        async fn read(&mut self, _wait: Duration) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn guard(line: SimulatedLine) -> ChargeGuard {
        let mut config = Config::default();
        config.control.sensor_loss_threshold = 3;
        config.control.sensor_loss_critical_threshold = 5;
        ChargeGuard::new(config, Box::new(SilentSource), Box::new(line)).unwrap()
    }

    fn reading(mv: i64) -> Option<VoltageReading> {
        Some(VoltageReading::from_millivolts(mv, chrono::Utc::now()))
    }

    /// (loss, critical, recovered) event counts
    fn tally(events: &mut tokio::sync::broadcast::Receiver<GuardEvent>) -> (u32, u32, u32) {
        let mut counts = (0, 0, 0);
        while let Ok(ev) = events.try_recv() {
            match ev {
                GuardEvent::SensorLoss {
                    consecutive_failures,
                    ..
                } => {
                    assert_eq!(consecutive_failures, 3);
                    counts.0 += 1;
                }
                GuardEvent::SensorLossCritical {
                    consecutive_failures,
                    ..
                } => {
                    assert_eq!(consecutive_failures, 5);
                    counts.1 += 1;
                }
                GuardEvent::TelemetryRecovered { after_failures, .. } => {
                    assert_eq!(after_failures, 7);
                    counts.2 += 1;
                }
                _ => {}
            }
        }
        counts
    }

    #[tokio::test]
    async fn missing_readings_escalate_each_tier_once_and_recover() {
        let mut g = guard(SimulatedLine::new());
        let mut events = g.handle().subscribe_events();

        for _ in 0..7 {
            let d = g.process_reading(None).await;
            assert_eq!(d.reason, DecisionReason::FailsafeNoData);
        }
        assert!(g.sensor_loss_active);
        assert!(g.sensor_loss_critical);
        assert_eq!(g.consecutive_failures, 7);
        assert_eq!(g.relay_state(), RelayState::Disconnected);

        g.process_reading(reading(24_600)).await;
        assert!(!g.sensor_loss_active);
        assert!(!g.sensor_loss_critical);
        assert_eq!(g.consecutive_failures, 0);
        assert_eq!(tally(&mut events), (1, 1, 1));

        // Both tiers rearm after recovery
        for _ in 0..7 {
            g.process_reading(None).await;
        }
        g.process_reading(reading(24_600)).await;
        assert_eq!(tally(&mut events), (1, 1, 1));
    }

    #[tokio::test]
    async fn critical_tier_waits_for_its_threshold() {
        let mut g = guard(SimulatedLine::new());
        let mut events = g.handle().subscribe_events();

        for _ in 0..4 {
            g.process_reading(None).await;
        }
        assert!(g.sensor_loss_active);
        assert!(!g.sensor_loss_critical);
        assert!(!g.handle().snapshot().sensor_loss_critical);
        let (loss, critical, _) = tally(&mut events);
        assert_eq!((loss, critical), (1, 0));

        g.process_reading(None).await;
        assert!(g.handle().snapshot().sensor_loss_critical);
    }

    #[tokio::test]
    async fn failed_actuation_is_retried_next_cycle() {
        let line = SimulatedLine::new();
        let mut g = guard(line.clone());

        line.set_failing(true);
        let d = g.process_reading(reading(24_200)).await;
        assert_eq!(d.target, RelayState::Connected);
        assert_eq!(g.actuator.last_commanded(), None);
        assert_eq!(g.actuation_failures, 1);

        line.set_failing(false);
        let d = g.process_reading(reading(24_300)).await;
        assert!(!d.changed());
        assert_eq!(g.actuator.last_commanded(), Some(RelayState::Connected));
        assert_eq!(line.history(), vec![SignalLevel::Low]);
    }

    #[tokio::test]
    async fn snapshot_tracks_cycle() {
        let mut g = guard(SimulatedLine::new());
        let handle = g.handle();
        g.process_reading(reading(24_200)).await;

        let snap = handle.snapshot();
        assert_eq!(snap.relay_state, RelayState::Connected);
        assert_eq!(snap.commanded_state, Some(RelayState::Connected));
        assert_eq!(snap.total_polls, 1);
        assert_eq!(handle.last_reading().map(|r| r.millivolts()), Some(24_200));
        assert!(serde_json::to_string(&*snap).unwrap().contains("\"relay_state\":\"connected\""));
    }
}
