use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::GuardSnapshot;

impl super::ChargeGuard {
    pub(super) fn build_snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            relay_state: self.fsm.state(),
            commanded_state: self.actuator.last_commanded(),
            last_reading: self.last_reading,
            last_decision: self.last_decision,
            last_failure: self.sampler.last_failure().cloned(),
            consecutive_failures: self.consecutive_failures,
            sensor_loss_active: self.sensor_loss_active,
            sensor_loss_critical: self.sensor_loss_critical,
            total_polls: self.total_polls,
            actuation_failures: self.actuation_failures,
            relay_writes: self.actuator.physical_writes(),
            decoder: self.sampler.decoder_stats(),
            thresholds: self.fsm.thresholds(),
            poll_interval_ms: self.config.poll_interval_ms,
        }
    }

    pub(super) fn publish_snapshot(&self) {
        self.snapshot_tx
            .send_replace(Arc::new(self.build_snapshot()));
    }

    /// Emit the periodic status line once the configured interval has passed
    pub(super) fn maybe_log_status(&mut self, now: Instant) {
        let every = self.config.control.status_log_interval_secs;
        if every == 0
            || now.saturating_duration_since(self.last_status_log) < Duration::from_secs(every)
        {
            return;
        }
        self.last_status_log = now;

        let voltage = self
            .last_reading
            .map(|r| format!("{:.3} V", r.volts()))
            .unwrap_or_else(|| "unknown".to_string());
        self.logger.info(&format!(
            "Status: relay={}, voltage={}, failures={}, polls={}, source={}",
            self.fsm.state(),
            voltage,
            self.consecutive_failures,
            self.total_polls,
            self.sampler.source_description()
        ));

        match serde_json::to_string(&self.build_snapshot()) {
            Ok(json) => self.logger.debug(&format!("Snapshot: {}", json)),
            Err(e) => self
                .logger
                .debug(&format!("Failed to serialize snapshot: {}", e)),
        }
    }
}
