//! Charger relay actuation
//!
//! Control logic speaks in [`RelayState`]; relay modules speak in signal
//! levels and disagree about which level closes the contact. [`Polarity`]
//! holds that mapping and [`ActuatorDriver`] applies it to an
//! [`OutputLine`], skipping writes that would not change anything.

use crate::config::{RelayBackend, RelayConfig};
use crate::control::RelayState;
use crate::error::{ChargeGuardError, Result};
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Physical level of a digital output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalLevel {
    Low,
    High,
}

impl SignalLevel {
    fn inverted(self) -> Self {
        match self {
            SignalLevel::Low => SignalLevel::High,
            SignalLevel::High => SignalLevel::Low,
        }
    }
}

/// Which level means "charger connected"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polarity {
    connected_level: SignalLevel,
}

impl Polarity {
    pub fn new(connected_level: SignalLevel) -> Self {
        Self { connected_level }
    }

    /// Level to drive for a logical state
    pub fn level_for(&self, state: RelayState) -> SignalLevel {
        match state {
            RelayState::Connected => self.connected_level,
            RelayState::Disconnected => self.connected_level.inverted(),
        }
    }
}

/// Digital output capability
#[async_trait::async_trait]
pub trait OutputLine: Send {
    async fn set(&mut self, level: SignalLevel) -> Result<()>;

    fn describe(&self) -> String {
        "output".to_string()
    }
}

/// Relay driver mirroring the last commanded state
pub struct ActuatorDriver {
    line: Box<dyn OutputLine>,
    polarity: Polarity,
    last_commanded: Option<RelayState>,
    physical_writes: u64,
    logger: crate::logging::StructuredLogger,
}

impl ActuatorDriver {
    pub fn new(line: Box<dyn OutputLine>, polarity: Polarity) -> Self {
        Self {
            line,
            polarity,
            last_commanded: None,
            physical_writes: 0,
            logger: get_logger("relay"),
        }
    }

    /// Drive the relay to `state`
    ///
    /// Re-applying the commanded state is a logical success without touching
    /// the line. On failure the cache is left alone so the next call retries.
    pub async fn apply(&mut self, state: RelayState) -> Result<()> {
        if self.last_commanded == Some(state) {
            return Ok(());
        }

        let level = self.polarity.level_for(state);
        self.logger.debug(&format!(
            "Driving {} {:?} for {}",
            self.line.describe(),
            level,
            state
        ));
        self.line.set(level).await.map_err(|e| match e {
            ChargeGuardError::Actuation { .. } => e,
            other => ChargeGuardError::actuation(format!(
                "{} rejected {:?}: {}",
                self.line.describe(),
                level,
                other
            )),
        })?;

        self.last_commanded = Some(state);
        self.physical_writes = self.physical_writes.saturating_add(1);
        Ok(())
    }

    /// State the relay was last successfully driven to
    pub fn last_commanded(&self) -> Option<RelayState> {
        self.last_commanded
    }

    /// Number of writes that reached the line
    pub fn physical_writes(&self) -> u64 {
        self.physical_writes
    }
}

/// GPIO line driven through the Linux sysfs interface
#[derive(Debug)]
pub struct SysfsGpioLine {
    pin: u32,
    value_path: PathBuf,
}

impl SysfsGpioLine {
    /// Export `pin` under `base` if needed and configure it as an output
    pub async fn open(base: &Path, pin: u32) -> Result<Self> {
        let pin_dir = base.join(format!("gpio{}", pin));
        if !tokio::fs::try_exists(&pin_dir).await.unwrap_or(false) {
            tokio::fs::write(base.join("export"), pin.to_string())
                .await
                .map_err(|e| ChargeGuardError::config(format!("Failed to export GPIO {}: {}", pin, e)))?;
            // udev needs a moment to fix permissions on the new node
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::fs::write(pin_dir.join("direction"), "out")
            .await
            .map_err(|e| {
                ChargeGuardError::config(format!("Failed to set GPIO {} as output: {}", pin, e))
            })?;

        Ok(Self {
            pin,
            value_path: pin_dir.join("value"),
        })
    }
}

#[async_trait::async_trait]
impl OutputLine for SysfsGpioLine {
    async fn set(&mut self, level: SignalLevel) -> Result<()> {
        let value = match level {
            SignalLevel::Low => "0",
            SignalLevel::High => "1",
        };
        tokio::fs::write(&self.value_path, value).await.map_err(|e| {
            ChargeGuardError::actuation(format!("GPIO {} write failed: {}", self.pin, e))
        })
    }

    fn describe(&self) -> String {
        format!("gpio{}", self.pin)
    }
}

/// In-memory line that records every level it is driven to
#[derive(Debug, Clone, Default)]
pub struct SimulatedLine {
    history: Arc<Mutex<Vec<SignalLevel>>>,
    failing: Arc<Mutex<bool>>,
}

impl SimulatedLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levels written so far, oldest first
    pub fn history(&self) -> Vec<SignalLevel> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Current level, if ever driven
    pub fn level(&self) -> Option<SignalLevel> {
        self.history().last().copied()
    }

    /// Make subsequent writes fail, emulating a hardware fault
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }
}

#[async_trait::async_trait]
impl OutputLine for SimulatedLine {
    async fn set(&mut self, level: SignalLevel) -> Result<()> {
        let failing = self.failing.lock().map(|f| *f).unwrap_or(false);
        if failing {
            return Err(ChargeGuardError::actuation("simulated relay fault"));
        }
        self.history
            .lock()
            .map_err(|_| ChargeGuardError::actuation("simulated line poisoned"))?
            .push(level);
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

/// Open the configured output backend
pub async fn open_output_line(config: &RelayConfig) -> Result<Box<dyn OutputLine>> {
    match config.backend {
        RelayBackend::Sysfs => {
            let line = SysfsGpioLine::open(Path::new(&config.gpio_base), config.gpio_pin).await?;
            Ok(Box::new(line))
        }
        RelayBackend::Simulated => {
            get_logger("relay").warn("Using simulated relay output; the charger is not controlled");
            Ok(Box::new(SimulatedLine::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarity_maps_both_conventions() {
        let active_low = Polarity::new(SignalLevel::Low);
        assert_eq!(active_low.level_for(RelayState::Connected), SignalLevel::Low);
        assert_eq!(active_low.level_for(RelayState::Disconnected), SignalLevel::High);

        let active_high = Polarity::new(SignalLevel::High);
        assert_eq!(active_high.level_for(RelayState::Connected), SignalLevel::High);
        assert_eq!(active_high.level_for(RelayState::Disconnected), SignalLevel::Low);
    }

    #[tokio::test]
    async fn repeated_apply_is_a_physical_no_op() {
        let line = SimulatedLine::new();
        let mut driver = ActuatorDriver::new(Box::new(line.clone()), Polarity::new(SignalLevel::Low));

        driver.apply(RelayState::Disconnected).await.unwrap();
        driver.apply(RelayState::Disconnected).await.unwrap();
        assert_eq!(line.history(), vec![SignalLevel::High]);
        assert_eq!(driver.physical_writes(), 1);

        driver.apply(RelayState::Connected).await.unwrap();
        assert_eq!(line.level(), Some(SignalLevel::Low));
        assert_eq!(driver.last_commanded(), Some(RelayState::Connected));
    }

    #[tokio::test]
    async fn failure_is_reported_and_retried() {
        let line = SimulatedLine::new();
        let mut driver = ActuatorDriver::new(Box::new(line.clone()), Polarity::new(SignalLevel::Low));

        line.set_failing(true);
        let err = driver.apply(RelayState::Connected).await.unwrap_err();
        assert!(matches!(err, ChargeGuardError::Actuation { .. }));
        assert_eq!(driver.last_commanded(), None);

        line.set_failing(false);
        driver.apply(RelayState::Connected).await.unwrap();
        assert_eq!(driver.last_commanded(), Some(RelayState::Connected));
        assert_eq!(line.history(), vec![SignalLevel::Low]);
    }

    #[tokio::test]
    async fn sysfs_line_writes_value_file() {
        let dir = tempfile::tempdir().unwrap();
        let pin_dir = dir.path().join("gpio17");
        std::fs::create_dir_all(&pin_dir).unwrap();

        let mut line = SysfsGpioLine::open(dir.path(), 17).await.unwrap();
        assert_eq!(std::fs::read_to_string(pin_dir.join("direction")).unwrap(), "out");

        line.set(SignalLevel::High).await.unwrap();
        assert_eq!(std::fs::read_to_string(pin_dir.join("value")).unwrap(), "1");
        line.set(SignalLevel::Low).await.unwrap();
        assert_eq!(std::fs::read_to_string(pin_dir.join("value")).unwrap(), "0");
        assert_eq!(line.describe(), "gpio17");
    }

    #[tokio::test]
    async fn sysfs_export_failure_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-gpio-here");
        let err = SysfsGpioLine::open(&missing, 4).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn simulated_backend_opens() {
        let config = RelayConfig {
            backend: RelayBackend::Simulated,
            ..Default::default()
        };
        let mut line = open_output_line(&config).await.unwrap();
        line.set(SignalLevel::High).await.unwrap();
        assert_eq!(line.describe(), "simulated");
    }
}
