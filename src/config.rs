//! Configuration management for chargeguard
//!
//! This module handles loading and validation of the application
//! configuration from YAML files. The loaded struct is immutable for the
//! lifetime of a control loop; changing it requires a restart.

use crate::control::{RelayState, Thresholds};
use crate::error::{ChargeGuardError, Result};
use crate::relay::SignalLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "CHARGEGUARD_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// VE.Direct telemetry link
    pub telemetry: TelemetryConfig,

    /// Charger relay output
    pub relay: RelayConfig,

    /// Hysteresis thresholds and loop policy
    pub control: ControlConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
}

/// Serial telemetry parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Candidate device paths, tried in order
    pub ports: Vec<String>,

    /// Baud rate (VE.Direct uses 19200)
    pub baud_rate: u32,

    /// Field label carrying pack voltage in millivolts
    pub voltage_label: String,

    /// Bound on a single sample window; defaults to the poll interval
    pub sample_timeout_ms: Option<u64>,

    /// Blocks longer than this are discarded as garbage
    pub max_block_bytes: usize,
}

/// Which output line implementation drives the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    /// Linux sysfs GPIO
    Sysfs,
    /// In-memory line for bench runs
    Simulated,
}

/// Relay output parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Output backend
    pub backend: RelayBackend,

    /// BCM GPIO number driving the relay module
    pub gpio_pin: u32,

    /// Root of the sysfs GPIO tree
    pub gpio_base: String,

    /// Signal level that means "charger connected"
    pub connected_level: SignalLevel,
}

/// Control policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Disconnect at or above this pack voltage
    pub high_threshold_v: f64,

    /// Reconnect at or below this pack voltage
    pub low_threshold_v: f64,

    /// Relay state assumed and driven on cold start
    pub initial_state: RelayState,

    /// Consecutive unavailable samples before sensor loss is escalated
    pub sensor_loss_threshold: u32,

    /// Consecutive unavailable samples before sensor loss turns critical
    pub sensor_loss_critical_threshold: u32,

    /// Log every Nth consecutive unavailable sample at warning level
    pub failure_log_every: u32,

    /// Seconds between periodic status lines (0 disables)
    pub status_log_interval_secs: u64,

    /// Attempts to reach the safe state on shutdown
    pub shutdown_retries: u32,

    /// Delay between shutdown attempts in milliseconds
    pub shutdown_retry_delay_ms: u64,

    /// Relay transitions within the window that count as rapid toggling
    pub rapid_toggle_count: usize,

    /// Rapid toggling window in seconds
    pub rapid_toggle_window_secs: u64,

    /// Minimum seconds between rapid toggling alerts
    pub rapid_toggle_cooldown_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console override level
    pub console_level: Option<String>,

    /// Optional file override level
    pub file_level: Option<String>,

    /// Path to log file (its directory receives the rolling files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl ControlConfig {
    /// Build validated thresholds from the configured pair
    pub fn thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(self.high_threshold_v, self.low_threshold_v)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the environment override or default locations
    pub fn load() -> Result<Self> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR) {
            let path = Path::new(&explicit);
            if !path.exists() {
                return Err(ChargeGuardError::config(format!(
                    "{} points at missing file {}",
                    CONFIG_ENV_VAR,
                    path.display()
                )));
            }
            return Self::from_file(path);
        }

        let default_paths = [
            "chargeguard.yaml",
            "/data/chargeguard.yaml",
            "/etc/chargeguard/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Effective bound on one sample window
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(
            self.telemetry
                .sample_timeout_ms
                .unwrap_or(self.poll_interval_ms),
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.control.thresholds()?;

        if self.poll_interval_ms == 0 {
            return Err(ChargeGuardError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        if let Some(timeout) = self.telemetry.sample_timeout_ms
            && (timeout == 0 || timeout > self.poll_interval_ms.saturating_mul(2))
        {
            return Err(ChargeGuardError::validation(
                "telemetry.sample_timeout_ms",
                "Must be between 1 and twice the poll interval",
            ));
        }

        if self.telemetry.ports.is_empty() {
            return Err(ChargeGuardError::validation(
                "telemetry.ports",
                "At least one candidate device is required",
            ));
        }

        if self.telemetry.baud_rate == 0 {
            return Err(ChargeGuardError::validation(
                "telemetry.baud_rate",
                "Must be greater than 0",
            ));
        }

        if self.telemetry.voltage_label.trim().is_empty() {
            return Err(ChargeGuardError::validation(
                "telemetry.voltage_label",
                "Label cannot be empty",
            ));
        }

        if self.telemetry.max_block_bytes < 16 {
            return Err(ChargeGuardError::validation(
                "telemetry.max_block_bytes",
                "Must be at least 16",
            ));
        }

        if self.relay.backend == RelayBackend::Sysfs && self.relay.gpio_base.is_empty() {
            return Err(ChargeGuardError::validation(
                "relay.gpio_base",
                "Sysfs backend needs a GPIO base directory",
            ));
        }

        if self.control.sensor_loss_threshold == 0 {
            return Err(ChargeGuardError::validation(
                "control.sensor_loss_threshold",
                "Must be greater than 0",
            ));
        }

        if self.control.sensor_loss_critical_threshold <= self.control.sensor_loss_threshold {
            return Err(ChargeGuardError::validation(
                "control.sensor_loss_critical_threshold",
                "Must be greater than control.sensor_loss_threshold",
            ));
        }

        if self.control.failure_log_every == 0 {
            return Err(ChargeGuardError::validation(
                "control.failure_log_every",
                "Must be greater than 0",
            ));
        }

        if self.control.shutdown_retries == 0 {
            return Err(ChargeGuardError::validation(
                "control.shutdown_retries",
                "At least one shutdown attempt is required",
            ));
        }

        if self.control.rapid_toggle_count < 2 {
            return Err(ChargeGuardError::validation(
                "control.rapid_toggle_count",
                "Must be at least 2",
            ));
        }

        crate::logging::parse_log_level(&self.logging.level)?;

        Ok(())
    }
}
