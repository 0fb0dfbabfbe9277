use super::*;

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ports: vec![
                "/dev/ttyUSB0".to_string(),
                "/dev/ttyUSB1".to_string(),
                "/dev/ttyUSB2".to_string(),
                "/dev/ttyUSB3".to_string(),
            ],
            baud_rate: 19200,
            voltage_label: "V".to_string(),
            sample_timeout_ms: None,
            max_block_bytes: 512,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: RelayBackend::Sysfs,
            gpio_pin: 17,
            gpio_base: "/sys/class/gpio".to_string(),
            connected_level: SignalLevel::Low,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            high_threshold_v: 24.8,
            low_threshold_v: 24.5,
            initial_state: RelayState::Disconnected,
            sensor_loss_threshold: 6,
            sensor_loss_critical_threshold: 18,
            failure_log_every: 10,
            status_log_interval_secs: 300,
            shutdown_retries: 3,
            shutdown_retry_delay_ms: 200,
            rapid_toggle_count: 4,
            rapid_toggle_window_secs: 300,
            rapid_toggle_cooldown_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/var/log/chargeguard/chargeguard.log".to_string(),
            backup_count: 7,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry: TelemetryConfig::default(),
            relay: RelayConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_ms: 5000,
        }
    }
}
