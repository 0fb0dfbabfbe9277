use chargeguard::config::{RelayBackend, RelayConfig};
use chargeguard::control::RelayState;
use chargeguard::relay::{ActuatorDriver, Polarity, SignalLevel, open_output_line};
use std::fs;

fn sysfs_config(base: &std::path::Path, pin: u32, connected_level: SignalLevel) -> RelayConfig {
    RelayConfig {
        backend: RelayBackend::Sysfs,
        gpio_pin: pin,
        gpio_base: base.to_string_lossy().to_string(),
        connected_level,
    }
}

#[tokio::test]
async fn active_high_relay_follows_state() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("gpio22")).unwrap();
    let config = sysfs_config(dir.path(), 22, SignalLevel::High);

    let line = open_output_line(&config).await.unwrap();
    let mut driver = ActuatorDriver::new(line, Polarity::new(config.connected_level));
    let value = dir.path().join("gpio22/value");

    driver.apply(RelayState::Connected).await.unwrap();
    assert_eq!(fs::read_to_string(&value).unwrap(), "1");

    // A repeat must not touch the line
    fs::write(&value, "untouched").unwrap();
    driver.apply(RelayState::Connected).await.unwrap();
    assert_eq!(fs::read_to_string(&value).unwrap(), "untouched");

    driver.apply(RelayState::Disconnected).await.unwrap();
    assert_eq!(fs::read_to_string(&value).unwrap(), "0");
    assert_eq!(driver.physical_writes(), 2);
}

#[tokio::test]
async fn unexported_pin_is_exported_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = sysfs_config(dir.path(), 23, SignalLevel::Low);

    // No kernel behind the tempdir, so the pin directory never appears
    let err = match open_output_line(&config).await {
        Ok(_) => panic!("direction write should fail without a pin directory"),
        Err(e) => e,
    };
    assert!(err.is_configuration());
    assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "23");
}

#[tokio::test]
async fn write_failure_surfaces_as_actuation_error() {
    let dir = tempfile::tempdir().unwrap();
    let pin_dir = dir.path().join("gpio5");
    fs::create_dir_all(&pin_dir).unwrap();
    let config = sysfs_config(dir.path(), 5, SignalLevel::Low);
    let line = open_output_line(&config).await.unwrap();
    let mut driver = ActuatorDriver::new(line, Polarity::new(SignalLevel::Low));

    fs::remove_dir_all(&pin_dir).unwrap();
    let err = driver.apply(RelayState::Connected).await.unwrap_err();
    assert!(matches!(
        err,
        chargeguard::ChargeGuardError::Actuation { .. }
    ));
    assert_eq!(driver.last_commanded(), None);
}
