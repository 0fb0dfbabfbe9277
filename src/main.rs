use anyhow::Result;
use chargeguard::config::Config;
use chargeguard::guard::{ChargeGuard, GuardHandle};
use chargeguard::relay::open_output_line;
use chargeguard::telemetry::SerialTelemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    chargeguard::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("chargeguard {} starting up", env!("APP_VERSION"));

    let source = SerialTelemetry::open(&config.telemetry)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open telemetry link: {}", e))?;
    let line = open_output_line(&config.relay)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open relay output: {}", e))?;

    let mut guard = ChargeGuard::new(config, Box::new(source), line)
        .map_err(|e| anyhow::anyhow!("Failed to create control loop: {}", e))?;

    let signal_task = tokio::spawn(stop_on_signal(guard.handle()));

    let outcome = guard.run().await;
    signal_task.abort();

    match outcome {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Control loop failed: {}", e);
            Err(anyhow::anyhow!("Control loop error: {}", e))
        }
    }
}

async fn stop_on_signal(handle: GuardHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received interrupt");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
    handle.stop();
}
