//! Telemetry link to the battery monitor
//!
//! The control loop only depends on [`TelemetrySource`]: a bounded read that
//! returns whatever bytes arrived. [`SerialTelemetry`] implements it over a
//! VE.Direct serial port, trying a list of candidate devices and
//! rediscovering the port after I/O errors (USB adapters tend to
//! re-enumerate as a different ttyUSB node).

use crate::config::TelemetryConfig;
use crate::error::{ChargeGuardError, Result};
use crate::logging::{LogContext, get_logger, get_logger_with_context};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const READ_CHUNK: usize = 512;

/// Open byte stream behind the serial telemetry link
type PortStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte-stream capability the sampler reads from
#[async_trait::async_trait]
pub trait TelemetrySource: Send {
    /// Read available bytes, waiting at most `wait`.
    ///
    /// An empty buffer means nothing arrived in time. Errors describe a
    /// failed device; the caller decides how to degrade.
    async fn read(&mut self, wait: Duration) -> Result<Vec<u8>>;

    /// Human readable description of the current endpoint
    fn describe(&self) -> String {
        "telemetry".to_string()
    }
}

/// VE.Direct serial port with discovery and reconnect
pub struct SerialTelemetry {
    config: TelemetryConfig,
    port: Option<PortStream>,
    port_name: Option<String>,
    reconnects: u64,
    logger: crate::logging::StructuredLogger,
}

impl SerialTelemetry {
    /// Open the first reachable candidate port; fails if none is usable
    pub async fn open(config: &TelemetryConfig) -> Result<Self> {
        let mut telemetry = Self {
            config: config.clone(),
            port: None,
            port_name: None,
            reconnects: 0,
            logger: get_logger("telemetry"),
        };
        telemetry.connect()?;
        Ok(telemetry)
    }

    /// Name of the device currently in use
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// How many times the link was re-established after a failure
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn connect(&mut self) -> Result<()> {
        let (name, stream) = discover_port(&self.config.ports, self.config.baud_rate)?;
        if let Some(previous) = self.port_name.as_deref()
            && previous != name
        {
            self.logger.info(&format!(
                "Telemetry device changed from {} to {}",
                previous, name
            ));
        }
        self.logger = get_logger_with_context(LogContext::new("telemetry").with_port(name.clone()));
        self.logger.info(&format!(
            "Serial connection established at {} baud",
            self.config.baud_rate
        ));
        self.port = Some(Box::new(stream));
        self.port_name = Some(name);
        Ok(())
    }

    fn drop_port(&mut self, reason: &str) {
        self.logger
            .warn(&format!("{}, dropping port until rediscovery", reason));
        self.port = None;
    }
}

/// Result of one bounded read on an open port
#[derive(Debug)]
enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing arrived before the deadline
    Silent,
    /// The device hung up (end of stream)
    Closed,
    Failed(std::io::Error),
}

async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(port: &mut R, wait: Duration) -> ReadOutcome {
    let mut buf = vec![0u8; READ_CHUNK];
    match timeout(wait, port.read(&mut buf)).await {
        Ok(Ok(0)) => ReadOutcome::Closed,
        Ok(Ok(n)) => {
            buf.truncate(n);
            ReadOutcome::Data(buf)
        }
        Ok(Err(e)) => ReadOutcome::Failed(e),
        Err(_) => ReadOutcome::Silent,
    }
}

/// Try candidate device paths in order and open the first that works
pub fn discover_port(candidates: &[String], baud_rate: u32) -> Result<(String, SerialStream)> {
    let logger = get_logger("telemetry");
    let mut present = Vec::new();

    for candidate in candidates {
        if !Path::new(candidate).exists() {
            logger.debug(&format!("Serial device {} does not exist", candidate));
            continue;
        }
        present.push(candidate.clone());
        match tokio_serial::new(candidate, baud_rate)
            .timeout(Duration::from_secs(1))
            .open_native_async()
        {
            Ok(stream) => {
                logger.info(&format!("Found available serial device: {}", candidate));
                return Ok((candidate.clone(), stream));
            }
            Err(e) => {
                logger.debug(&format!("Serial device {} not accessible: {}", candidate, e));
            }
        }
    }

    let message = if present.is_empty() {
        format!("No serial devices found. Checked: {:?}", candidates)
    } else {
        format!(
            "No accessible serial devices found. Available but inaccessible: {:?}",
            present
        )
    };
    Err(ChargeGuardError::telemetry(message))
}

#[async_trait::async_trait]
impl TelemetrySource for SerialTelemetry {
    async fn read(&mut self, wait: Duration) -> Result<Vec<u8>> {
        if self.port.is_none() {
            self.connect()?;
            self.reconnects = self.reconnects.saturating_add(1);
        }

        let Some(port) = self.port.as_mut() else {
            return Err(ChargeGuardError::telemetry("serial port not open"));
        };

        match read_chunk(port.as_mut(), wait).await {
            ReadOutcome::Data(bytes) => Ok(bytes),
            ReadOutcome::Silent => Ok(Vec::new()),
            ReadOutcome::Closed => {
                self.drop_port("Serial device closed");
                Err(ChargeGuardError::telemetry("serial device closed"))
            }
            ReadOutcome::Failed(e) => {
                self.drop_port(&format!("Serial read failed: {}", e));
                Err(ChargeGuardError::telemetry(e.to_string()))
            }
        }
    }

    fn describe(&self) -> String {
        let name = self.port_name().unwrap_or("serial");
        let mut out = if self.port.is_some() {
            name.to_string()
        } else {
            format!("{} (disconnected)", name)
        };
        if self.reconnects() > 0 {
            out.push_str(&format!(", {} reconnects", self.reconnects()));
        }
        out
    }
}
