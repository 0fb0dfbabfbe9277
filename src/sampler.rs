//! Per-tick voltage sampling over the telemetry link
//!
//! [`VoltageSampler::sample`] turns a bounded read window into at most one
//! [`VoltageReading`]. Sensor trouble is never fatal here: timeouts, corrupt
//! frames and device errors all collapse into `None`, with the cause kept
//! for the control loop's logs.

use crate::logging::get_logger;
use crate::telemetry::TelemetrySource;
use crate::vedirect::{DecoderStats, FrameDecoder, TelemetryFrame};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// One decoded pack voltage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoltageReading {
    millivolts: i64,
    at: DateTime<Utc>,
}

impl VoltageReading {
    pub fn from_millivolts(millivolts: i64, at: DateTime<Utc>) -> Self {
        Self { millivolts, at }
    }

    /// Raw device value
    pub fn millivolts(&self) -> i64 {
        self.millivolts
    }

    /// Volts at full precision
    pub fn volts(&self) -> f64 {
        self.millivolts as f64 / 1000.0
    }

    /// When the frame carrying this value was decoded
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Why the last sample produced no reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SampleFailure {
    /// No valid frame arrived within the window
    Timeout,
    /// Valid frames arrived but none carried a usable voltage field
    MissingField,
    /// The telemetry device reported an error
    Source(String),
}

impl std::fmt::Display for SampleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleFailure::Timeout => write!(f, "no valid frame within sample window"),
            SampleFailure::MissingField => write!(f, "frames carried no voltage field"),
            SampleFailure::Source(msg) => write!(f, "telemetry source error: {}", msg),
        }
    }
}

/// Wraps a telemetry source and frame decoder with a bounded read window
pub struct VoltageSampler {
    source: Box<dyn TelemetrySource>,
    decoder: FrameDecoder,
    voltage_label: String,
    window: Duration,
    last_failure: Option<SampleFailure>,
    bad_values: u64,
    logger: crate::logging::StructuredLogger,
}

impl VoltageSampler {
    pub fn new(
        source: Box<dyn TelemetrySource>,
        decoder: FrameDecoder,
        voltage_label: &str,
        window: Duration,
    ) -> Self {
        Self {
            source,
            decoder,
            voltage_label: voltage_label.to_string(),
            window,
            last_failure: None,
            bad_values: 0,
            logger: get_logger("sampler"),
        }
    }

    /// Read for up to one window and return the freshest voltage seen
    ///
    /// Returns early once a reading is held and the source has nothing more
    /// ready, so a healthy link does not stall the loop for the full window.
    pub async fn sample(&mut self) -> Option<VoltageReading> {
        let deadline = Instant::now() + self.window;
        let mut latest: Option<VoltageReading> = None;
        let mut saw_frame = false;
        let mut last_labels = String::new();

        loop {
            let now = Instant::now();
            let wait = if latest.is_some() {
                if now >= deadline {
                    break;
                }
                Duration::ZERO
            } else {
                let remaining = deadline.saturating_duration_since(now);
                if remaining.is_zero() {
                    break;
                }
                remaining
            };

            match self.source.read(wait).await {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(bytes) => {
                    let frames: Vec<TelemetryFrame> = self.decoder.feed(&bytes).collect();
                    for frame in frames {
                        saw_frame = true;
                        if let Some(reading) = self.reading_from(&frame) {
                            latest = Some(reading);
                        } else {
                            last_labels = frame.labels().collect::<Vec<_>>().join(",");
                        }
                    }
                }
                Err(e) => {
                    self.decoder.reset();
                    if latest.is_none() {
                        self.logger
                            .debug(&format!("{} read failed: {}", self.source.describe(), e));
                        self.last_failure = Some(SampleFailure::Source(e.to_string()));
                        return None;
                    }
                    break;
                }
            }
        }

        if latest.is_some() {
            self.last_failure = None;
        } else if saw_frame {
            self.logger.debug(&format!(
                "No {} field in window, last frame carried [{}]",
                self.voltage_label, last_labels
            ));
            self.last_failure = Some(SampleFailure::MissingField);
        } else {
            self.last_failure = Some(SampleFailure::Timeout);
        }
        latest
    }

    fn reading_from(&mut self, frame: &TelemetryFrame) -> Option<VoltageReading> {
        let raw = frame.get(&self.voltage_label)?;
        match raw.trim().parse::<i64>() {
            Ok(mv) => Some(VoltageReading::from_millivolts(mv, Utc::now())),
            Err(_) => {
                self.bad_values = self.bad_values.saturating_add(1);
                self.logger.debug(&format!(
                    "Ignoring unparseable {} value '{}'",
                    self.voltage_label, raw
                ));
                None
            }
        }
    }

    /// Cause of the most recent empty sample, cleared by a good one
    pub fn last_failure(&self) -> Option<&SampleFailure> {
        self.last_failure.as_ref()
    }

    /// Decoder counters
    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    /// Voltage fields that failed to parse
    pub fn bad_values(&self) -> u64 {
        self.bad_values
    }

    /// Description of the underlying source
    pub fn source_description(&self) -> String {
        self.source.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChargeGuardError, Result};
    use crate::vedirect::encode_block;
    use std::collections::VecDeque;

    /// Replays scripted read results; an exhausted script reads as silence
    struct ScriptedSource {
        reads: VecDeque<Result<Vec<u8>>>,
    }

    impl ScriptedSource {
        fn new(reads: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
            }
        }
    }

    #[async_trait::async_trait]
    impl TelemetrySource for ScriptedSource {
        async fn read(&mut self, _wait: Duration) -> Result<Vec<u8>> {
            self.reads.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn block(mv: &str) -> Vec<u8> {
        encode_block(&[("PID", "0xA389"), ("V", mv), ("I", "350")])
    }

    fn sampler(reads: Vec<Result<Vec<u8>>>) -> VoltageSampler {
        VoltageSampler::new(
            Box::new(ScriptedSource::new(reads)),
            FrameDecoder::default(),
            "V",
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn converts_millivolts_at_full_precision() {
        let mut s = sampler(vec![Ok(block("24813"))]);
        let r = s.sample().await.unwrap();
        assert_eq!(r.millivolts(), 24813);
        assert!((r.volts() - 24.813).abs() < 1e-12);
        assert!(s.last_failure().is_none());
    }

    #[tokio::test]
    async fn last_frame_in_window_wins() {
        let mut bytes = block("24100");
        bytes.extend(block("24200"));
        let mut s = sampler(vec![Ok(bytes), Ok(block("24300")), Ok(Vec::new())]);
        let r = s.sample().await.unwrap();
        assert_eq!(r.millivolts(), 24300);
    }

    #[tokio::test]
    async fn frame_split_across_reads() {
        let b = block("24650");
        let (head, tail) = b.split_at(9);
        let mut s = sampler(vec![Ok(head.to_vec()), Ok(tail.to_vec())]);
        assert_eq!(s.sample().await.map(|r| r.millivolts()), Some(24650));
    }

    #[tokio::test]
    async fn silence_is_a_timeout() {
        let mut s = sampler(vec![]);
        assert!(s.sample().await.is_none());
        assert_eq!(s.last_failure(), Some(&SampleFailure::Timeout));
    }

    #[tokio::test]
    async fn corrupt_frame_gives_no_reading() {
        let mut b = block("24900");
        let last = b.len() - 1;
        b[last] ^= 0x40;
        let mut s = sampler(vec![Ok(b)]);
        assert!(s.sample().await.is_none());
        assert_eq!(s.decoder_stats().checksum_failures, 1);
        assert_eq!(s.last_failure(), Some(&SampleFailure::Timeout));
    }

    #[tokio::test]
    async fn frames_without_voltage_are_reported() {
        let b = encode_block(&[("PID", "0xA389"), ("I", "120")]);
        let mut s = sampler(vec![Ok(b)]);
        assert!(s.sample().await.is_none());
        assert_eq!(s.last_failure(), Some(&SampleFailure::MissingField));
    }

    #[tokio::test]
    async fn unparseable_voltage_is_skipped() {
        let b = encode_block(&[("V", "---")]);
        let mut s = sampler(vec![Ok(b)]);
        assert!(s.sample().await.is_none());
        assert_eq!(s.bad_values(), 1);
    }

    #[tokio::test]
    async fn source_error_is_recoverable() {
        let mut s = sampler(vec![
            Err(ChargeGuardError::telemetry("device unplugged")),
            Ok(block("24400")),
        ]);
        assert!(s.sample().await.is_none());
        assert!(matches!(s.last_failure(), Some(SampleFailure::Source(_))));

        let r = s.sample().await.unwrap();
        assert_eq!(r.millivolts(), 24400);
        assert!(s.last_failure().is_none());
    }

    #[tokio::test]
    async fn source_error_discards_partial_frame() {
        let b = block("24000");
        let mut s = sampler(vec![
            Ok(b[..12].to_vec()),
            Err(ChargeGuardError::telemetry("EIO")),
            Ok(block("24100")),
        ]);
        assert!(s.sample().await.is_none());
        assert_eq!(s.sample().await.map(|r| r.millivolts()), Some(24100));
        assert_eq!(s.decoder_stats().checksum_failures, 0);
    }
}
