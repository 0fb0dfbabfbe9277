//! VE.Direct text protocol decoder
//!
//! A VE.Direct device streams blocks of `\r\n<label>\t<value>` fields, each
//! block closed by a `\r\nChecksum\t<byte>` field chosen so that the sum of
//! every byte in the block is zero modulo 256. Asynchronous HEX records
//! (`:` up to `\n`) may be interleaved anywhere and are not part of a block.
//!
//! [`FrameDecoder`] is incremental: bytes are queued with
//! [`FrameDecoder::feed`] and decoded lazily as the returned iterator is
//! driven. Corrupt blocks are dropped and counted, never reported as errors.

use crate::logging::get_logger;
use std::collections::{BTreeMap, VecDeque};

/// Label of the field that terminates every block
pub const CHECKSUM_LABEL: &str = "Checksum";

/// Default upper bound on a single block
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 512;

/// One self-delimited, checksum-protected block of telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    raw: Vec<u8>,
    fields: BTreeMap<String, String>,
    valid: bool,
}

impl TelemetryFrame {
    /// Build a frame from a complete block, checksum byte included
    pub fn from_block(raw: Vec<u8>) -> Self {
        let checksum_ok = block_checksum(&raw) == 0;
        let fields = if checksum_ok {
            parse_fields(&raw)
        } else {
            None
        };
        let valid = fields.is_some();
        Self {
            raw,
            fields: fields.unwrap_or_default(),
            valid,
        }
    }

    /// Raw bytes of the block
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the block passed checksum and structural validation
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Value of a field by label
    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields.get(label).map(String::as_str)
    }

    /// Parse a field as a signed integer (VE.Direct reports mV, mA, ...)
    pub fn integer(&self, label: &str) -> Option<i64> {
        self.get(label)?.trim().parse().ok()
    }

    /// Labels present in this frame, checksum excluded
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of data fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the frame carries no data fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Sum of all bytes modulo 256
pub fn block_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Split a checksum-valid block into its label/value pairs
fn parse_fields(raw: &[u8]) -> Option<BTreeMap<String, String>> {
    // The final byte is the checksum value and may be any octet
    let (_, body) = raw.split_last()?;
    let text = std::str::from_utf8(body).ok()?;

    let mut fields = BTreeMap::new();
    let mut saw_checksum = false;
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (label, value) = line.split_once('\t')?;
        if label.is_empty() {
            return None;
        }
        if label == CHECKSUM_LABEL {
            saw_checksum = true;
            continue;
        }
        if fields.insert(label.to_string(), value.to_string()).is_some() {
            return None;
        }
    }
    saw_checksum.then_some(fields)
}

/// Counters describing what the decoder has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DecoderStats {
    /// Blocks that passed validation
    pub frames_accepted: u64,
    /// Blocks dropped for a non-zero checksum
    pub checksum_failures: u64,
    /// Checksum-valid blocks that did not decompose into fields
    pub malformed: u64,
    /// Blocks abandoned for exceeding the size bound
    pub oversized: u64,
    /// HEX records skipped
    pub hex_records: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Collecting a label
    Label,
    /// Collecting a value up to the next line break
    Value,
    /// Next byte is the checksum and closes the block
    ChecksumByte,
    /// Inside a HEX record; resume the saved state after `\n`
    Hex(HexResume),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HexResume {
    Label,
    Value,
}

/// Incremental VE.Direct block decoder
#[derive(Debug)]
pub struct FrameDecoder {
    pending: VecDeque<u8>,
    block: Vec<u8>,
    label: Vec<u8>,
    state: State,
    max_block_bytes: usize,
    stats: DecoderStats,
    logger: crate::logging::StructuredLogger,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCK_BYTES)
    }
}

impl FrameDecoder {
    /// Create a decoder bounding blocks to `max_block_bytes`
    pub fn new(max_block_bytes: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            block: Vec::with_capacity(256),
            label: Vec::with_capacity(16),
            state: State::Label,
            max_block_bytes,
            stats: DecoderStats::default(),
            logger: get_logger("vedirect"),
        }
    }

    /// Queue bytes and return a lazy iterator over the frames they complete
    ///
    /// Anything the iterator does not consume stays queued for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.pending.extend(bytes.iter().copied());
        Frames { decoder: self }
    }

    /// Drop all buffered bytes, e.g. after the link was re-opened
    pub fn reset(&mut self) {
        self.pending.clear();
        self.block.clear();
        self.label.clear();
        self.state = State::Label;
    }

    /// Counters since construction
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes held back waiting for more input
    pub fn buffered_len(&self) -> usize {
        self.pending.len() + self.block.len()
    }

    fn next_frame(&mut self) -> Option<TelemetryFrame> {
        while let Some(byte) = self.pending.pop_front() {
            if let Some(frame) = self.push_byte(byte) {
                return Some(frame);
            }
        }
        None
    }

    fn push_byte(&mut self, byte: u8) -> Option<TelemetryFrame> {
        match self.state {
            State::Hex(resume) => {
                if byte == b'\n' {
                    self.stats.hex_records += 1;
                    self.state = match resume {
                        HexResume::Label => State::Label,
                        HexResume::Value => State::Value,
                    };
                }
                None
            }
            State::ChecksumByte => {
                self.block.push(byte);
                self.state = State::Label;
                self.label.clear();
                let raw = std::mem::take(&mut self.block);
                self.close_block(raw)
            }
            State::Label => {
                if byte == b':' {
                    self.state = State::Hex(HexResume::Label);
                    return None;
                }
                self.append(byte);
                match byte {
                    b'\t' => {
                        self.state = if self.label == CHECKSUM_LABEL.as_bytes() {
                            State::ChecksumByte
                        } else {
                            State::Value
                        };
                        self.label.clear();
                    }
                    b'\r' | b'\n' => self.label.clear(),
                    _ => self.label.push(byte),
                }
                None
            }
            State::Value => {
                if byte == b':' {
                    self.state = State::Hex(HexResume::Value);
                    return None;
                }
                self.append(byte);
                if byte == b'\n' {
                    self.state = State::Label;
                    self.label.clear();
                }
                None
            }
        }
    }

    fn append(&mut self, byte: u8) {
        if self.block.len() >= self.max_block_bytes {
            self.stats.oversized += 1;
            self.logger.debug(&format!(
                "Discarding block exceeding {} bytes",
                self.max_block_bytes
            ));
            self.block.clear();
            self.label.clear();
            self.state = State::Label;
        }
        self.block.push(byte);
    }

    fn close_block(&mut self, raw: Vec<u8>) -> Option<TelemetryFrame> {
        let sum = block_checksum(&raw);
        if sum != 0 {
            self.stats.checksum_failures += 1;
            self.logger.debug(&format!(
                "Dropping {}-byte block with checksum remainder {:#04x}",
                raw.len(),
                sum
            ));
            return None;
        }

        let frame = TelemetryFrame::from_block(raw);
        if frame.is_valid() {
            self.stats.frames_accepted += 1;
            self.logger
                .trace(&format!("Accepted frame with {} fields", frame.len()));
            Some(frame)
        } else {
            self.stats.malformed += 1;
            self.logger.debug("Dropping structurally malformed block");
            None
        }
    }
}

/// Lazy sequence of frames completed by queued input
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = TelemetryFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Encode fields as a checksum-correct block, the way a device would send it
pub fn encode_block(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (label, value) in fields {
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(label.as_bytes());
        out.push(b'\t');
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(CHECKSUM_LABEL.as_bytes());
    out.push(b'\t');
    let sum = block_checksum(&out);
    out.push(0u8.wrapping_sub(sum));
    out
}
