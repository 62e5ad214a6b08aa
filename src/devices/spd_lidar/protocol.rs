//! Single-point lidar stream protocol
//!
//! Frame format (8 bytes, both directions):
//! - Header (3 bytes): 0x55 0xAA 0x88
//! - Status (1 byte)
//! - Reserved (1 byte, 0xFF)
//! - Distance (2 bytes, big-endian, mm)
//! - Checksum (1 byte)
//!
//! Outbound checksums sum bytes 2..=6; inbound checksums sum bytes 0..=6.
//! Responses may arrive split across reads or several frames at once, so
//! [`FrameDecoder`] buffers bytes and resynchronizes on the header.

use crate::error::{Error, Result};

/// Frame header marker
pub const HEADER: [u8; 3] = [0x55, 0xAA, 0x88];

/// Size of every frame on the wire
pub const FRAME_SIZE: usize = 8;

/// Single measurement request without its checksum
pub const SINGLE_SHOT: [u8; 7] = [0x55, 0xAA, 0x88, 0xFF, 0xFF, 0xFF, 0xFF];

/// Checksum appended to an outbound command
pub fn checksum_send(frame: &[u8]) -> u8 {
    frame
        .iter()
        .take(7)
        .skip(2)
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Checksum expected in byte 7 of an inbound frame
pub fn checksum_recv(frame: &[u8]) -> u8 {
    frame.iter().take(7).fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// One decoded frame; emitted even when the checksum does not match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LidarFrame {
    pub valid_header: bool,
    pub checksum_ok: bool,
    pub status: u8,
    pub distance_mm: u16,
    pub raw: [u8; FRAME_SIZE],
}

impl LidarFrame {
    /// Decode exactly one 8-byte frame
    pub fn parse(raw: [u8; FRAME_SIZE]) -> Self {
        Self {
            valid_header: raw[..3] == HEADER,
            checksum_ok: checksum_recv(&raw) == raw[7],
            status: raw[3],
            distance_mm: u16::from_be_bytes([raw[5], raw[6]]),
            raw,
        }
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_mm as f64 / 1000.0
    }
}

/// Push-style frame decoder over a growing byte buffer
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and return every complete frame, in order
    pub fn push(&mut self, data: &[u8]) -> Vec<LidarFrame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buffer.len() >= FRAME_SIZE {
            // Drop everything before the header; with no header in sight keep
            // the last two bytes, they may be the start of one
            let start = self
                .buffer
                .windows(HEADER.len())
                .position(|w| w == HEADER)
                .unwrap_or(self.buffer.len() - (HEADER.len() - 1));
            if start > 0 {
                log::trace!("spd_lidar: skipping {} byte(s) before header", start);
                self.buffer.drain(..start);
            }
            if self.buffer.len() < FRAME_SIZE {
                break;
            }

            let mut raw = [0u8; FRAME_SIZE];
            raw.copy_from_slice(&self.buffer[..FRAME_SIZE]);
            self.buffer.drain(..FRAME_SIZE);

            let frame = LidarFrame::parse(raw);
            if !frame.checksum_ok {
                log::debug!("spd_lidar: checksum mismatch in frame {:02X?}", raw);
            }
            frames.push(frame);
        }
        frames
    }

    /// Bytes waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Parse whitespace separated hex bytes; `0x` prefixes are optional
pub fn parse_hex_line(line: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in line.split_whitespace() {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if digits.is_empty() {
            continue;
        }
        let value = u8::from_str_radix(digits, 16)
            .map_err(|_| Error::Format(format!("invalid hex byte: {}", token)))?;
        bytes.push(value);
    }
    if bytes.is_empty() {
        return Err(Error::Format(
            "invalid input, use 'single' or hex bytes".to_string(),
        ));
    }
    Ok(bytes)
}

/// Build the outbound command for an operator line
///
/// `single` is the measurement request. Seven hex bytes get a checksum
/// appended; eight are sent as given.
pub fn build_command(line: &str) -> Result<Vec<u8>> {
    let mut command = if line.trim() == "single" {
        SINGLE_SHOT.to_vec()
    } else {
        parse_hex_line(line)?
    };

    match command.len() {
        7 => {
            let checksum = checksum_send(&command);
            command.push(checksum);
        }
        FRAME_SIZE => {}
        n => return Err(Error::Format(format!("Need 7 or 8 bytes, got {}", n))),
    }
    Ok(command)
}

/// `0x55 0xAA ...` rendering for logs and reports
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
