//! One-byte integrity trailers.
//!
//! Any algorithm works as long as appending its trailer to a byte run makes
//! the checksum of the whole run equal [`Checksum::identity`].

use std::fmt;
use std::str::FromStr;

use crate::error::{FrameError, Result};

/// A one-byte checksum algorithm.
pub trait Checksum: Send + Sync {
    /// Algorithm name for logs.
    fn name(&self) -> &'static str;

    /// Checksum of `bytes`. Empty input is rejected.
    fn compute(&self, bytes: &[u8]) -> Result<u8>;

    /// Value `compute` yields over data followed by its own trailer.
    fn identity(&self) -> u8 {
        0
    }

    /// Verify a byte run that ends with its trailer.
    fn verify(&self, bytes_including_trailer: &[u8]) -> Result<bool> {
        Ok(self.compute(bytes_including_trailer)? == self.identity())
    }
}

const CRC8_POLY: u8 = 0x07;
const CRC8_TABLE: [u8; 256] = crc8_table(CRC8_POLY);

const fn crc8_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-8 (poly 0x07, init 0x00, no reflection, no final xor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc8;

impl Checksum for Crc8 {
    fn name(&self) -> &'static str {
        "crc8"
    }

    fn compute(&self, bytes: &[u8]) -> Result<u8> {
        if bytes.is_empty() {
            return Err(FrameError::InvalidInput("checksum over empty sequence"));
        }
        Ok(bytes
            .iter()
            .fold(0u8, |crc, &b| CRC8_TABLE[usize::from(crc ^ b)]))
    }
}

/// Longitudinal XOR of all bytes. Cheaper, weaker; used by older firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XorSum;

impl Checksum for XorSum {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn compute(&self, bytes: &[u8]) -> Result<u8> {
        if bytes.is_empty() {
            return Err(FrameError::InvalidInput("checksum over empty sequence"));
        }
        Ok(bytes.iter().fold(0u8, |acc, &b| acc ^ b))
    }
}

/// Checksum algorithm selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumKind {
    #[default]
    Crc8,
    Xor,
}

impl Checksum for ChecksumKind {
    fn name(&self) -> &'static str {
        match self {
            ChecksumKind::Crc8 => Crc8.name(),
            ChecksumKind::Xor => XorSum.name(),
        }
    }

    fn compute(&self, bytes: &[u8]) -> Result<u8> {
        match self {
            ChecksumKind::Crc8 => Crc8.compute(bytes),
            ChecksumKind::Xor => XorSum.compute(bytes),
        }
    }
}

impl FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crc8" | "crc-8" => Ok(ChecksumKind::Crc8),
            "xor" => Ok(ChecksumKind::Xor),
            other => Err(format!("unknown checksum algorithm: {other}")),
        }
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
