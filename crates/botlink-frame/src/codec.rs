use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::checksum::{Checksum, ChecksumKind};
use crate::envelope::{
    encode_frame, parse, peek_total_length, Frame, MARKER, MAX_FRAME_SIZE, MAX_PAYLOAD,
    MIN_FRAME_SIZE,
};
use crate::error::{FrameError, Result};
use crate::stuffing::{self, DELIMITER};

/// Default maximum payload size: 4 KiB. Robot firmware buffers are small.
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// How frames are delimited on a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Read the 4-byte prefix, then exactly `total_length - 4` more bytes.
    #[default]
    LengthPrefixed,
    /// COBS-stuffed frames terminated by `0x00`.
    Delimited,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "length" | "length-prefixed" | "length_prefixed" => Ok(Framing::LengthPrefixed),
            "delimited" | "cobs" => Ok(Framing::Delimited),
            other => Err(format!("unknown framing strategy: {other}")),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::LengthPrefixed => f.write_str("length-prefixed"),
            Framing::Delimited => f.write_str("delimited"),
        }
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 4 KiB.
    pub max_payload_size: usize,
    /// Trailer algorithm. Default: CRC-8.
    pub checksum: ChecksumKind,
    /// Framing strategy. Default: length-prefixed.
    pub framing: Framing,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl FrameConfig {
    /// Largest total length accepted from the wire.
    pub fn max_frame_size(&self) -> usize {
        (MIN_FRAME_SIZE + self.max_payload_size.min(MAX_PAYLOAD)).min(MAX_FRAME_SIZE)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            checksum: ChecksumKind::default(),
            framing: Framing::default(),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Encode one message in the link's framing, appending to `dst`.
pub fn encode_for_link(
    type_id: u8,
    payload: &[u8],
    config: &FrameConfig,
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }
    match config.framing {
        Framing::LengthPrefixed => {
            encode_frame(type_id, payload, &config.checksum, dst)?;
        }
        Framing::Delimited => {
            let mut raw = BytesMut::with_capacity(MIN_FRAME_SIZE + payload.len());
            encode_frame(type_id, payload, &config.checksum, &mut raw)?;
            stuffing::encode_into(&raw, dst);
        }
    }
    Ok(())
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
///
/// Feed bytes with [`push`](Self::push) and drain frames with
/// [`decode`](Self::decode). Recoverable errors (see
/// [`FrameError::is_recoverable`]) drop the offending bytes; calling `decode`
/// again continues with the rest of the stream.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    config: FrameConfig,
    /// The buffer starts where the previous frame ended. Cleared by a resync.
    synced: bool,
}

impl StreamDecoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            synced: true,
        }
    }

    /// Append bytes read from the link.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Try to take the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        match self.config.framing {
            Framing::LengthPrefixed => self.decode_length_prefixed(),
            Framing::Delimited => self.decode_delimited(),
        }
    }

    fn decode_length_prefixed(&mut self) -> Result<Option<Frame>> {
        let mut discarded = 0usize;
        loop {
            let total = match peek_total_length(&self.buf) {
                Ok(Some(total)) => total,
                Ok(None) => return corrupted(discarded),
                Err(_) => {
                    discarded += self.resync();
                    continue;
                }
            };

            // A length no frame can have means we locked onto a false marker.
            if total < MIN_FRAME_SIZE || total > self.config.max_frame_size() {
                discarded += self.resync();
                continue;
            }

            if self.synced {
                if self.buf.len() < total {
                    return Ok(None);
                }
                let bytes = self.buf.split_to(total);
                return parse(&bytes, &self.config.checksum).map(Some);
            }

            // After a resync the marker may sit inside a corrupted frame's
            // payload. Nothing is consumed until the candidate checks out.
            let accepted = match self.plausible_at(0) {
                Some(accepted) => Some(accepted),
                None if self.later_frame_complete() => Some(false),
                None => None,
            };
            match accepted {
                Some(true) if discarded > 0 => {
                    return Err(FrameError::HeaderCorrupted { discarded });
                }
                Some(true) => {
                    self.synced = true;
                    let bytes = self.buf.split_to(total);
                    return parse(&bytes, &self.config.checksum).map(Some);
                }
                Some(false) => {
                    self.buf.advance(1);
                    discarded += 1 + self.resync();
                }
                None => return corrupted(discarded),
            }
        }
    }

    /// Whether a frame starting at `at` can be trusted: complete, checksum
    /// valid, and if it spans another marker, followed by a marker or the end
    /// of the buffer. `None` while its bytes are still arriving.
    fn plausible_at(&self, at: usize) -> Option<bool> {
        let rest = &self.buf[at..];
        let total = match peek_total_length(rest) {
            Ok(Some(total)) => total,
            Ok(None) => return None,
            Err(_) => return Some(false),
        };
        if total < MIN_FRAME_SIZE || total > self.config.max_frame_size() {
            return Some(false);
        }
        if rest.len() < total {
            return None;
        }
        if !self.config.checksum.verify(&rest[..total]).unwrap_or(false) {
            return Some(false);
        }

        let spans_marker = rest[1..total].windows(MARKER.len()).any(|w| w == MARKER);
        if !spans_marker {
            return Some(true);
        }
        let after = &rest[total..];
        let seen = after.len().min(MARKER.len());
        Some(after[..seen] == MARKER[..seen])
    }

    /// A complete, trustworthy frame starts somewhere past the first byte.
    fn later_frame_complete(&self) -> bool {
        (1..self.buf.len()).any(|at| {
            self.buf[at..].starts_with(&MARKER) && self.plausible_at(at) == Some(true)
        })
    }

    fn decode_delimited(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == DELIMITER) else {
                let limit = stuffing::max_encoded_len(self.config.max_frame_size());
                if self.buf.len() > limit {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    return Err(FrameError::FramingError(format!(
                        "no delimiter within {dropped} bytes"
                    )));
                }
                return Ok(None);
            };

            let chunk = self.buf.split_to(end + 1);
            if end == 0 {
                // Back-to-back delimiters are idle fill.
                continue;
            }

            let raw = stuffing::decode(&chunk)?;
            return parse(&raw, &self.config.checksum).map(Some);
        }
    }

    /// Drop bytes up to the next plausible marker. Returns how many were dropped.
    fn resync(&mut self) -> usize {
        let keep_from = (1..self.buf.len())
            .find(|&i| {
                let rest = &self.buf[i..];
                let seen = rest.len().min(MARKER.len());
                rest[..seen] == MARKER[..seen]
            })
            .unwrap_or(self.buf.len());
        self.buf.advance(keep_from);
        self.synced = false;
        keep_from
    }
}

fn corrupted(discarded: usize) -> Result<Option<Frame>> {
    if discarded > 0 {
        Err(FrameError::HeaderCorrupted { discarded })
    } else {
        Ok(None)
    }
}
