//! Checksummed binary framing for host/robot links.
//!
//! Every message travels inside an envelope:
//! - A 2-byte marker (`0xAA 0x55`) for stream synchronization
//! - A 2-byte big-endian total length (the whole frame, marker to trailer)
//! - A 1-byte message type id
//! - The payload
//! - A 1-byte checksum trailer
//!
//! Links without reliable length framing carry the same envelope
//! byte-stuffed (COBS) and terminated by `0x00`. Both strategies reassemble
//! frames across arbitrarily fragmented reads and resynchronize after
//! corruption.

pub mod checksum;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;
pub mod reader;
pub mod stuffing;
pub mod types;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

pub use checksum::{Checksum, ChecksumKind, Crc8, XorSum};
pub use codec::{encode_for_link, FrameConfig, Framing, StreamDecoder, DEFAULT_MAX_PAYLOAD};
pub use envelope::{
    build, parse, Frame, HEADER_SIZE, MARKER, MAX_FRAME_SIZE, MAX_PAYLOAD, MIN_FRAME_SIZE,
    PREFIX_SIZE, TRAILER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{RawMessage, TypeRange, HOST_ID};
pub use reader::FrameReader;
pub use types::{MESSAGE_BLOCKED, RESERVED};
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use async_codec::LinkCodec;
