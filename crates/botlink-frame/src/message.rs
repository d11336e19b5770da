use std::ops::RangeInclusive;

use bytes::{Bytes, BytesMut};

use crate::codec::{encode_for_link, FrameConfig};
use crate::envelope::Frame;
use crate::error::{FrameError, Result};
use crate::types::{FIRST_APP_TYPE, LAST_APP_TYPE};

/// Address of the host on every link.
pub const HOST_ID: u32 = 0;

/// Type ids accepted from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRange {
    range: RangeInclusive<u8>,
}

impl TypeRange {
    pub fn new(first: u8, last: u8) -> Self {
        Self { range: first..=last }
    }

    pub fn contains(&self, type_id: u8) -> bool {
        self.range.contains(&type_id)
    }

    pub fn first(&self) -> u8 {
        *self.range.start()
    }

    pub fn last(&self) -> u8 {
        *self.range.end()
    }
}

impl Default for TypeRange {
    fn default() -> Self {
        Self::new(FIRST_APP_TYPE, LAST_APP_TYPE)
    }
}

/// Structural view of one frame, before any application decoding.
///
/// Inbound messages are addressed from the robot's client id to [`HOST_ID`];
/// `sequence` counts frames per client and direction, starting at 0 and
/// wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub source_id: u32,
    pub destination_id: u32,
    pub sub_channel: u8,
    pub type_id: u8,
    pub sequence: u16,
    pub length: u16,
    pub checksum: u8,
    pub data: Bytes,
}

impl RawMessage {
    /// Wrap a validated inbound frame.
    pub fn from_frame(frame: Frame, source_id: u32, sub_channel: u8, sequence: u16) -> Self {
        Self {
            source_id,
            destination_id: HOST_ID,
            sub_channel,
            type_id: frame.type_id,
            sequence,
            length: frame.payload.len() as u16,
            checksum: frame.trailer,
            data: frame.payload,
        }
    }

    /// An outbound message from the host. The checksum is filled in when the
    /// frame is built.
    pub fn outbound(destination_id: u32, type_id: u8, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            source_id: HOST_ID,
            destination_id,
            sub_channel: 0,
            type_id,
            sequence: 0,
            length: data.len().min(usize::from(u16::MAX)) as u16,
            checksum: 0,
            data,
        }
    }

    /// Check every scalar field against its declared range.
    pub fn validate(&self, types: &TypeRange, max_payload: usize) -> Result<()> {
        if !types.contains(self.type_id) {
            return Err(FrameError::FieldOutOfRange {
                field: "type_id",
                value: u64::from(self.type_id),
            });
        }
        if usize::from(self.length) != self.data.len() {
            return Err(FrameError::FieldOutOfRange {
                field: "length",
                value: u64::from(self.length),
            });
        }
        if self.data.len() > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: self.data.len(),
                max: max_payload,
            });
        }
        Ok(())
    }

    /// Encode this message for a link, appending to `dst`.
    pub fn encode(&self, config: &FrameConfig, dst: &mut BytesMut) -> Result<()> {
        encode_for_link(self.type_id, &self.data, config, dst)
    }
}
