use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::Checksum;
use crate::error::{FrameError, Result};

/// Start-of-frame marker.
pub const MARKER: [u8; 2] = [0xAA, 0x55];

/// Marker (2) + total length (2). Enough to know how much more to read.
pub const PREFIX_SIZE: usize = 4;

/// Prefix + type id.
pub const HEADER_SIZE: usize = PREFIX_SIZE + 1;

/// One checksum byte.
pub const TRAILER_SIZE: usize = 1;

/// Smallest valid frame: empty payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest frame the 16-bit length field can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Largest payload that fits in a frame.
pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - MIN_FRAME_SIZE;

/// A validated frame taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type id.
    pub type_id: u8,
    /// The message payload.
    pub payload: Bytes,
    /// The checksum byte the frame carried.
    pub trailer: u8,
}

impl Frame {
    /// Value of the frame's total length field.
    pub fn total_length(&self) -> usize {
        MIN_FRAME_SIZE + self.payload.len()
    }

    /// Bytes this frame occupies on a length-prefixed link.
    pub fn wire_size(&self) -> usize {
        self.total_length()
    }
}

/// Encode a frame into `dst` and return its trailer.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────┬─────────┬───────────┬─────────┐
/// │ Marker 2B  │ Total len 2B │ Type 1B │ Payload   │ Trailer │
/// │ 0xAA 0x55  │ (BE, whole   │         │ (len - 6) │ 1B      │
/// │            │  frame)      │         │           │         │
/// └────────────┴──────────────┴─────────┴───────────┴─────────┘
/// ```
pub fn encode_frame(
    type_id: u8,
    payload: &[u8],
    checksum: &dyn Checksum,
    dst: &mut BytesMut,
) -> Result<u8> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let total = MIN_FRAME_SIZE + payload.len();
    let start = dst.len();
    dst.reserve(total);
    dst.put_slice(&MARKER);
    dst.put_u16(total as u16);
    dst.put_u8(type_id);
    dst.put_slice(payload);

    let trailer = checksum.compute(&dst[start..])?;
    dst.put_u8(trailer);
    Ok(trailer)
}

/// Build the exact bytes to put on a length-prefixed link.
pub fn build(type_id: u8, payload: &[u8], checksum: &dyn Checksum) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(MIN_FRAME_SIZE + payload.len());
    encode_frame(type_id, payload, checksum, &mut dst)?;
    Ok(dst.freeze())
}

/// Inspect the first bytes of a frame.
///
/// Fails with `HeaderCorrupted` as soon as the available bytes contradict the
/// marker, before any length is trusted. Returns `Ok(None)` until the whole
/// prefix is present, then the frame's total length.
pub fn peek_total_length(buf: &[u8]) -> Result<Option<usize>> {
    let seen = buf.len().min(MARKER.len());
    if buf[..seen] != MARKER[..seen] {
        return Err(FrameError::HeaderCorrupted { discarded: 0 });
    }
    if buf.len() < PREFIX_SIZE {
        return Ok(None);
    }
    Ok(Some(usize::from(u16::from_be_bytes([buf[2], buf[3]]))))
}

/// Parse exactly one frame from `buf`.
///
/// Validation order: marker, then length, then (only once every byte is
/// present) the checksum over the whole frame including its trailer.
pub fn parse(buf: &[u8], checksum: &dyn Checksum) -> Result<Frame> {
    let total = match peek_total_length(buf) {
        Ok(Some(total)) => total,
        Ok(None) => {
            return Err(FrameError::Truncated {
                expected: PREFIX_SIZE,
                actual: buf.len(),
            })
        }
        Err(FrameError::HeaderCorrupted { .. }) => {
            return Err(FrameError::HeaderCorrupted {
                discarded: buf.len(),
            })
        }
        Err(err) => return Err(err),
    };

    if total < MIN_FRAME_SIZE {
        return Err(FrameError::InvalidLength { length: total });
    }
    if buf.len() < total {
        return Err(FrameError::Truncated {
            expected: total,
            actual: buf.len(),
        });
    }
    if buf.len() > total {
        return Err(FrameError::InvalidLength { length: buf.len() });
    }

    let type_id = buf[PREFIX_SIZE];
    if !checksum.verify(buf)? {
        return Err(FrameError::ChecksumMismatch { type_id });
    }

    Ok(Frame {
        type_id,
        payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..total - TRAILER_SIZE]),
        trailer: buf[total - TRAILER_SIZE],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Crc8, XorSum};

    #[test]
    fn build_parse_roundtrip() {
        for len in [0usize, 1, 2, 63, 255, 1024] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = build(0x21, &payload, &Crc8).unwrap();
            assert_eq!(wire.len(), MIN_FRAME_SIZE + len);

            let frame = parse(&wire, &Crc8).unwrap();
            assert_eq!(frame.type_id, 0x21);
            assert_eq!(frame.payload.as_ref(), payload.as_slice());
            assert_eq!(frame.total_length(), wire.len());
        }
    }

    #[test]
    fn layout_matches_wire_format() {
        let wire = build(0x07, b"hi", &XorSum).unwrap();
        assert_eq!(&wire[..2], &MARKER);
        assert_eq!(&wire[2..4], &[0x00, 0x08]);
        assert_eq!(wire[4], 0x07);
        assert_eq!(&wire[5..7], b"hi");
        assert!(XorSum.verify(&wire).unwrap());
    }

    #[test]
    fn largest_payload_fits() {
        let payload = vec![0x5A; MAX_PAYLOAD];
        let wire = build(1, &payload, &Crc8).unwrap();
        assert_eq!(wire.len(), MAX_FRAME_SIZE);
        assert_eq!(parse(&wire, &Crc8).unwrap().payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = build(1, &payload, &Crc8).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn bad_marker_fails_before_length() {
        let mut wire = build(3, b"payload", &Crc8).unwrap().to_vec();
        wire[0] = 0x00;
        // Length field is garbage too; the marker check must win.
        wire[2] = 0xFF;
        assert!(matches!(
            parse(&wire, &Crc8),
            Err(FrameError::HeaderCorrupted { .. })
        ));
    }

    #[test]
    fn any_byte_flip_fails_validation() {
        let wire = build(9, b"telemetry", &Crc8).unwrap();
        for idx in 0..wire.len() {
            let mut mutated = wire.to_vec();
            mutated[idx] ^= 0x10;
            assert!(parse(&mutated, &Crc8).is_err(), "flip at {idx} went unnoticed");
        }
    }

    #[test]
    fn checksum_mismatch_reports_type() {
        let mut wire = build(0x42, b"abc", &Crc8).unwrap().to_vec();
        wire[6] ^= 0x01;
        assert!(matches!(
            parse(&wire, &Crc8),
            Err(FrameError::ChecksumMismatch { type_id: 0x42 })
        ));
    }

    #[test]
    fn truncated_and_overlong_buffers() {
        let wire = build(1, b"abcdef", &Crc8).unwrap();
        assert!(matches!(
            parse(&wire[..wire.len() - 1], &Crc8),
            Err(FrameError::Truncated { .. })
        ));
        assert!(matches!(parse(&wire[..3], &Crc8), Err(FrameError::Truncated { .. })));

        let mut longer = wire.to_vec();
        longer.push(0);
        assert!(matches!(
            parse(&longer, &Crc8),
            Err(FrameError::InvalidLength { .. })
        ));
    }

    #[test]
    fn peek_reports_progress() {
        assert_eq!(peek_total_length(&[]).unwrap(), None);
        assert_eq!(peek_total_length(&[0xAA]).unwrap(), None);
        assert_eq!(peek_total_length(&[0xAA, 0x55, 0x00]).unwrap(), None);
        assert_eq!(
            peek_total_length(&[0xAA, 0x55, 0x01, 0x02]).unwrap(),
            Some(0x0102)
        );
        assert!(peek_total_length(&[0x55]).is_err());
    }
}
