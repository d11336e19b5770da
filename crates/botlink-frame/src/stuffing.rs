//! COBS byte stuffing for links without length framing.
//!
//! Stuffed output never contains [`DELIMITER`] except as the trailing
//! terminator appended by [`encode`].

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Frame terminator on delimiter-based links.
pub const DELIMITER: u8 = 0x00;

/// Worst-case stuffed size of `len` payload bytes, terminator included.
pub fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 2
}

/// Stuff `payload` and append the terminator.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = cobs::encode_vec(payload);
    out.push(DELIMITER);
    out
}

/// Stuff `payload` into `dst`, terminator included.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(max_encoded_len(payload.len()));
    dst.put_slice(&cobs::encode_vec(payload));
    dst.put_u8(DELIMITER);
}

/// Reverse [`encode`]. The trailing terminator is optional.
///
/// A delimiter before the end, or a block code pointing past the end of the
/// input, is a [`FrameError::FramingError`].
pub fn decode(stuffed: &[u8]) -> Result<Vec<u8>> {
    let body = match stuffed.split_last() {
        Some((&DELIMITER, rest)) => rest,
        _ => stuffed,
    };
    check_blocks(body)?;
    cobs::decode_vec(body)
        .map_err(|_| FrameError::FramingError("invalid COBS block structure".to_string()))
}

/// Walk the block codes so malformed input never reaches the decoder.
fn check_blocks(body: &[u8]) -> Result<()> {
    if body.is_empty() {
        return Err(FrameError::FramingError("empty stuffed frame".to_string()));
    }
    let mut idx = 0usize;
    while idx < body.len() {
        let code = usize::from(body[idx]);
        if code == 0 {
            return Err(FrameError::FramingError(format!(
                "unexpected delimiter at offset {idx}"
            )));
        }
        let end = idx + code;
        if end > body.len() {
            return Err(FrameError::FramingError(format!(
                "truncated block at offset {idx} (needs {} more bytes)",
                end - body.len()
            )));
        }
        if let Some(pos) = body[idx + 1..end].iter().position(|&b| b == DELIMITER) {
            return Err(FrameError::FramingError(format!(
                "unexpected delimiter at offset {}",
                idx + 1 + pos
            )));
        }
        idx = end;
    }
    Ok(())
}
