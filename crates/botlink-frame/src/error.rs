/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A precondition on the input was violated (e.g. empty checksum input).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The frame marker did not match. Buffered bytes were dropped up to the
    /// next plausible marker.
    #[error("frame header corrupted ({discarded} bytes discarded)")]
    HeaderCorrupted { discarded: usize },

    /// The frame was read completely but failed its integrity check.
    #[error("checksum mismatch on frame type {type_id:#04x}")]
    ChecksumMismatch { type_id: u8 },

    /// Byte-stuffed data could not be decoded.
    #[error("framing error: {0}")]
    FramingError(String),

    /// The total length field disagrees with the bytes supplied.
    #[error("invalid frame length {length}")]
    InvalidLength { length: usize },

    /// The buffer ends before the frame does.
    #[error("truncated frame (expected {expected} bytes, got {actual})")]
    Truncated { expected: usize, actual: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A decoded message field is outside its declared range.
    #[error("field {field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: u64 },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the stream is still usable after this error.
    ///
    /// Validation failures drop one frame; the next frame decodes normally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::HeaderCorrupted { .. }
                | FrameError::ChecksumMismatch { .. }
                | FrameError::FramingError(_)
                | FrameError::InvalidLength { .. }
                | FrameError::Truncated { .. }
                | FrameError::FieldOutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
