use std::io::{ErrorKind, Read};

use botlink_transport::LinkStream;

use crate::codec::{FrameConfig, StreamDecoder};
use crate::envelope::Frame;
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally: callers always get complete frames.
/// A recoverable error (corrupted header, bad checksum, bad stuffing) is
/// returned once and the reader stays usable for the next frame.
pub struct FrameReader<T> {
    inner: T,
    decoder: StreamDecoder,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: StreamDecoder::new(config),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.decoder.push(&chunk[..read]);
        }
    }

    /// Read frames until one decodes cleanly, skipping recoverable errors.
    pub fn read_valid_frame(&mut self) -> Result<Frame> {
        loop {
            match self.read_frame() {
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(error = %err, "dropping invalid frame");
                }
                other => return other,
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        self.decoder.config()
    }
}

impl FrameReader<LinkStream> {
    /// Create a frame reader for a link and apply the read timeout from config.
    pub fn with_config_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: botlink_transport::TransportError) -> FrameError {
    match err {
        botlink_transport::TransportError::Io(io)
        | botlink_transport::TransportError::Accept(io) => FrameError::Io(io),
        botlink_transport::TransportError::Bind { source, .. }
        | botlink_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
