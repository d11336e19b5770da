use std::io::{self, ErrorKind, Write};
use std::thread;
use std::time::{Duration, Instant};

use botlink_transport::LinkStream;
use bytes::BytesMut;

use crate::codec::{encode_for_link, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::RawMessage;
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(1);

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a message as one frame (blocking).
    pub fn write_message(&mut self, message: &RawMessage) -> Result<()> {
        self.send(message.type_id, message.data.as_ref())
    }

    /// Encode and send a payload with the given type id.
    pub fn send(&mut self, type_id: u8, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_for_link(type_id, payload, &self.config, &mut self.buf)?;

        let started = Instant::now();
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.back_off(started, err)?;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.back_off(started, err)?;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Sleep briefly before retrying a stalled write. Gives up with the
    /// stall error once the configured write timeout has passed.
    fn back_off(&self, started: Instant, err: io::Error) -> Result<()> {
        if let Some(limit) = self.config.write_timeout {
            if started.elapsed() >= limit {
                return Err(FrameError::Io(err));
            }
        }
        thread::sleep(WOULD_BLOCK_BACKOFF);
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<LinkStream> {
    /// Create a frame writer for a link and apply the write timeout from config.
    pub fn with_config_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::checksum::Crc8;
    use crate::codec::Framing;
    use crate::envelope::parse;
    use crate::stuffing;

    /// Accepts nothing for the first `stalls` writes, then everything.
    struct Stalling {
        stalls: usize,
        attempts: usize,
        out: Vec<u8>,
    }

    impl Write for Stalling {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.attempts += 1;
            if self.attempts <= self.stalls {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            self.out.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_retries_after_would_block() {
        let inner = Stalling {
            stalls: 3,
            attempts: 0,
            out: Vec::new(),
        };
        let mut writer = FrameWriter::new(inner);
        let started = Instant::now();
        writer.send(2, b"later").unwrap();

        assert!(started.elapsed() >= WOULD_BLOCK_BACKOFF * 3);
        let inner = writer.into_inner();
        assert_eq!(inner.attempts, 4);
        let frame = parse(&inner.out, &Crc8).unwrap();
        assert_eq!(frame.payload.as_ref(), b"later");
    }

    #[test]
    fn write_gives_up_after_write_timeout() {
        let inner = Stalling {
            stalls: usize::MAX,
            attempts: 0,
            out: Vec::new(),
        };
        let config = FrameConfig {
            write_timeout: Some(Duration::from_millis(30)),
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(inner, config);
        let err = writer.send(2, b"never").unwrap_err();

        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::WouldBlock));
        // Backed off rather than spinning.
        assert!(writer.get_ref().attempts < 1000);
    }

    #[test]
    fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(1, b"hello").unwrap();

        let wire = writer.into_inner().into_inner();
        let frame = parse(&wire, &Crc8).unwrap();
        assert_eq!(frame.type_id, 1);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn delimited_writer_stuffs_frames() {
        let config = FrameConfig {
            framing: Framing::Delimited,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), config);
        writer.send(2, b"\x00zero").unwrap();

        let wire = writer.into_inner().into_inner();
        assert_eq!(wire.iter().filter(|&&b| b == 0).count(), 1);
        let frame = parse(&stuffing::decode(&wire).unwrap(), &Crc8).unwrap();
        assert_eq!(frame.payload.as_ref(), b"\x00zero");
    }

    #[test]
    fn write_message_uses_type_and_data() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_message(&RawMessage::outbound(4, 0x33, &b"cmd"[..]))
            .unwrap();

        let wire = writer.into_inner().into_inner();
        let frame = parse(&wire, &Crc8).unwrap();
        assert_eq!(frame.type_id, 0x33);
        assert_eq!(frame.payload.as_ref(), b"cmd");
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.send(1, b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn handles_would_block_and_interrupted_writes() {
        let sink = FlakyWriter {
            failures: vec![ErrorKind::WouldBlock, ErrorKind::Interrupted],
            data: Vec::new(),
        };
        let mut writer = FrameWriter::new(sink);
        writer.send(6, b"retry").unwrap();

        let inner = writer.into_inner();
        assert_eq!(parse(&inner.data, &Crc8).unwrap().payload.as_ref(), b"retry");
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(1, b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    struct FlakyWriter {
        failures: Vec<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.failures.pop() {
                return Err(std::io::Error::from(kind));
            }
            // Accept at most 3 bytes per call to exercise partial writes.
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
