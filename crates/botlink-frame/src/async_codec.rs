//! `tokio_util::codec` adapter over [`StreamDecoder`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::codec::{encode_for_link, FrameConfig, StreamDecoder};
use crate::envelope::Frame;
use crate::error::FrameError;
use crate::message::RawMessage;

/// Frame codec for `FramedRead`/`FramedWrite` over async links.
///
/// Recoverable errors are logged and skipped: a `Framed` stream ends after
/// the first error it sees, and one corrupted frame must not end the link.
#[derive(Debug)]
pub struct LinkCodec {
    decoder: StreamDecoder,
}

impl LinkCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            decoder: StreamDecoder::new(config),
        }
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl Decoder for LinkCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let incoming = src.split();
            self.decoder.push(&incoming);
        }
        loop {
            match self.decoder.decode() {
                Ok(frame) => return Ok(frame),
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "dropping invalid frame");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.decoder.buffered() == 0 => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<RawMessage> for LinkCodec {
    type Error = FrameError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_for_link(item.type_id, &item.data, self.decoder.config(), dst)
    }
}
