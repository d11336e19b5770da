use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use botlink_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameWriter};
use botlink_transport::{LinkListener, LinkStream};
use tracing::debug;

use crate::error::{HostError, Result};

/// Robot end of a link, for simulators, tests and small robot programs.
///
/// Uses the same framing as the host, blocking on the calling thread.
pub struct RobotLink {
    reader: FrameReader<LinkStream>,
    writer: FrameWriter<LinkStream>,
    stash: VecDeque<Frame>,
}

impl RobotLink {
    /// Connect to a host.
    pub fn connect(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        config: FrameConfig,
    ) -> Result<Self> {
        let link = LinkListener::connect(addr)?;
        Self::from_link(link, config)
    }

    /// Wrap an already connected link.
    pub fn from_link(link: LinkStream, config: FrameConfig) -> Result<Self> {
        let reader_link = link.try_clone()?;
        Ok(Self {
            reader: FrameReader::with_config_link(reader_link, config.clone())?,
            writer: FrameWriter::with_config_link(link, config)?,
            stash: VecDeque::new(),
        })
    }

    pub fn send(&mut self, type_id: u8, payload: &[u8]) -> Result<()> {
        self.writer.send(type_id, payload)?;
        Ok(())
    }

    /// Next valid frame. Corrupted frames are skipped.
    pub fn recv(&mut self) -> Result<Frame> {
        if let Some(frame) = self.stash.pop_front() {
            return Ok(frame);
        }
        Ok(self.reader.read_valid_frame()?)
    }

    /// Next frame of `type_id`, waiting at most `timeout`. Frames of other
    /// types are kept for later [`recv`](Self::recv) calls.
    pub fn recv_type(&mut self, type_id: u8, timeout: Duration) -> Result<Frame> {
        self.recv_any(&[type_id], timeout)
    }

    /// Next frame whose type is one of `types`, waiting at most `timeout`.
    pub fn recv_any(&mut self, types: &[u8], timeout: Duration) -> Result<Frame> {
        if let Some(pos) = self.stash.iter().position(|f| types.contains(&f.type_id)) {
            if let Some(frame) = self.stash.remove(pos) {
                return Ok(frame);
            }
        }

        let deadline = Instant::now() + timeout;
        let restore = self.reader.config().read_timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(HostError::Timeout(timeout));
            }
            if let Err(err) = self.reader.get_ref().set_read_timeout(Some(remaining)) {
                break Err(err.into());
            }

            match self.reader.read_valid_frame() {
                Ok(frame) if types.contains(&frame.type_id) => break Ok(frame),
                Ok(frame) => {
                    debug!(type_id = frame.type_id, "stashing frame while waiting");
                    self.stash.push_back(frame);
                }
                Err(FrameError::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    break Err(HostError::Timeout(timeout));
                }
                Err(err) => break Err(err.into()),
            }
        };
        // Restore before reporting, whatever the outcome.
        let restored = self.reader.get_ref().set_read_timeout(restore);
        let frame = result?;
        restored?;
        Ok(frame)
    }

    /// Frames received while waiting for another type.
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    pub fn shutdown(&self) {
        self.writer.get_ref().shutdown();
    }
}

impl std::fmt::Debug for RobotLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotLink")
            .field("link", self.writer.get_ref())
            .field("stashed", &self.stash.len())
            .finish()
    }
}
