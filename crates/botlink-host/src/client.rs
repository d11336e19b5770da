use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use botlink_transport::LinkStream;
use bytes::{Buf, Bytes, BytesMut};

use crate::pipeline::HardwareInput;

/// Identity of a connected robot. Never reused within a host's lifetime.
///
/// `0` is the host itself, so the first robot is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u32);

impl ClientId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connected,
}

/// Why a client left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The robot closed its end.
    PeerClosed,
    /// Socket error.
    Io(String),
    /// The hardware worker stopped consuming.
    PipelineStopped,
    /// Closed by the application.
    Requested,
    /// The host is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Io(detail) => write!(f, "i/o error: {detail}"),
            CloseReason::PipelineStopped => f.write_str("pipeline stopped"),
            CloseReason::Requested => f.write_str("closed by host"),
            CloseReason::Shutdown => f.write_str("host shutdown"),
        }
    }
}

const READ_CHUNK_SIZE: usize = 4 * 1024;
const MAX_READS_PER_POLL: usize = 16;

/// Result of one non-blocking read pass.
pub(crate) enum ReadOutcome {
    Idle,
    Received(usize),
    Closed(CloseReason),
}

/// Result of one non-blocking write pass.
pub(crate) enum WriteOutcome {
    Idle,
    Sent(usize),
    Closed(CloseReason),
}

/// One robot's socket plus the multiplexer-side ends of its raw queues.
///
/// Inbound bytes go to the hardware worker unparsed. Outbound bytes the
/// worker queued are written as the socket accepts them; whatever a write
/// did not take stays in `pending` for the next poll.
pub struct ClientConnection {
    id: ClientId,
    peer: String,
    state: ConnectionState,
    link: LinkStream,
    raw_in: Sender<HardwareInput>,
    raw_out: Receiver<Bytes>,
    pending: BytesMut,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ClientId,
        link: LinkStream,
        raw_in: Sender<HardwareInput>,
        raw_out: Receiver<Bytes>,
    ) -> Self {
        Self {
            id,
            peer: link.peer_label(),
            state: ConnectionState::NotConnected,
            link,
            raw_in,
            raw_out,
            pending: BytesMut::new(),
        }
    }

    pub(crate) fn connect(&mut self) -> botlink_transport::Result<()> {
        self.link.set_nonblocking(true)?;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    pub(crate) fn into_link(self) -> LinkStream {
        self.link
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Outbound bytes accepted from the worker but not yet written.
    pub fn pending_outbound(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn read_available(&mut self) -> ReadOutcome {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0usize;

        for _ in 0..MAX_READS_PER_POLL {
            match self.link.read(&mut chunk) {
                Ok(0) => return ReadOutcome::Closed(CloseReason::PeerClosed),
                Ok(n) => {
                    let bytes = Bytes::copy_from_slice(&chunk[..n]);
                    if self.raw_in.send(HardwareInput::FromLink(bytes)).is_err() {
                        return ReadOutcome::Closed(CloseReason::PipelineStopped);
                    }
                    total += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return ReadOutcome::Closed(CloseReason::Io(err.to_string())),
            }
        }

        if total == 0 {
            ReadOutcome::Idle
        } else {
            ReadOutcome::Received(total)
        }
    }

    pub(crate) fn write_pending(&mut self) -> WriteOutcome {
        loop {
            match self.raw_out.try_recv() {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(TryRecvError::Empty) => break,
                // Worker gone; flush what it left and let reads notice the rest.
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut sent = 0usize;
        while !self.pending.is_empty() {
            match self.link.write(&self.pending) {
                Ok(0) => return WriteOutcome::Closed(CloseReason::PeerClosed),
                Ok(n) => {
                    self.pending.advance(n);
                    sent += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return WriteOutcome::Closed(CloseReason::Io(err.to_string())),
            }
        }

        if sent == 0 {
            WriteOutcome::Idle
        } else {
            WriteOutcome::Sent(sent)
        }
    }

    /// Tear down the socket and tell the hardware worker to stop.
    pub(crate) fn close(&mut self) {
        self.state = ConnectionState::NotConnected;
        self.link.shutdown();
        let _ = self.raw_in.send(HardwareInput::Close);
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_display_and_order() {
        assert_eq!(ClientId::new(7).to_string(), "client-7");
        assert!(ClientId::new(1) < ClientId::new(2));
        assert_eq!(ClientId::new(9).get(), 9);
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer closed");
        assert_eq!(
            CloseReason::Io("reset".into()).to_string(),
            "i/o error: reset"
        );
    }
}
