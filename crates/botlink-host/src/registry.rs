use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

use botlink_transport::LinkStream;
use bytes::Bytes;
use tracing::{debug, info};

use crate::client::{ClientConnection, ClientId, CloseReason, ConnectionState, ReadOutcome, WriteOutcome};
use crate::error::HostError;
use crate::pipeline::HardwareInput;

/// Worker-side ends of a newly accepted client's raw queues.
pub struct AcceptedClient {
    pub id: ClientId,
    pub peer: String,
    /// Raw inbound bytes, plus outbound messages and close requests.
    pub inbox: Receiver<HardwareInput>,
    /// Producer handle for the message layer to queue outbound messages.
    pub inbox_tx: Sender<HardwareInput>,
    /// Encoded bytes for the multiplexer to write.
    pub raw_out: Sender<Bytes>,
}

impl fmt::Debug for AcceptedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedClient")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// An accept that did not take the link. The link is handed back so the
/// caller can retry once a slot frees.
#[derive(Debug)]
pub struct Rejected {
    pub error: HostError,
    pub link: LinkStream,
}

impl From<Rejected> for HostError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Clients that saw activity or failed during one [`ClientRegistry::poll`].
#[derive(Debug, Default)]
pub struct PollReport {
    pub readable: Vec<ClientId>,
    pub writable: Vec<ClientId>,
    /// Removed from the registry during this poll.
    pub errored: Vec<(ClientId, CloseReason)>,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errored.is_empty()
    }
}

/// Fixed-capacity set of connected robots, polled without blocking.
///
/// Owned by a single multiplexer thread: one [`poll`](Self::poll) services
/// every socket once, moving bytes between sockets and per-client queues.
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, ClientConnection>,
    capacity: usize,
    next_id: u32,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            capacity,
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.clients.len() < self.capacity
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }

    pub fn state(&self, id: ClientId) -> ConnectionState {
        self.clients
            .get(&id)
            .map_or(ConnectionState::NotConnected, ClientConnection::state)
    }

    /// Admit a connected link into a free slot.
    pub fn accept(&mut self, link: LinkStream) -> Result<AcceptedClient, Rejected> {
        if !self.has_capacity() {
            return Err(Rejected {
                error: HostError::CapacityExceeded { max: self.capacity },
                link,
            });
        }

        let id = ClientId::new(self.next_id);
        let (inbox_tx, inbox) = mpsc::channel();
        let (raw_out, raw_out_rx) = mpsc::channel();
        let mut connection = ClientConnection::new(id, link, inbox_tx.clone(), raw_out_rx);

        if let Err(err) = connection.connect() {
            return Err(Rejected {
                error: err.into(),
                link: connection.into_link(),
            });
        }

        self.next_id = self.next_id.wrapping_add(1).max(1);
        let peer = connection.peer().to_string();
        info!(client = %id, %peer, clients = self.clients.len() + 1, "robot connected");
        self.clients.insert(id, connection);

        Ok(AcceptedClient {
            id,
            peer,
            inbox,
            inbox_tx,
            raw_out,
        })
    }

    /// Service every socket once without blocking.
    ///
    /// Clients whose socket failed or closed are removed and reported in
    /// `errored`; the others are untouched by that failure.
    pub fn poll(&mut self) -> PollReport {
        let mut report = PollReport::default();

        for (id, client) in &mut self.clients {
            match client.read_available() {
                ReadOutcome::Idle => {}
                ReadOutcome::Received(_) => report.readable.push(*id),
                ReadOutcome::Closed(reason) => {
                    report.errored.push((*id, reason));
                    continue;
                }
            }
            match client.write_pending() {
                WriteOutcome::Idle => {}
                WriteOutcome::Sent(_) => report.writable.push(*id),
                WriteOutcome::Closed(reason) => report.errored.push((*id, reason)),
            }
        }

        for (id, reason) in &report.errored {
            self.remove(*id, reason);
        }

        report
    }

    /// Close a client and free its slot. Queued outbound bytes are dropped.
    pub fn close(&mut self, id: ClientId, reason: &CloseReason) -> bool {
        self.remove(id, reason)
    }

    /// Close every client.
    pub fn close_all(&mut self, reason: &CloseReason) -> Vec<ClientId> {
        let ids = self.ids();
        for id in &ids {
            self.remove(*id, reason);
        }
        ids
    }

    fn remove(&mut self, id: ClientId, reason: &CloseReason) -> bool {
        match self.clients.remove(&id) {
            Some(mut client) => {
                client.close();
                info!(client = %id, %reason, clients = self.clients.len(), "robot disconnected");
                true
            }
            None => {
                debug!(client = %id, "close for unknown client ignored");
                false
            }
        }
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::time::{Duration, Instant};

    use super::*;

    fn drain_inbound(accepted: &AcceptedClient) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(input) = accepted.inbox.try_recv() {
            if let HardwareInput::FromLink(bytes) = input {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    #[test]
    fn accept_assigns_increasing_ids() {
        let mut registry = ClientRegistry::new(4);
        let (a, _ra) = LinkStream::pair().unwrap();
        let (b, _rb) = LinkStream::pair().unwrap();

        let first = registry.accept(a).unwrap();
        let second = registry.accept(b).unwrap();

        assert_eq!(first.id, ClientId::new(1));
        assert_eq!(second.id, ClientId::new(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(first.id), ConnectionState::Connected);
    }

    #[test]
    fn capacity_exceeded_then_retry_after_close() {
        let mut registry = ClientRegistry::new(2);
        let mut robots = Vec::new();
        let mut accepted = Vec::new();
        for _ in 0..2 {
            let (host_end, robot_end) = LinkStream::pair().unwrap();
            robots.push(robot_end);
            accepted.push(registry.accept(host_end).unwrap());
        }

        let (host_end, _robot_end) = LinkStream::pair().unwrap();
        let rejected = registry.accept(host_end).unwrap_err();
        assert!(matches!(
            rejected.error,
            HostError::CapacityExceeded { max: 2 }
        ));

        assert!(registry.close(accepted[0].id, &CloseReason::Requested));
        assert_eq!(registry.state(accepted[0].id), ConnectionState::NotConnected);

        let retried = registry.accept(rejected.link).unwrap();
        assert_eq!(retried.id, ClientId::new(3));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn close_tells_worker_to_stop() {
        let mut registry = ClientRegistry::new(1);
        let (host_end, _robot) = LinkStream::pair().unwrap();
        let accepted = registry.accept(host_end).unwrap();

        registry.close(accepted.id, &CloseReason::Requested);
        assert!(matches!(accepted.inbox.try_recv(), Ok(HardwareInput::Close)));
        assert!(!registry.close(accepted.id, &CloseReason::Requested));
    }

    #[test]
    fn poll_routes_bytes_per_client() {
        let mut registry = ClientRegistry::new(4);
        let (h1, mut r1) = LinkStream::pair().unwrap();
        let (h2, mut r2) = LinkStream::pair().unwrap();
        let c1 = registry.accept(h1).unwrap();
        let c2 = registry.accept(h2).unwrap();

        r1.write_all(b"from-one").unwrap();
        let report = registry.poll();
        assert_eq!(report.readable, vec![c1.id]);
        assert_eq!(drain_inbound(&c1), b"from-one");
        assert!(drain_inbound(&c2).is_empty());

        c2.raw_out.send(Bytes::from_static(b"to-two")).unwrap();
        let report = registry.poll();
        assert_eq!(report.writable, vec![c2.id]);

        let mut buf = [0u8; 16];
        let n = r2.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"to-two");

        r1.set_nonblocking(true).unwrap();
        let err = r1.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn peer_close_affects_only_that_client() {
        let mut registry = ClientRegistry::new(4);
        let (h1, r1) = LinkStream::pair().unwrap();
        let (h2, mut r2) = LinkStream::pair().unwrap();
        let c1 = registry.accept(h1).unwrap();
        let c2 = registry.accept(h2).unwrap();

        drop(r1);
        let report = registry.poll();
        assert_eq!(report.errored, vec![(c1.id, CloseReason::PeerClosed)]);
        assert_eq!(registry.ids(), vec![c2.id]);

        r2.write_all(b"still here").unwrap();
        registry.poll();
        assert_eq!(drain_inbound(&c2), b"still here");
    }

    #[test]
    fn partial_writes_keep_remainder_queued() {
        let mut registry = ClientRegistry::new(1);
        let (host_end, mut robot) = LinkStream::pair().unwrap();
        let accepted = registry.accept(host_end).unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        accepted.raw_out.send(Bytes::from(payload.clone())).unwrap();

        registry.poll();
        let pending = registry.get(accepted.id).unwrap().pending_outbound();
        assert!(pending > 0, "socket buffer should not take 4 MiB at once");

        robot.set_nonblocking(true).unwrap();
        let mut received = Vec::with_capacity(payload.len());
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        while received.len() < payload.len() && Instant::now() < deadline {
            registry.poll();
            match robot.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => panic!("read failed: {err}"),
            }
        }

        assert_eq!(received.len(), payload.len());
        assert!(received == payload);
        assert_eq!(registry.get(accepted.id).unwrap().pending_outbound(), 0);
    }

    #[test]
    fn idle_poll_reports_nothing() {
        let mut registry = ClientRegistry::new(1);
        let (host_end, _robot) = LinkStream::pair().unwrap();
        registry.accept(host_end).unwrap();
        assert!(registry.poll().is_idle());
    }
}
