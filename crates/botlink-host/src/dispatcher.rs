//! Routes decoded messages to handlers, waiters or the blocked path.
//!
//! For each message, in order:
//! 1. the oldest pending wait for its type (and client, if scoped) takes it,
//!    and no handler runs for that occurrence;
//! 2. in blocking mode, a type outside the allow-list is suppressed;
//! 3. the registered handler runs, or an unknown-type diagnostic is emitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::client::ClientId;
use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
use crate::error::{HostError, Result};
use crate::lock;
use crate::pipeline::Message;

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered handler ran.
    Handled,
    /// Delivered to a pending wait.
    Correlated,
    /// No handler for the type.
    Unknown,
    /// Suppressed by blocking mode.
    Blocked,
}

struct WaitEntry {
    id: u64,
    type_id: u8,
    client: Option<ClientId>,
    slot: SyncSender<Message>,
}

impl WaitEntry {
    fn matches(&self, message: &Message) -> bool {
        self.type_id == message.type_id() && self.client.is_none_or(|c| c == message.client)
    }
}

#[derive(Default)]
struct State {
    handlers: HashMap<u8, Handler>,
    /// `Some` while blocking mode is active.
    allow_list: Option<HashSet<u8>>,
    /// Allow-lists that apply to one client only, on top of `allow_list`.
    client_allow: HashMap<ClientId, HashSet<u8>>,
    waits: VecDeque<WaitEntry>,
}

struct Inner {
    state: Mutex<State>,
    diagnostics: Arc<dyn DiagnosticSink>,
    next_wait: AtomicU64,
}

/// Shared dispatch table. Cloning yields another handle to the same table.
///
/// Handlers run on the message worker of the client that sent the message,
/// outside the table lock, so a handler may register handlers, toggle
/// blocking mode or send messages. It must not wait for a reply from its
/// own client: that client's next message cannot be dispatched until the
/// handler returns.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                diagnostics,
                next_wait: AtomicU64::new(1),
            }),
        }
    }

    /// Register the handler for a type id, replacing any previous one.
    pub fn register<F>(&self, type_id: u8, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let replaced = lock(&self.inner.state)
            .handlers
            .insert(type_id, Arc::new(handler))
            .is_some();
        debug!(type_id, replaced, "handler registered");
    }

    pub fn unregister(&self, type_id: u8) -> bool {
        lock(&self.inner.state).handlers.remove(&type_id).is_some()
    }

    pub fn has_handler(&self, type_id: u8) -> bool {
        lock(&self.inner.state).handlers.contains_key(&type_id)
    }

    /// Suppress every type outside `allowed` until [`exit_blocking`](Self::exit_blocking).
    ///
    /// Entering again replaces the allow-list.
    pub fn enter_blocking(&self, allowed: impl IntoIterator<Item = u8>) {
        let allowed: HashSet<u8> = allowed.into_iter().collect();
        debug!(allowed = allowed.len(), "entering blocking mode");
        lock(&self.inner.state).allow_list = Some(allowed);
    }

    pub fn exit_blocking(&self) {
        if lock(&self.inner.state).allow_list.take().is_some() {
            debug!("left blocking mode");
        }
    }

    pub fn is_blocking(&self) -> bool {
        lock(&self.inner.state).allow_list.is_some()
    }

    /// Suppress every type outside `allowed` for messages from `client` only.
    ///
    /// Applies together with the global allow-list: a type must pass both.
    /// Entering again replaces this client's list.
    pub fn enter_blocking_for(&self, client: ClientId, allowed: impl IntoIterator<Item = u8>) {
        let allowed: HashSet<u8> = allowed.into_iter().collect();
        debug!(%client, allowed = allowed.len(), "entering blocking mode for client");
        lock(&self.inner.state).client_allow.insert(client, allowed);
    }

    pub fn exit_blocking_for(&self, client: ClientId) {
        if lock(&self.inner.state).client_allow.remove(&client).is_some() {
            debug!(%client, "left blocking mode for client");
        }
    }

    /// Whether messages from `client` are filtered, globally or per client.
    pub fn is_blocking_for(&self, client: ClientId) -> bool {
        let state = lock(&self.inner.state);
        state.allow_list.is_some() || state.client_allow.contains_key(&client)
    }

    /// Route one message. Emits exactly one diagnostic for `Unknown` and
    /// `Blocked` outcomes.
    pub fn dispatch(&self, message: Message) -> DispatchOutcome {
        let mut state = lock(&self.inner.state);

        let mut message = message;
        while let Some(pos) = state.waits.iter().position(|w| w.matches(&message)) {
            let Some(entry) = state.waits.remove(pos) else {
                break;
            };
            match entry.slot.try_send(message) {
                Ok(()) => {
                    trace!(wait = entry.id, "message delivered to waiter");
                    return DispatchOutcome::Correlated;
                }
                // Waiter timed out and has not withdrawn yet; try the next one.
                Err(TrySendError::Full(returned) | TrySendError::Disconnected(returned)) => {
                    message = returned;
                }
            }
        }

        let type_id = message.type_id();
        let blocked = state
            .allow_list
            .iter()
            .chain(state.client_allow.get(&message.client))
            .any(|allowed| !allowed.contains(&type_id));
        let handler = if blocked {
            None
        } else {
            state.handlers.get(&type_id).cloned()
        };
        drop(state);

        if blocked {
            self.inner.diagnostics.emit(Diagnostic::MessageBlocked {
                client: message.client,
                type_id,
            });
            return DispatchOutcome::Blocked;
        }

        match handler {
            Some(handler) => {
                handler(&message);
                DispatchOutcome::Handled
            }
            None => {
                self.inner.diagnostics.emit(Diagnostic::UnknownMessageType {
                    client: message.client,
                    type_id,
                });
                DispatchOutcome::Unknown
            }
        }
    }

    /// Register a wait for the next `type_id` from any client.
    ///
    /// Registering before sending a request closes the window in which a
    /// fast reply could reach the handler instead.
    pub fn expect(&self, type_id: u8) -> PendingWait {
        self.expect_inner(type_id, None)
    }

    /// Register a wait for the next `type_id` from one client. The wait
    /// fails with `ConnectionClosed` if that client disconnects first.
    pub fn expect_from(&self, client: ClientId, type_id: u8) -> PendingWait {
        self.expect_inner(type_id, Some(client))
    }

    /// Block until a `type_id` message from any client arrives.
    pub fn await_message(&self, type_id: u8, timeout: Duration) -> Result<Message> {
        self.expect(type_id).wait(timeout)
    }

    /// Block until a `type_id` message from `client` arrives.
    pub fn await_message_from(
        &self,
        client: ClientId,
        type_id: u8,
        timeout: Duration,
    ) -> Result<Message> {
        self.expect_from(client, type_id).wait(timeout)
    }

    /// Fail every wait scoped to `client` and drop its allow-list.
    pub fn cancel_client(&self, client: ClientId) -> usize {
        let mut state = lock(&self.inner.state);
        state.client_allow.remove(&client);
        let before = state.waits.len();
        // Dropping the slot wakes the waiter with `ConnectionClosed`.
        state.waits.retain(|entry| entry.client != Some(client));
        let cancelled = before - state.waits.len();
        if cancelled > 0 {
            debug!(%client, cancelled, "pending waits cancelled");
        }
        cancelled
    }

    /// Fail every pending wait.
    pub fn cancel_all(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let cancelled = state.waits.len();
        state.waits.clear();
        cancelled
    }

    pub fn pending_waits(&self) -> usize {
        lock(&self.inner.state).waits.len()
    }

    fn expect_inner(&self, type_id: u8, client: Option<ClientId>) -> PendingWait {
        let id = self.inner.next_wait.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = mpsc::sync_channel(1);
        lock(&self.inner.state).waits.push_back(WaitEntry {
            id,
            type_id,
            client,
            slot,
        });
        trace!(wait = id, type_id, "wait registered");
        PendingWait {
            dispatcher: self.clone(),
            id,
            client,
            rx,
        }
    }

    fn remove_wait(&self, id: u64) {
        lock(&self.inner.state).waits.retain(|entry| entry.id != id);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Dispatcher")
            .field("handlers", &state.handlers.len())
            .field("blocking", &state.allow_list.is_some())
            .field("waits", &state.waits.len())
            .finish()
    }
}

/// A registered wait. Dropping it without waiting withdraws the wait.
pub struct PendingWait {
    dispatcher: Dispatcher,
    id: u64,
    client: Option<ClientId>,
    rx: Receiver<Message>,
}

impl PendingWait {
    /// Block the calling thread until the message arrives or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> Result<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => {
                self.dispatcher.remove_wait(self.id);
                // A dispatch may have filled the slot between the timeout
                // and the removal.
                self.rx
                    .try_recv()
                    .map_err(|_| HostError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(match self.client {
                Some(client) => HostError::closed(client),
                None => HostError::ConnectionClosed("wait cancelled".into()),
            }),
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.dispatcher.remove_wait(self.id);
    }
}

impl fmt::Debug for PendingWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWait")
            .field("id", &self.id)
            .field("client", &self.client)
            .finish()
    }
}
