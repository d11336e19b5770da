use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use botlink_frame::types::is_reserved;
use botlink_frame::FrameError;
use botlink_transport::{LinkListener, LinkStream};
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::client::{ClientId, CloseReason};
use crate::config::HostConfig;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::dispatcher::Dispatcher;
use crate::error::{HostError, Result};
use crate::lock;
use crate::pipeline::{spawn_client, Message, MessageInput, OutboundMessage, PipelineSettings};
use crate::registry::ClientRegistry;

type ConnectHook = Box<dyn Fn(ClientId, &str) + Send + Sync>;
type DisconnectHook = Box<dyn Fn(ClientId, &CloseReason) + Send + Sync>;

/// Which connected robots a send goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSelector {
    One(ClientId),
    Many(Vec<ClientId>),
    All,
    /// Clients given this name with [`HostHandle::set_name`].
    Named(String),
}

impl From<ClientId> for ClientSelector {
    fn from(id: ClientId) -> Self {
        ClientSelector::One(id)
    }
}

/// Snapshot of one connected robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: String,
    pub name: Option<String>,
}

struct ClientEntry {
    peer: String,
    name: Option<String>,
    outbound: Sender<MessageInput>,
}

struct Shared {
    config: HostConfig,
    dispatcher: Dispatcher,
    clients: Mutex<BTreeMap<ClientId, ClientEntry>>,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
}

enum Command {
    Close(ClientId),
    Shutdown,
}

/// Configures and starts a [`HostServer`].
pub struct HostBuilder {
    config: HostConfig,
    diagnostics: Arc<dyn DiagnosticSink>,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
}

impl HostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            diagnostics: Arc::new(TracingSink),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Route diagnostics somewhere other than the log.
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Called on the multiplexer thread after a robot is admitted.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId, &str) + Send + Sync + 'static,
    {
        self.on_connect = Some(Box::new(hook));
        self
    }

    /// Called on the multiplexer thread after a robot is removed.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId, &CloseReason) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    /// Bind the listener and start the multiplexer thread.
    pub fn start(self) -> Result<HostServer> {
        self.config.validate()?;
        let listener = LinkListener::bind(self.config.bind.as_str())?;
        let local_addr = listener.local_addr();

        let dispatcher = Dispatcher::new(Arc::clone(&self.diagnostics));
        let settings = PipelineSettings {
            frame: self.config.frame_config(),
            types: self.config.type_range(),
            sub_channel: self.config.sub_channel,
            diagnostics: self.diagnostics,
        };
        let shared = Arc::new(Shared {
            config: self.config,
            dispatcher,
            clients: Mutex::new(BTreeMap::new()),
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
        });

        let (commands, command_rx) = mpsc::channel();
        let multiplexer = Multiplexer {
            registry: ClientRegistry::new(shared.config.max_clients),
            listener,
            settings,
            shared: Arc::clone(&shared),
            commands: command_rx,
            workers: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("botlink-mux".into())
            .spawn(move || multiplexer.run())?;

        info!(%local_addr, max_clients = shared.config.max_clients, "host started");
        Ok(HostServer {
            handle: HostHandle { shared, commands },
            local_addr,
            thread: Some(thread),
        })
    }
}

/// A running host: listener, multiplexer thread and per-client workers.
///
/// Dropping the server shuts it down.
pub struct HostServer {
    handle: HostHandle,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl HostServer {
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    /// Start with default hooks and tracing diagnostics.
    pub fn start(config: HostConfig) -> Result<Self> {
        HostBuilder::new(config).start()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cloneable handle for sending and waiting from any thread,
    /// including handlers.
    pub fn handle(&self) -> &HostHandle {
        &self.handle
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.handle.shared.dispatcher
    }

    /// Close every client, stop all workers and release the listener.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            error!("multiplexer thread panicked");
        }
        let cancelled = self.handle.shared.dispatcher.cancel_all();
        info!(cancelled_waits = cancelled, "host stopped");
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for HostServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

/// Application-side access to a running host.
#[derive(Clone)]
pub struct HostHandle {
    shared: Arc<Shared>,
    commands: Sender<Command>,
}

impl HostHandle {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Queue a message for the selected robots. Returns how many robots it
    /// was queued for. Type ids reserved for the link itself are refused.
    ///
    /// Queuing never blocks on the link; bytes are written by the
    /// multiplexer as each socket accepts them.
    pub fn send(
        &self,
        to: impl Into<ClientSelector>,
        type_id: u8,
        payload: impl Into<Bytes>,
    ) -> Result<usize> {
        if is_reserved(type_id) {
            return Err(FrameError::FieldOutOfRange {
                field: "type_id",
                value: u64::from(type_id),
            }
            .into());
        }
        let outbound = OutboundMessage::new(type_id, payload);
        let max = self.shared.config.max_payload_size;
        if outbound.payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: outbound.payload.len(),
                max,
            }
            .into());
        }

        let selector = to.into();
        let clients = lock(&self.shared.clients);
        let targets: Vec<ClientId> = match &selector {
            ClientSelector::One(id) => {
                if !clients.contains_key(id) {
                    return Err(HostError::UnknownClient(id.to_string()));
                }
                vec![*id]
            }
            ClientSelector::Many(ids) => {
                if let Some(missing) = ids.iter().find(|id| !clients.contains_key(id)) {
                    return Err(HostError::UnknownClient(missing.to_string()));
                }
                ids.clone()
            }
            ClientSelector::All => clients.keys().copied().collect(),
            ClientSelector::Named(name) => {
                let named: Vec<ClientId> = clients
                    .iter()
                    .filter(|(_, entry)| entry.name.as_deref() == Some(name.as_str()))
                    .map(|(id, _)| *id)
                    .collect();
                if named.is_empty() {
                    return Err(HostError::UnknownClient(name.clone()));
                }
                named
            }
        };

        let mut queued = 0usize;
        for id in &targets {
            let Some(entry) = clients.get(id) else {
                continue;
            };
            if entry
                .outbound
                .send(MessageInput::ToProtocol(outbound.clone()))
                .is_ok()
            {
                queued += 1;
            } else {
                debug!(client = %id, "send to stopping client dropped");
            }
        }
        Ok(queued)
    }

    /// Send a request to one robot and wait for its reply type.
    ///
    /// The wait is registered before the request is queued.
    pub fn request(
        &self,
        client: ClientId,
        type_id: u8,
        payload: impl Into<Bytes>,
        reply_type: u8,
        timeout: Duration,
    ) -> Result<Message> {
        let wait = self.shared.dispatcher.expect_from(client, reply_type);
        self.send(client, type_id, payload)?;
        wait.wait(timeout)
    }

    /// Wait for the next `type_id` from any robot, using the configured
    /// default timeout.
    pub fn await_message(&self, type_id: u8) -> Result<Message> {
        self.shared
            .dispatcher
            .await_message(type_id, self.shared.config.await_timeout())
    }

    /// Wait for the next `type_id` from one robot, using the configured
    /// default timeout.
    pub fn await_message_from(&self, client: ClientId, type_id: u8) -> Result<Message> {
        self.shared.dispatcher.await_message_from(
            client,
            type_id,
            self.shared.config.await_timeout(),
        )
    }

    /// Give a robot a name usable with [`ClientSelector::Named`].
    pub fn set_name(&self, client: ClientId, name: impl Into<String>) -> Result<()> {
        let mut clients = lock(&self.shared.clients);
        let entry = clients
            .get_mut(&client)
            .ok_or_else(|| HostError::UnknownClient(client.to_string()))?;
        entry.name = Some(name.into());
        Ok(())
    }

    /// Disconnect one robot. Its pending waits fail with `ConnectionClosed`.
    pub fn close(&self, client: ClientId) -> Result<()> {
        if !lock(&self.shared.clients).contains_key(&client) {
            return Err(HostError::UnknownClient(client.to_string()));
        }
        self.commands
            .send(Command::Close(client))
            .map_err(|_| HostError::ConnectionClosed("host stopped".into()))
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        lock(&self.shared.clients)
            .iter()
            .map(|(id, entry)| ClientInfo {
                id: *id,
                peer: entry.peer.clone(),
                name: entry.name.clone(),
            })
            .collect()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        lock(&self.shared.clients).contains_key(&client)
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Owns the listener and the registry; the only thread touching sockets.
struct Multiplexer {
    registry: ClientRegistry,
    listener: LinkListener,
    settings: PipelineSettings,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    workers: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    fn run(mut self) {
        let idle = self.shared.config.poll_interval();
        debug!("multiplexer running");

        loop {
            if !self.handle_commands() {
                break;
            }
            let accepted = self.accept_pending();
            let report = self.registry.poll();
            for (id, reason) in &report.errored {
                self.finish(*id, reason);
            }
            if accepted == 0 && report.is_idle() {
                thread::sleep(idle);
            }
        }

        for id in self.registry.close_all(&CloseReason::Shutdown) {
            self.finish(id, &CloseReason::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("client worker panicked");
            }
        }
        debug!("multiplexer stopped");
    }

    /// Returns `false` when the host should stop.
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Close(id)) => {
                    if self.registry.close(id, &CloseReason::Requested) {
                        self.finish(id, &CloseReason::Requested);
                    }
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    /// Admit pending connections while slots are free. Connections beyond
    /// capacity stay in the listen backlog until a slot frees.
    fn accept_pending(&mut self) -> usize {
        let mut accepted = 0usize;
        while self.registry.has_capacity() {
            match self.listener.try_accept() {
                Ok(Some((link, _addr))) => {
                    if self.admit(link).is_ok() {
                        accepted += 1;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
        accepted
    }

    fn admit(&mut self, link: LinkStream) -> Result<()> {
        let accepted = self.registry.accept(link).map_err(|rejected| {
            warn!(error = %rejected.error, "robot rejected");
            HostError::from(rejected)
        })?;
        let id = accepted.id;
        let peer = accepted.peer.clone();

        let workers = match spawn_client(accepted, &self.settings, &self.shared.dispatcher) {
            Ok(workers) => workers,
            Err(err) => {
                error!(client = %id, error = %err, "could not start client workers");
                self.registry.close(id, &CloseReason::PipelineStopped);
                return Err(err);
            }
        };
        self.workers.extend(workers.handles);
        lock(&self.shared.clients).insert(
            id,
            ClientEntry {
                peer: peer.clone(),
                name: None,
                outbound: workers.outbound,
            },
        );

        if let Some(hook) = &self.shared.on_connect {
            hook(id, &peer);
        }
        Ok(())
    }

    /// Bookkeeping after the registry removed a client.
    fn finish(&mut self, id: ClientId, reason: &CloseReason) {
        lock(&self.shared.clients).remove(&id);
        self.shared.dispatcher.cancel_client(id);
        if let Some(hook) = &self.shared.on_disconnect {
            hook(id, reason);
        }
        self.workers.retain(|handle| !handle.is_finished());
    }
}
