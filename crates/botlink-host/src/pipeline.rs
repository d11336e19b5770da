//! Per-client worker pipeline.
//!
//! Each connected robot gets two workers, one per layer:
//!
//! - the **hardware worker** turns raw bytes into validated [`RawMessage`]s
//!   and encodes outbound messages back into bytes;
//! - the **message worker** turns raw messages into [`Message`]s for the
//!   dispatcher and raw messages out of application sends.
//!
//! Workers own their inbox and only talk to neighbours through queues, so a
//! slow or failing client never holds up another client's pipeline.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use botlink_frame::{
    FrameConfig, FrameError, RawMessage, StreamDecoder, TypeRange, MESSAGE_BLOCKED,
};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::client::ClientId;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use crate::registry::AcceptedClient;

/// A decoded application message, tagged with the robot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub client: ClientId,
    pub raw: RawMessage,
}

impl Message {
    pub fn new(client: ClientId, raw: RawMessage) -> Self {
        Self { client, raw }
    }

    pub fn type_id(&self) -> u8 {
        self.raw.type_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.raw.data
    }

    /// Per-client inbound sequence number.
    pub fn sequence(&self) -> u16 {
        self.raw.sequence
    }
}

/// An application message queued for one robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub type_id: u8,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(type_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }
}

/// Hardware worker inbox. Raw bytes come from the multiplexer; outbound
/// messages come from the message worker.
#[derive(Debug)]
pub enum HardwareInput {
    FromLink(Bytes),
    ToLink(RawMessage),
    Close,
}

/// Message worker inbox. Inbound messages come from the hardware worker;
/// outbound ones from the application.
#[derive(Debug)]
pub enum MessageInput {
    FromProtocol(RawMessage),
    ToProtocol(OutboundMessage),
    Close,
}

/// Settings every worker of a host shares.
#[derive(Clone)]
pub struct PipelineSettings {
    pub frame: FrameConfig,
    pub types: TypeRange,
    pub sub_channel: u8,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

/// Running workers for one client.
#[derive(Debug)]
pub struct ClientWorkers {
    /// Producer handle for application sends.
    pub outbound: Sender<MessageInput>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Start both workers for a freshly accepted client.
pub fn spawn_client(
    accepted: AcceptedClient,
    settings: &PipelineSettings,
    dispatcher: &Dispatcher,
) -> Result<ClientWorkers> {
    let client = accepted.id;
    let (message_tx, message_rx) = std::sync::mpsc::channel();

    let message_worker = MessageWorker {
        client,
        inbox: message_rx,
        to_hardware: accepted.inbox_tx,
        dispatcher: dispatcher.clone(),
    };
    let hardware_worker = HardwareWorker {
        client,
        decoder: StreamDecoder::new(settings.frame.clone()),
        types: settings.types.clone(),
        sub_channel: settings.sub_channel,
        sequence: 0,
        inbox: accepted.inbox,
        to_message: message_tx.clone(),
        to_link: accepted.raw_out,
        diagnostics: Arc::clone(&settings.diagnostics),
    };

    let message_handle = thread::Builder::new()
        .name(format!("{client}-msg"))
        .spawn(move || message_worker.run())?;
    let hardware_handle = thread::Builder::new()
        .name(format!("{client}-hw"))
        .spawn(move || hardware_worker.run())?;

    Ok(ClientWorkers {
        outbound: message_tx,
        handles: vec![hardware_handle, message_handle],
    })
}

/// Bytes to raw messages and back for one client.
pub struct HardwareWorker {
    client: ClientId,
    decoder: StreamDecoder,
    types: TypeRange,
    sub_channel: u8,
    sequence: u16,
    inbox: Receiver<HardwareInput>,
    to_message: Sender<MessageInput>,
    to_link: Sender<Bytes>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl HardwareWorker {
    pub fn run(mut self) {
        debug!(client = %self.client, "hardware worker started");
        while let Ok(input) = self.inbox.recv() {
            let keep_going = match input {
                HardwareInput::FromLink(bytes) => self.ingest(&bytes),
                HardwareInput::ToLink(message) => self.emit(&message),
                HardwareInput::Close => false,
            };
            if !keep_going {
                break;
            }
        }
        let _ = self.to_message.send(MessageInput::Close);
        debug!(client = %self.client, "hardware worker stopped");
    }

    /// Decode every complete frame now buffered. Returns `false` once the
    /// message worker is gone.
    fn ingest(&mut self, bytes: &[u8]) -> bool {
        self.decoder.push(bytes);
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => {
                    let raw = RawMessage::from_frame(
                        frame,
                        self.client.get(),
                        self.sub_channel,
                        self.sequence,
                    );
                    self.sequence = self.sequence.wrapping_add(1);

                    let max_payload = self.decoder.config().max_payload_size;
                    if let Err(err) = raw.validate(&self.types, max_payload) {
                        self.report(&err);
                        continue;
                    }
                    trace!(
                        client = %self.client,
                        type_id = raw.type_id,
                        len = raw.length,
                        "frame decoded"
                    );
                    if self.to_message.send(MessageInput::FromProtocol(raw)).is_err() {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(err) if err.is_recoverable() => self.report(&err),
                Err(err) => {
                    warn!(client = %self.client, error = %err, "decoder failed");
                    return true;
                }
            }
        }
    }

    /// Encode one outbound message. Returns `false` once the link is gone.
    fn emit(&mut self, message: &RawMessage) -> bool {
        let mut buf = BytesMut::new();
        if let Err(err) = message.encode(self.decoder.config(), &mut buf) {
            warn!(
                client = %self.client,
                type_id = message.type_id,
                error = %err,
                "outbound message dropped"
            );
            return true;
        }
        self.to_link.send(buf.freeze()).is_ok()
    }

    fn report(&self, err: &FrameError) {
        if let Some(event) = Diagnostic::from_frame_error(self.client, err) {
            self.diagnostics.emit(event);
        }
    }
}

/// Raw messages to dispatched messages and back for one client.
pub struct MessageWorker {
    client: ClientId,
    inbox: Receiver<MessageInput>,
    to_hardware: Sender<HardwareInput>,
    dispatcher: Dispatcher,
}

impl MessageWorker {
    pub fn run(self) {
        debug!(client = %self.client, "message worker started");
        while let Ok(input) = self.inbox.recv() {
            let sent = match input {
                MessageInput::FromProtocol(raw) => self.deliver(raw),
                MessageInput::ToProtocol(outbound) => {
                    self.forward(outbound.type_id, outbound.payload)
                }
                MessageInput::Close => break,
            };
            if !sent {
                break;
            }
        }
        debug!(client = %self.client, "message worker stopped");
    }

    fn deliver(&self, raw: RawMessage) -> bool {
        let type_id = raw.type_id;
        match self.dispatcher.dispatch(Message::new(self.client, raw)) {
            DispatchOutcome::Blocked => {
                self.forward(MESSAGE_BLOCKED, Bytes::copy_from_slice(&[type_id]))
            }
            _ => true,
        }
    }

    fn forward(&self, type_id: u8, payload: Bytes) -> bool {
        let raw = RawMessage::outbound(self.client.get(), type_id, payload);
        self.to_hardware.send(HardwareInput::ToLink(raw)).is_ok()
    }
}
