//! Diagnostic events surfaced by the pipeline and the dispatcher.
//!
//! None of these stop the host: each one drops a single frame or message
//! and processing continues.

use std::fmt;
use std::sync::Mutex;

use botlink_frame::FrameError;
use tracing::warn;

use crate::client::ClientId;
use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Marker mismatch; the stream was resynchronized.
    HeaderCorrupted { client: ClientId, discarded: usize },
    /// Frame read completely but failed its integrity check.
    ChecksumMismatch { client: ClientId, type_id: u8 },
    /// Byte-stuffed data could not be decoded.
    FramingError { client: ClientId, detail: String },
    /// A decoded field was outside its declared range.
    InvalidField { client: ClientId, detail: String },
    /// No handler registered for the type id.
    UnknownMessageType { client: ClientId, type_id: u8 },
    /// Suppressed by blocking mode.
    MessageBlocked { client: ClientId, type_id: u8 },
}

impl Diagnostic {
    /// Translate a decode failure. Returns `None` for errors that are not
    /// per-frame diagnostics (I/O, closed connections).
    pub fn from_frame_error(client: ClientId, err: &FrameError) -> Option<Self> {
        let event = match err {
            FrameError::HeaderCorrupted { discarded } => Diagnostic::HeaderCorrupted {
                client,
                discarded: *discarded,
            },
            FrameError::ChecksumMismatch { type_id } => Diagnostic::ChecksumMismatch {
                client,
                type_id: *type_id,
            },
            FrameError::FramingError(detail) => Diagnostic::FramingError {
                client,
                detail: detail.clone(),
            },
            FrameError::InvalidLength { .. }
            | FrameError::Truncated { .. }
            | FrameError::FieldOutOfRange { .. }
            | FrameError::PayloadTooLarge { .. } => Diagnostic::InvalidField {
                client,
                detail: err.to_string(),
            },
            FrameError::InvalidInput(_) | FrameError::Io(_) | FrameError::ConnectionClosed => {
                return None
            }
        };
        Some(event)
    }

    /// Stable event name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Diagnostic::HeaderCorrupted { .. } => "header_corrupted",
            Diagnostic::ChecksumMismatch { .. } => "checksum_mismatch",
            Diagnostic::FramingError { .. } => "framing_error",
            Diagnostic::InvalidField { .. } => "invalid_field",
            Diagnostic::UnknownMessageType { .. } => "unknown_message_type",
            Diagnostic::MessageBlocked { .. } => "message_blocked",
        }
    }

    pub fn client(&self) -> ClientId {
        match self {
            Diagnostic::HeaderCorrupted { client, .. }
            | Diagnostic::ChecksumMismatch { client, .. }
            | Diagnostic::FramingError { client, .. }
            | Diagnostic::InvalidField { client, .. }
            | Diagnostic::UnknownMessageType { client, .. }
            | Diagnostic::MessageBlocked { client, .. } => *client,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::HeaderCorrupted { client, discarded } => {
                write!(f, "{client}: header corrupted, {discarded} bytes discarded")
            }
            Diagnostic::ChecksumMismatch { client, type_id } => {
                write!(f, "{client}: checksum mismatch on type {type_id:#04x}")
            }
            Diagnostic::FramingError { client, detail } => {
                write!(f, "{client}: framing error: {detail}")
            }
            Diagnostic::InvalidField { client, detail } => {
                write!(f, "{client}: invalid field: {detail}")
            }
            Diagnostic::UnknownMessageType { client, type_id } => {
                write!(f, "{client}: no handler for type {type_id:#04x}")
            }
            Diagnostic::MessageBlocked { client, type_id } => {
                write!(f, "{client}: type {type_id:#04x} blocked")
            }
        }
    }
}

/// Receives diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: Diagnostic);
}

/// Writes every event as a structured `warn!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, event: Diagnostic) {
        warn!(
            client = %event.client(),
            kind = event.kind(),
            "{event}"
        );
    }
}

/// Keeps events in memory, for tests and embedding applications.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        lock(&self.events).clone()
    }

    /// Number of recorded events of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        lock(&self.events).iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, event: Diagnostic) {
        lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_map_to_events() {
        let client = ClientId::new(3);
        let event =
            Diagnostic::from_frame_error(client, &FrameError::HeaderCorrupted { discarded: 4 })
                .unwrap();
        assert_eq!(event.kind(), "header_corrupted");
        assert_eq!(event.client(), client);

        let event =
            Diagnostic::from_frame_error(client, &FrameError::ChecksumMismatch { type_id: 9 })
                .unwrap();
        assert_eq!(event, Diagnostic::ChecksumMismatch { client, type_id: 9 });

        assert!(Diagnostic::from_frame_error(client, &FrameError::ConnectionClosed).is_none());
    }

    #[test]
    fn memory_sink_counts_by_kind() {
        let sink = MemorySink::new();
        let client = ClientId::new(1);
        sink.emit(Diagnostic::MessageBlocked { client, type_id: 2 });
        sink.emit(Diagnostic::MessageBlocked { client, type_id: 3 });
        sink.emit(Diagnostic::UnknownMessageType { client, type_id: 4 });

        assert_eq!(sink.count("message_blocked"), 2);
        assert_eq!(sink.count("unknown_message_type"), 1);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn display_names_client_and_type() {
        let event = Diagnostic::UnknownMessageType {
            client: ClientId::new(5),
            type_id: 0x2A,
        };
        assert_eq!(event.to_string(), "client-5: no handler for type 0x2a");
    }
}
