use std::time::Duration;

use crate::client::ClientId;

/// Errors that can occur in host operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] botlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] botlink_frame::FrameError),

    /// The registry is full. Retry once a client disconnects.
    #[error("client capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    /// No connected client matches.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// No matching message arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The connection went away while an operation was pending.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error outside a link (config files, thread spawning).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub(crate) fn closed(client: ClientId) -> Self {
        HostError::ConnectionClosed(format!("{client} disconnected"))
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
