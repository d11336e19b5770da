//! Host side of the robot link.
//!
//! Accepts robot connections, multiplexes their sockets from one loop, runs
//! a two-stage worker pipeline per robot and routes decoded messages to
//! application handlers:
//!
//! ```text
//! socket ─▶ registry/multiplexer ─▶ hardware worker ─▶ message worker ─▶ dispatcher ─▶ handler
//!        ◀─                      ◀─                 ◀─                ◀─ HostHandle::send
//! ```

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod robot;
pub mod server;

pub use client::{ClientId, CloseReason, ConnectionState};
pub use config::HostConfig;
pub use diagnostics::{Diagnostic, DiagnosticSink, MemorySink, TracingSink};
pub use dispatcher::{DispatchOutcome, Dispatcher, PendingWait};
pub use error::{HostError, Result};
pub use pipeline::{Message, OutboundMessage};
pub use registry::{AcceptedClient, ClientRegistry, PollReport, Rejected};
pub use robot::RobotLink;
pub use server::{ClientInfo, ClientSelector, HostBuilder, HostHandle, HostServer};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a handler panicked while holding it.
/// Every structure guarded here stays consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
