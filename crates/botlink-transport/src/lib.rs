//! Stream link abstraction for host/robot links.
//!
//! Provides a unified byte-stream type over the links a robot can reach the
//! host through:
//! - TCP (Wi-Fi and Ethernet robots)
//! - Unix domain sockets (local simulators and serial bridges)
//!
//! This is the lowest layer of botlink. Everything else builds on top of
//! the [`LinkStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::LinkStream;
pub use tcp::LinkListener;
