//! Checksummed binary framing and a multi-robot host for host/robot links.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix stream links, listener with non-blocking accept
//! - [`frame`]: marker/length/checksum envelope, COBS stuffing, stream decoder
//! - [`host`]: client registry, per-client worker pipeline and dispatcher
//!   (behind the `host` feature)

/// Re-export transport types.
pub mod transport {
    pub use botlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use botlink_frame::*;
}

/// Re-export host types (requires `host` feature).
#[cfg(feature = "host")]
pub mod host {
    pub use botlink_host::*;
}
