//! Well-known message type ids.
//!
//! Ids 0x01-0xFD belong to applications. The top two ids are reserved for
//! link-level notifications.

/// Sent back to a robot when the host dropped its message in blocking mode.
/// The payload is the single blocked type id.
pub const MESSAGE_BLOCKED: u8 = 0xFE;

/// Reserved for future link control.
pub const RESERVED: u8 = 0xFF;

/// First application type id.
pub const FIRST_APP_TYPE: u8 = 0x01;

/// Last application type id.
pub const LAST_APP_TYPE: u8 = 0xFD;

/// Returns a human-readable name for a type id.
pub fn type_name(id: u8) -> &'static str {
    match id {
        MESSAGE_BLOCKED => "MESSAGE_BLOCKED",
        RESERVED => "RESERVED",
        0x00 => "UNASSIGNED",
        _ => "APP",
    }
}

/// Returns true if the type id is reserved for the link itself.
pub fn is_reserved(id: u8) -> bool {
    id > LAST_APP_TYPE
}
