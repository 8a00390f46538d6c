//! Protocol module - wire codes, window framing, event decoding, ACK encoding.
//!
//! The Lumberjack wire protocol is a stream of *windows*. Each window opens
//! with a 6-byte header:
//!
//! ```text
//! ┌─────────┬────────┬───────────────┐
//! │ Version │ 'W'    │ Window size   │
//! │ 1 byte  │ 1 byte │ 4 bytes, BE   │
//! └─────────┴────────┴───────────────┘
//! ```
//!
//! followed by exactly that many event frames. Event frames are either JSON
//! data frames (`'J'`, v2), key/value data frames (`'D'`, v1), or
//! zlib-compressed frames (`'C'`) whose inflated bytes repeat the same event
//! frame grammar. The server answers with 6-byte ACK frames (`'A'`).
//!
//! All multi-byte integers are Big Endian.

mod reader;
mod writer;

pub(crate) use reader::BatchReader;
pub(crate) use writer::AckWriter;

/// Frame-code bytes as they appear on the wire.
pub mod codes {
    /// Protocol version byte for Lumberjack v1.
    pub const VERSION_V1: u8 = b'1';
    /// Protocol version byte for Lumberjack v2.
    pub const VERSION_V2: u8 = b'2';
    /// Window-size frame, opening a window of events.
    pub const WINDOW_SIZE: u8 = b'W';
    /// JSON data frame (v2 only).
    pub const JSON_DATA_FRAME: u8 = b'J';
    /// Key/value data frame (v1 only).
    pub const DATA_FRAME: u8 = b'D';
    /// Zlib-compressed frame wrapping further event frames.
    pub const COMPRESSED: u8 = b'C';
    /// Acknowledgement frame (server to client). With a count of zero on
    /// v2 this doubles as the keep-alive frame.
    pub const ACK: u8 = b'A';
}

/// Size of a window header in bytes (version, `'W'`, BE u32 count).
pub const WINDOW_HEADER_LEN: usize = 6;

/// Size of an ACK frame in bytes (version, `'A'`, BE u32 count).
pub const ACK_FRAME_LEN: usize = 6;

/// Maximum accepted value for any announced length on the wire (1 GB).
///
/// Applies to JSON payloads, compressed payloads and v1 key/value strings.
/// Anything larger is treated as a protocol error.
pub const MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Upper bound on the event-list capacity reserved up front for a window,
/// so a hostile window size cannot trigger a huge allocation before any
/// event bytes arrive.
pub(crate) const MAX_WINDOW_PREALLOC: usize = 1024;

/// Lumberjack protocol version spoken on a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// Lumberjack v1: `'D'` key/value data frames, no keep-alive.
    V1,
    /// Lumberjack v2: `'J'` JSON data frames, keep-alive supported.
    V2,
}

impl Version {
    /// The on-wire version byte (`'1'` or `'2'`).
    #[inline]
    pub const fn byte(self) -> u8 {
        match self {
            Version::V1 => codes::VERSION_V1,
            Version::V2 => codes::VERSION_V2,
        }
    }

    /// Map an on-wire version byte back to a version.
    #[inline]
    pub const fn from_byte(byte: u8) -> Option<Version> {
        match byte {
            codes::VERSION_V1 => Some(Version::V1),
            codes::VERSION_V2 => Some(Version::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::V1 => f.write_str("v1"),
            Version::V2 => f.write_str("v2"),
        }
    }
}
