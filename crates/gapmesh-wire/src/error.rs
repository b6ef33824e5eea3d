//! Error types for the gapmesh wire protocol.

use thiserror::Error;

/// Wire-level errors.
///
/// Decode errors are non-fatal by contract: callers log, drop the frame and
/// keep the connection unless a consecutive-error threshold is crossed.
#[derive(Debug, Error)]
pub enum WireError {
    /// Version byte is not a known protocol version
    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// Message type byte is unrecognized
    #[error("invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Input shorter than the declared framing
    #[error("truncated frame: expected at least {expected}, got {actual}")]
    Truncated {
        /// Minimum bytes the framing declared
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Declared payload length exceeds the decode cap
    #[error("payload length {len} exceeds cap {cap}")]
    PayloadTooLarge {
        /// Declared payload length
        len: usize,
        /// Configured cap
        cap: usize,
    },

    /// A flag promised a section the packet does not carry
    #[error("flag set but section missing: {0}")]
    MissingSection(&'static str),

    /// Compressed payload failed to inflate or declared a bogus raw size
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Fragment payload malformed
    #[error("malformed fragment: {0}")]
    BadFragment(&'static str),

    /// Fragment set inconsistent (total mismatch, chunk overflow)
    #[error("inconsistent fragment transfer: {0}")]
    FragmentMismatch(&'static str),

    /// Payload cannot be fragmented into the given MTU
    #[error("mtu {0} too small to carry a fragment")]
    MtuTooSmall(usize),
}
