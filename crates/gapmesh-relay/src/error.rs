//! Error types for the internet relay transport.

use thiserror::Error;

/// Relay transport errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Event serialization or parsing failure
    #[error("event format error: {0}")]
    EventFormat(String),

    /// Schnorr signature invalid
    #[error("bad event signature")]
    BadSignature,

    /// NIP-44 sealing or unsealing failure
    #[error("seal error: {0}")]
    Seal(String),

    /// Gift wrap did not contain an embedded packet
    #[error("no embedded packet in rumor")]
    NoEmbeddedPacket,

    /// Embedded packet failed to decode
    #[error("wire error: {0}")]
    Wire(#[from] gapmesh_wire::WireError),

    /// The peer has no known relay identity
    #[error("no nostr key for peer")]
    UnknownPeer,

    /// No relay connection is up
    #[error("no relay connected")]
    NoRelay,

    /// Key material rejected by secp256k1
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
