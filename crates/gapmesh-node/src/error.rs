//! Error types for the node layer.

use thiserror::Error;

/// Node-level errors; only the session controller maps these to
/// user-visible events.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Wire-level failure
    #[error("wire error: {0}")]
    Wire(#[from] gapmesh_wire::WireError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] gapmesh_crypto::CryptoError),

    /// Mesh transport failure
    #[error("mesh error: {0}")]
    Mesh(#[from] gapmesh_mesh::MeshError),

    /// Relay transport failure
    #[error("relay error: {0}")]
    Relay(#[from] gapmesh_relay::RelayError),

    /// No transport can reach the peer right now
    #[error("peer unreachable")]
    Unreachable,

    /// The transport does not support the requested operation
    #[error("operation unsupported on this transport")]
    Unsupported,

    /// Malformed private payload envelope
    #[error("bad payload envelope: {0}")]
    BadEnvelope(&'static str),

    /// Keychain unavailable or corrupt; fatal, not retried in the core
    #[error("keychain failure: {0}")]
    Keychain(String),
}
