//! Error types for the BLE mesh transport.

use thiserror::Error;

/// Mesh transport errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Underlying BLE platform failure (adapter off, permission revoked)
    #[error("ble platform error: {0}")]
    Platform(String),

    /// A characteristic write did not confirm in time
    #[error("write to {peer} timed out")]
    WriteTimeout {
        /// Link the write was queued on
        peer: String,
    },

    /// The link is gone
    #[error("not connected to {0}")]
    NotConnected(String),

    /// Wire-level failure on the inbound path
    #[error("wire error: {0}")]
    Wire(#[from] gapmesh_wire::WireError),

    /// Cryptographic failure on the inbound or outbound path
    #[error("crypto error: {0}")]
    Crypto(#[from] gapmesh_crypto::CryptoError),

    /// The transport is shut down
    #[error("mesh transport stopped")]
    Stopped,
}
