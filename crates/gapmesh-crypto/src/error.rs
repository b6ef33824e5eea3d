//! Error types for the gapmesh crypto layer.

use thiserror::Error;

/// Cryptographic errors.
///
/// Anything below [`CryptoError::HandshakeInProgress`] is terminal for the
/// session it names: callers purge the session and require a fresh handshake.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Handshake message invalid for the current state
    #[error("invalid handshake state")]
    InvalidState,

    /// Handshake MAC or format failure
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD authentication failure
    #[error("decryption failed")]
    DecryptionFailed,

    /// AEAD encryption failure
    #[error("encryption failed")]
    EncryptionFailed,

    /// Nonce replayed or arrived before the sliding window
    #[error("nonce {0} replayed or outside the replay window")]
    ReplayViolation(u64),

    /// Ciphertext declared an epoch older than the receive direction's
    #[error("stale rekey epoch {got}, at {current}")]
    StaleEpoch {
        /// Epoch the ciphertext declared
        got: u64,
        /// Epoch the receive direction is at
        current: u64,
    },

    /// Ciphertext too short to carry its framing
    #[error("ciphertext too short")]
    CiphertextTooShort,

    /// No session exists for the peer
    #[error("no session with peer")]
    NoSession,

    /// Session has been closed; further use is an error
    #[error("session closed")]
    SessionClosed,

    /// A handshake is already in flight for this peer
    #[error("handshake already in progress")]
    HandshakeInProgress,

    /// Signature verification failure
    #[error("bad signature")]
    BadSignature,

    /// Malformed key material
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// snow library error
    #[error("noise error: {0}")]
    Snow(String),
}

impl From<snow::Error> for CryptoError {
    fn from(e: snow::Error) -> Self {
        CryptoError::Snow(e.to_string())
    }
}
