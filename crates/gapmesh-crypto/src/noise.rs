//! Noise XX handshake for mutual authentication with identity hiding.
//!
//! Pattern: `Noise_XX_25519_ChaChaPoly_SHA256` via the snow library.
//!
//! ```text
//! Message 1: Initiator → Responder: e
//! Message 2: Responder → Initiator: e, ee, s, es
//! Message 3: Initiator → Responder: s, se
//! ```
//!
//! After message 3 both parties have authenticated each other's static keys
//! and hold transport ciphers with forward secrecy. Static keys travel
//! encrypted, so a passive observer learns neither identity.

use snow::{Builder, HandshakeState};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Full Noise protocol name.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Upper bound on a handshake message with padding slack.
/// Message 1: 32 (e); message 2: 96 (e, s+tag, tag); message 3: 64 (s+tag, tag).
pub const MAX_HANDSHAKE_MESSAGE: usize = 256;

/// Exact size of handshake message 1, used to spot concurrent initiators.
pub const MESSAGE_1_SIZE: usize = 32;

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1
    Initiator,
    /// Receives message 1
    Responder,
}

/// Static X25519 keypair for Noise handshakes.
pub struct NoiseKeypair {
    private: Vec<u8>,
    public: [u8; 32],
}

impl NoiseKeypair {
    /// Generate a new random keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Snow`] when the pattern fails to parse or the
    /// RNG fails; neither happens with a valid build.
    pub fn generate() -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Snow(format!("pattern parse error: {e:?}")))?,
        );
        let keypair = builder.generate_keypair()?;
        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);
        Ok(Self {
            private: keypair.private,
            public,
        })
    }

    /// Rebuild from a persisted private key, re-deriving the public half.
    ///
    /// # Errors
    ///
    /// Infallible for 32-byte input; `Result` keeps the constructor family
    /// uniform with [`NoiseKeypair::generate`].
    pub fn from_private(private: [u8; 32]) -> Result<Self, CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
        Ok(Self {
            private: private.to_vec(),
            public,
        })
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Private key bytes. Long-term identity material; handle with care.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private
    }

    /// Zeroize the private half in place.
    pub fn wipe(&mut self) {
        self.private.zeroize();
        self.public = [0u8; 32];
    }
}

impl Drop for NoiseKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl Clone for NoiseKeypair {
    fn clone(&self) -> Self {
        Self {
            private: self.private.clone(),
            public: self.public,
        }
    }
}

/// One in-flight Noise XX handshake.
pub struct NoiseHandshake {
    state: HandshakeState,
    role: Role,
}

impl NoiseHandshake {
    /// Start as the initiator.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Snow`] for pattern or key errors.
    pub fn new_initiator(local: &NoiseKeypair) -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Snow(format!("pattern parse error: {e:?}")))?,
        );
        let state = builder
            .local_private_key(local.private_key())
            .build_initiator()?;
        Ok(Self {
            state,
            role: Role::Initiator,
        })
    }

    /// Start as the responder.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Snow`] for pattern or key errors.
    pub fn new_responder(local: &NoiseKeypair) -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Snow(format!("pattern parse error: {e:?}")))?,
        );
        let state = builder
            .local_private_key(local.private_key())
            .build_responder()?;
        Ok(Self {
            state,
            role: Role::Responder,
        })
    }

    /// Role of this side.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// True once message 3 has been written or read.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Write the next handshake message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] out of turn, or
    /// [`CryptoError::Snow`] when snow fails.
    pub fn write_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        if !self.state.is_my_turn() {
            return Err(CryptoError::InvalidState);
        }
        let mut message = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = self.state.write_message(&[], &mut message)?;
        message.truncate(len);
        Ok(message)
    }

    /// Read a handshake message from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] out of turn, or
    /// [`CryptoError::HandshakeFailed`] when authentication fails.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        if self.state.is_my_turn() {
            return Err(CryptoError::InvalidState);
        }
        let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        self.state
            .read_message(message, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        Ok(())
    }

    /// Remote static key; available once message 2 (initiator view) or
    /// message 3 (responder view) has been processed.
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|key| {
            let mut out = [0u8; 32];
            out.copy_from_slice(key);
            out
        })
    }

    /// Consume the handshake and return the transport state.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] before message 3.
    pub fn into_transport(self) -> Result<snow::TransportState, CryptoError> {
        if !self.is_complete() {
            return Err(CryptoError::InvalidState);
        }
        Ok(self.state.into_transport_mode()?)
    }
}
