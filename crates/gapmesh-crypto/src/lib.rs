//! # gapmesh-crypto
//!
//! Cryptographic engine for the gapmesh chat core:
//! - `Noise_XX_25519_ChaChaPoly_SHA256` handshakes over the snow library
//! - Established-session transport with explicit nonces, a 1024-entry
//!   sliding replay window, and per-direction rekeying
//! - Long-term identity keys (static X25519 + Ed25519) and fingerprints
//!
//! The [`NoiseSessionManager`] is the one entry point transports use; it
//! serializes work per peer and purges a session on its first cryptographic
//! failure, after which a fresh handshake is required.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identity;
pub mod manager;
pub mod noise;
pub mod replay;
pub mod session;

pub use error::CryptoError;
pub use identity::{verify_signature, Fingerprint, IdentityKeys};
pub use manager::{
    EstablishedInfo, HandshakeOutcome, NoiseSessionManager, SessionPhase, HANDSHAKE_TIMEOUT,
};
pub use noise::{NoiseHandshake, NoiseKeypair, Role, MESSAGE_1_SIZE, NOISE_PATTERN};
pub use replay::{ReplayWindow, WINDOW_SIZE};
pub use session::{EstablishedSession, REKEY_INTERVAL, REKEY_MESSAGES, SESSION_HEADER};
