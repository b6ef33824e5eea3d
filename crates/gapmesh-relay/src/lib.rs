//! # gapmesh-relay
//!
//! Internet transport for the gapmesh chat core, over the Nostr relay
//! network.
//!
//! This crate provides:
//! - The Nostr event model with Schnorr signatures
//! - NIP-44 v2 sealing and the NIP-17/59 gift-wrap envelope
//! - The `bitchat1:` embedding of core packets inside rumors
//! - A relay pool with exponential backoff and shared subscriptions
//! - Ephemeral geohash-channel broadcasts
//!
//! The transport carries packets only; queueing for unreachable peers lives
//! in the Router's outbox, not here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod giftwrap;
pub mod nip44;
pub mod pool;
pub mod transport;

pub use error::RelayError;
pub use event::{
    NostrEvent, KIND_EPHEMERAL, KIND_GIFT_WRAP, KIND_NOTE, KIND_RUMOR, KIND_SEAL,
};
pub use giftwrap::{unwrap_packet, wrap_packet, Unwrapped, PACKET_MARKER};
pub use pool::{PoolConfig, PoolEvent, RelayPool, DEFAULT_RELAYS};
pub use transport::{NostrIdentity, RelayEvent, RelayTransport, TimeSource};
