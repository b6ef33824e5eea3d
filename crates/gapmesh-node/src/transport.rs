//! The transport capability the Router depends on.
//!
//! Concrete transports live in their own crates; this trait is the only
//! surface the Router sees, and the controller owns the explicit
//! `Vec<Arc<dyn Transport>>` in preference order. WiFi-Aware and friends
//! would slot in as [`TransportKind::Extra`] without touching the Router.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gapmesh_crypto::NoiseSessionManager;
use gapmesh_mesh::MeshTransport;
use gapmesh_relay::RelayTransport;
use gapmesh_wire::{MessageType, Packet, PeerId};

use crate::error::NodeError;
use crate::services::Clock;

/// Which family a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// BLE mesh
    Mesh,
    /// Relay network
    Internet,
    /// Optional future transports (WiFi-Aware and the like)
    Extra,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mesh => f.write_str("mesh"),
            Self::Internet => f.write_str("internet"),
            Self::Extra => f.write_str("extra"),
        }
    }
}

/// Capability interface for anything that can carry private payloads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which family this transport is.
    fn kind(&self) -> TransportKind;

    /// True when a private payload handed over right now will go out.
    fn is_peer_reachable(&self, peer: &PeerId) -> bool;

    /// Encrypt and deliver a private payload envelope to `peer`.
    async fn send_private(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NodeError>;
}

#[async_trait]
impl Transport for MeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        MeshTransport::is_peer_reachable(self, peer)
    }

    async fn send_private(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NodeError> {
        MeshTransport::send_private(self, peer, payload).await?;
        Ok(())
    }
}

/// Relay transport adapted to the capability: the mesh encrypts inside the
/// transport, so this adapter does the same before embedding.
pub struct RelayCapability {
    relay: Arc<RelayTransport>,
    noise: Arc<NoiseSessionManager>,
    clock: Arc<dyn Clock>,
    initial_ttl: u8,
}

impl RelayCapability {
    /// Wrap the relay transport with the shared Noise state.
    #[must_use]
    pub fn new(
        relay: Arc<RelayTransport>,
        noise: Arc<NoiseSessionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            relay,
            noise,
            clock,
            initial_ttl: gapmesh_wire::MAX_TTL,
        }
    }
}

#[async_trait]
impl Transport for RelayCapability {
    fn kind(&self) -> TransportKind {
        TransportKind::Internet
    }

    fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        // Reachable means deliverable now: a relay binding, a live socket,
        // and an established session to encrypt under.
        self.relay.is_peer_reachable(peer) && !self.noise.handshake_required(peer)
    }

    async fn send_private(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NodeError> {
        let ciphertext = self.noise.encrypt(peer, payload, Instant::now())?;
        let packet = Packet::private(
            MessageType::NoiseEncrypted,
            self.noise.local_peer_id(),
            *peer,
            self.clock.unix_millis(),
            self.initial_ttl,
            ciphertext,
        );
        self.relay.send_packet(peer, &packet).await?;
        Ok(())
    }
}
