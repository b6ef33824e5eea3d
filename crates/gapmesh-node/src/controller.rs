//! The session controller: the one surface applications see.
//!
//! Owns the injected services, the Noise state, both transports, the
//! Router, and Favorites; wires their event streams together and maps
//! everything to typed application events. No component below this layer
//! ever reaches the application directly, and none of them holds a
//! reference back up; all coupling is event channels.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gapmesh_crypto::{IdentityKeys, NoiseSessionManager};
use gapmesh_mesh::{BlePlatform, MeshConfig, MeshEvent, MeshTransport};
use gapmesh_relay::{
    NostrIdentity, PoolConfig, PoolEvent, RelayEvent, RelayPool, RelayTransport,
};
use gapmesh_wire::{Deduplicator, MessageType, Packet, PeerId};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::favorites::{FavoritesChange, FavoritesStore};
use crate::payload::{FavoriteNotification, PrivatePayload, MESSAGE_ID_LEN};
use crate::router::{Router, RouterEvent, SendOutcome};
use crate::services::{ClockAdapter, Services, KEY_SIGNING_IDENTITY, KEY_STATIC_IDENTITY};
use crate::transport::{RelayCapability, Transport, TransportKind};

/// Events the controller emits to the application.
#[derive(Debug)]
pub enum ControllerEvent {
    /// A peer is now visible
    PeerAppeared {
        /// Mesh address
        peer: PeerId,
        /// Announced nickname
        nickname: String,
    },
    /// A peer went away
    PeerDisappeared {
        /// Mesh address
        peer: PeerId,
    },
    /// A chat message arrived
    MessageReceived {
        /// Sender
        from: PeerId,
        /// Body text
        text: String,
        /// Message id for private messages
        message_id: Option<[u8; MESSAGE_ID_LEN]>,
        /// Sender's wall-clock stamp, milliseconds
        timestamp: u64,
        /// Controller-side receive stamp, milliseconds; display sorts by this
        received_at: u64,
        /// True for private messages
        private: bool,
        /// Transport it arrived on
        via: TransportKind,
    },
    /// Encrypted session established with a peer
    NoiseHandshakeComplete {
        /// The peer
        peer: PeerId,
        /// Hex fingerprint of its static key
        fingerprint: String,
    },
    /// A known peer came back with a different static key
    PeerIdentityChanged {
        /// The peer
        peer: PeerId,
        /// What we used to trust
        old_fingerprint: String,
        /// What it presents now
        new_fingerprint: String,
    },
    /// The peer's device received a private message
    DeliveryAck {
        /// The peer
        peer: PeerId,
        /// Which message
        message_id: [u8; MESSAGE_ID_LEN],
    },
    /// The peer's user saw a private message
    ReadAck {
        /// The peer
        peer: PeerId,
        /// Which message
        message_id: [u8; MESSAGE_ID_LEN],
    },
    /// A location-channel broadcast arrived
    ChannelMessage {
        /// Geohash topic
        geohash: String,
        /// Sender's Nostr pubkey
        sender: String,
        /// Body
        content: String,
    },
    /// A file-transfer envelope arrived
    FileTransfer {
        /// Sender
        from: PeerId,
        /// Raw payload; storage is the application's concern
        payload: Vec<u8>,
    },
    /// Something the user should know, in words
    SystemMessage {
        /// The text
        text: String,
    },
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Our nickname
    pub nickname: String,
    /// Platform device name for the mesh dial tie-break
    pub device_name: String,
    /// Advertise/scan the legacy constant UUID too
    pub legacy_compatibility: bool,
    /// Relay pool settings
    pub relay: PoolConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".into(),
            device_name: "gapmesh".into(),
            legacy_compatibility: false,
            relay: PoolConfig::default(),
        }
    }
}

/// Load the identity from the keychain or mint and persist a fresh one.
///
/// # Errors
///
/// Returns [`NodeError::Crypto`] when persisted key material is corrupt.
pub fn load_or_create_identity(services: &Services) -> Result<IdentityKeys, NodeError> {
    let static_blob = services.keychain.get(KEY_STATIC_IDENTITY);
    let signing_blob = services.keychain.get(KEY_SIGNING_IDENTITY);
    if let (Some(static_key), Some(signing_key)) = (static_blob, signing_blob) {
        return Ok(IdentityKeys::from_bytes(&static_key, &signing_key)?);
    }
    let identity = IdentityKeys::generate()?;
    let (static_key, signing_key) = identity.to_bytes();
    services.keychain.set(KEY_STATIC_IDENTITY, &static_key);
    services.keychain.set(KEY_SIGNING_IDENTITY, &signing_key);
    info!(peer = %identity.peer_id(), "minted fresh identity");
    Ok(identity)
}

/// Derive the Nostr identity deterministically from the static key, so the
/// keychain stays at its three blobs and a panic wipe rotates both at once.
fn derive_nostr_identity(identity: &IdentityKeys) -> NostrIdentity {
    let (static_key, _) = identity.to_bytes();
    let mut material = Sha256::new()
        .chain_update(static_key)
        .chain_update(b"gapmesh-nostr-v1")
        .finalize();
    loop {
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&material);
        if let Ok(nostr) = NostrIdentity::from_secret_bytes(&secret) {
            return nostr;
        }
        // Out-of-range scalar (probability ~2^-128): hash again.
        material = Sha256::digest(material);
    }
}

struct PendingReceivers {
    mesh: mpsc::Receiver<MeshEvent>,
    relay: mpsc::Receiver<RelayEvent>,
    pool: mpsc::Receiver<PoolEvent>,
    router: mpsc::Receiver<RouterEvent>,
}

/// The application facade.
pub struct SessionController {
    identity: Arc<IdentityKeys>,
    noise: Arc<NoiseSessionManager>,
    mesh: Arc<MeshTransport>,
    relay: Arc<RelayTransport>,
    router: Arc<Router>,
    favorites: Arc<FavoritesStore>,
    dedup: Arc<Deduplicator>,
    services: Services,
    events: mpsc::Sender<ControllerEvent>,
    known_fingerprints: DashMap<PeerId, String>,
    nicknames: DashMap<PeerId, String>,
    last_stamp: std::sync::atomic::AtomicU64,
    pending: Mutex<Option<PendingReceivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    /// Assemble the whole core over an injected BLE platform and services.
    ///
    /// # Errors
    ///
    /// Fails when persisted identity material is corrupt.
    pub fn build(
        platform: Arc<dyn BlePlatform>,
        services: Services,
        config: ControllerConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ControllerEvent>), NodeError> {
        let identity = Arc::new(load_or_create_identity(&services)?);
        let noise = Arc::new(NoiseSessionManager::new(identity.noise_keypair().clone()));
        let dedup = Arc::new(Deduplicator::default());
        let clock_adapter = Arc::new(ClockAdapter(services.clock.clone()));

        let (mesh, mesh_rx) = MeshTransport::new(
            platform,
            Arc::clone(&noise),
            Arc::clone(&identity),
            Arc::clone(&dedup),
            clock_adapter.clone(),
            MeshConfig {
                device_name: config.device_name.clone(),
                nickname: config.nickname.clone(),
                legacy_compatibility: config.legacy_compatibility,
                ..MeshConfig::default()
            },
        );

        let nostr_identity = derive_nostr_identity(&identity);
        let (pool, pool_rx) = RelayPool::new(config.relay.clone());
        let (relay, relay_rx) = RelayTransport::new(nostr_identity, pool, clock_adapter);

        let favorites = Arc::new(FavoritesStore::load(services.keychain.clone()));
        // Bindings persisted from earlier runs come back immediately.
        for (peer, nostr_pubkey) in favorites.relay_reachable() {
            relay.register_peer(peer, &nostr_pubkey);
        }

        let relay_capability = Arc::new(RelayCapability::new(
            Arc::clone(&relay),
            Arc::clone(&noise),
            services.clock.clone(),
        ));
        let (router, router_rx) = Router::new(vec![
            Arc::clone(&mesh) as Arc<dyn Transport>,
            relay_capability as Arc<dyn Transport>,
        ]);

        let (events, events_rx) = mpsc::channel(256);
        let controller = Arc::new(Self {
            identity,
            noise,
            mesh,
            relay,
            router,
            favorites,
            dedup,
            services,
            events,
            known_fingerprints: DashMap::new(),
            nicknames: DashMap::new(),
            last_stamp: std::sync::atomic::AtomicU64::new(0),
            pending: Mutex::new(Some(PendingReceivers {
                mesh: mesh_rx,
                relay: relay_rx,
                pool: pool_rx,
                router: router_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        });
        Ok((controller, events_rx))
    }

    /// Start transports and event pumps.
    ///
    /// # Errors
    ///
    /// Fails when the BLE platform refuses to start.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let Some(pending) = self.pending.lock().take() else {
            return Ok(());
        };
        self.mesh.start().await?;
        self.relay.start(pending.pool).await;

        let controller = Arc::clone(self);
        let mut mesh_rx = pending.mesh;
        self.spawn(async move {
            while let Some(event) = mesh_rx.recv().await {
                controller.on_mesh_event(event).await;
            }
        });

        let controller = Arc::clone(self);
        let mut relay_rx = pending.relay;
        self.spawn(async move {
            while let Some(event) = relay_rx.recv().await {
                controller.on_relay_event(event).await;
            }
        });

        let controller = Arc::clone(self);
        let mut router_rx = pending.router;
        self.spawn(async move {
            while let Some(event) = router_rx.recv().await {
                controller.on_router_event(event).await;
            }
        });

        // Outbox aging.
        let controller = Arc::clone(self);
        self.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let now_ms = controller.services.clock.unix_millis();
                controller.router.expire(now_ms).await;
            }
        });

        Ok(())
    }

    fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(future));
    }

    /// Receive stamp: wall millis forced strictly monotonic, so display
    /// order is total even when messages land in the same millisecond or
    /// the wall clock steps backwards.
    fn stamp(&self) -> u64 {
        use std::sync::atomic::Ordering;
        let wall = self.services.clock.unix_millis();
        self.last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .map_or(wall, |last| wall.max(last + 1))
    }

    /// Our mesh address.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.noise.local_peer_id()
    }

    /// Our stable fingerprint.
    #[must_use]
    pub fn local_fingerprint(&self) -> String {
        self.identity.fingerprint().to_hex()
    }

    /// Our Nostr pubkey for favorites exchange.
    #[must_use]
    pub fn local_nostr_pubkey(&self) -> String {
        self.relay.local_pubkey()
    }

    /// Peers currently visible on the mesh.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<(PeerId, Option<String>)> {
        self.mesh.connected_peers()
    }

    /// Send a public message to the whole mesh. Mentions ride along for the
    /// UI; the wire payload is the text itself.
    pub async fn send_public(&self, text: &str, mentions: &[String]) {
        if !mentions.is_empty() {
            debug!(count = mentions.len(), "mentions noted");
        }
        self.mesh.send_public(text.as_bytes().to_vec()).await;
    }

    /// Send a private message; returns the message id acks will reference.
    pub async fn send_private(&self, text: &str, peer: PeerId) -> [u8; MESSAGE_ID_LEN] {
        let mut message_id = [0u8; MESSAGE_ID_LEN];
        self.services.random.fill(&mut message_id);
        let envelope = PrivatePayload::Text {
            message_id,
            text: text.to_string(),
        }
        .encode();
        let nickname = self.nicknames.get(&peer).map(|n| n.value().clone());
        let now_ms = self.services.clock.unix_millis();
        let outcome = self
            .router
            .send_private(peer, message_id, envelope, nickname, now_ms)
            .await;
        if outcome == SendOutcome::Queued {
            self.kick_handshake(peer).await;
            let _ = self
                .events
                .send(ControllerEvent::SystemMessage {
                    text: format!("message to {peer} queued until reachable"),
                })
                .await;
        }
        message_id
    }

    /// Explicitly begin establishing encryption with a peer.
    pub async fn start_handshake(&self, peer: PeerId) {
        self.kick_handshake(peer).await;
    }

    /// Change our nickname; announces go out immediately.
    pub async fn set_nickname(&self, nickname: &str) {
        self.mesh.set_nickname(nickname).await;
    }

    /// Report that the user saw a message. Best-effort.
    pub async fn mark_read(&self, peer: PeerId, message_id: [u8; MESSAGE_ID_LEN]) {
        let envelope = PrivatePayload::ReadAck { message_id }.encode();
        self.router.send_receipt(peer, envelope).await;
    }

    /// Favorite or unfavorite a peer with an established session.
    ///
    /// # Errors
    ///
    /// [`NodeError::Unreachable`] before a session reveals the peer's key.
    pub async fn set_favorite(&self, peer: PeerId, favorite: bool) -> Result<(), NodeError> {
        let public_key = self
            .noise
            .remote_static_key(&peer)
            .or_else(|| {
                self.favorites
                    .get(&peer)
                    .and_then(|record| record.peer_public_key.as_slice().try_into().ok())
            })
            .ok_or(NodeError::Unreachable)?;
        let nickname = self.nicknames.get(&peer).map(|n| n.value().clone());
        let now_ms = self.services.clock.unix_millis();
        let change = self
            .favorites
            .set_favorite(&public_key, nickname, favorite, now_ms);
        self.apply_favorites_change(change).await;

        // Tell the peer over whatever transport is live.
        let notification = PrivatePayload::Favorite(FavoriteNotification {
            is_favorite: favorite,
            nostr_pubkey: favorite.then(|| self.local_nostr_pubkey()),
        })
        .encode();
        self.router.send_receipt(peer, notification).await;
        Ok(())
    }

    /// Join a geohash location channel.
    pub async fn join_channel(&self, geohash: &str) {
        self.relay.join_channel(geohash).await;
    }

    /// Broadcast into a geohash location channel.
    ///
    /// # Errors
    ///
    /// Relay errors when no socket is up.
    pub async fn send_channel_message(&self, geohash: &str, text: &str) -> Result<(), NodeError> {
        self.relay.send_channel_message(geohash, text).await?;
        Ok(())
    }

    /// Destroy all local secrets and state, synchronously. The next start
    /// mints a fresh identity; nothing survives but the app binary.
    pub async fn panic_wipe(&self) {
        warn!("panic wipe");
        self.noise.close_all();
        self.router.clear();
        self.favorites.wipe();
        self.relay.clear_peers();
        self.dedup.clear();
        self.known_fingerprints.clear();
        self.nicknames.clear();
        self.services.keychain.wipe_all();
        let _ = self
            .events
            .send(ControllerEvent::SystemMessage {
                text: "all local data destroyed".into(),
            })
            .await;
    }

    /// Drop every radio link and relay socket immediately.
    pub async fn emergency_disconnect_all(&self) {
        self.mesh.emergency_disconnect().await;
        self.relay.stop();
        self.noise.close_all();
    }

    async fn kick_handshake(&self, peer: PeerId) {
        if !self.noise.handshake_required(&peer) {
            // Session already up; anything queued can go now.
            self.router.flush_peer(&peer).await;
            return;
        }
        if self.mesh.has_link(&peer) {
            if let Err(e) = self.mesh.start_handshake(&peer).await {
                debug!(%peer, error = %e, "mesh handshake start failed");
            }
        } else if self.relay.is_peer_reachable(&peer) {
            if let Err(e) = self.start_relay_handshake(peer).await {
                debug!(%peer, error = %e, "relay handshake start failed");
            }
        }
    }

    async fn start_relay_handshake(&self, peer: PeerId) -> Result<(), NodeError> {
        let message = self
            .noise
            .initiate_handshake(peer, self.services.clock.monotonic())?;
        let packet = Packet::private(
            MessageType::NoiseHandshake,
            self.local_peer_id(),
            peer,
            self.services.clock.unix_millis(),
            gapmesh_wire::MAX_TTL,
            message,
        );
        self.relay.send_packet(&peer, &packet).await?;
        Ok(())
    }

    async fn on_mesh_event(self: &Arc<Self>, event: MeshEvent) {
        match event {
            MeshEvent::PeerAppeared { peer, nickname } => {
                self.nicknames.insert(peer, nickname.clone());
                self.favorites
                    .note_seen(&peer, Some(&nickname), self.services.clock.unix_millis());
                let _ = self
                    .events
                    .send(ControllerEvent::PeerAppeared { peer, nickname })
                    .await;
            }
            MeshEvent::PeerDisappeared { peer } => {
                let _ = self
                    .events
                    .send(ControllerEvent::PeerDisappeared { peer })
                    .await;
            }
            MeshEvent::HandshakeComplete { peer, fingerprint } => {
                self.on_handshake_complete(peer, fingerprint.to_hex()).await;
            }
            MeshEvent::SecurePayload {
                peer,
                plaintext,
                timestamp,
            } => {
                self.on_private_envelope(peer, &plaintext, timestamp, TransportKind::Mesh)
                    .await;
            }
            MeshEvent::PublicPacket { packet } => {
                let text = String::from_utf8_lossy(&packet.payload).into_owned();
                let _ = self
                    .events
                    .send(ControllerEvent::MessageReceived {
                        from: packet.sender_id,
                        text,
                        message_id: None,
                        timestamp: packet.timestamp,
                        received_at: self.stamp(),
                        private: false,
                        via: TransportKind::Mesh,
                    })
                    .await;
            }
            MeshEvent::SyncRequest { packet } => {
                debug!(peer = %packet.sender_id, "sync requested, no backlog kept");
            }
            MeshEvent::FileTransferPacket { packet } => {
                let _ = self
                    .events
                    .send(ControllerEvent::FileTransfer {
                        from: packet.sender_id,
                        payload: packet.payload,
                    })
                    .await;
            }
            MeshEvent::EncryptionFailure { peer } => {
                let _ = self
                    .events
                    .send(ControllerEvent::SystemMessage {
                        text: format!("encryption with {peer} must re-establish"),
                    })
                    .await;
            }
            MeshEvent::LinkReset { device } => {
                debug!(%device, "link stream reset");
            }
        }
    }

    async fn on_relay_event(self: &Arc<Self>, event: RelayEvent) {
        match event {
            RelayEvent::PacketReceived {
                sender_nostr,
                sender_peer,
                packet,
            } => {
                let peer = sender_peer.unwrap_or(packet.sender_id);
                match packet.message_type {
                    MessageType::NoiseHandshake => {
                        // Make sure replies can route back over the relay.
                        self.relay.register_peer(packet.sender_id, &sender_nostr);
                        self.on_relay_handshake(packet).await;
                    }
                    MessageType::NoiseEncrypted => {
                        let now = self.services.clock.monotonic();
                        match self.noise.decrypt(&packet.sender_id, &packet.payload, now) {
                            Ok(plaintext) => {
                                self.on_private_envelope(
                                    packet.sender_id,
                                    &plaintext,
                                    packet.timestamp,
                                    TransportKind::Internet,
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!(%peer, error = %e, "relay decrypt failed");
                                let _ = self
                                    .events
                                    .send(ControllerEvent::SystemMessage {
                                        text: format!("encryption with {peer} must re-establish"),
                                    })
                                    .await;
                            }
                        }
                    }
                    other => debug!(?other, "unexpected embedded packet type"),
                }
            }
            RelayEvent::ChannelMessage {
                geohash,
                sender_nostr,
                content,
            } => {
                let _ = self
                    .events
                    .send(ControllerEvent::ChannelMessage {
                        geohash,
                        sender: sender_nostr,
                        content,
                    })
                    .await;
            }
            RelayEvent::RelayStatus { connected } => {
                debug!(connected, "relay connectivity changed");
                if connected > 0 {
                    self.on_relay_available().await;
                }
            }
        }
    }

    async fn on_relay_handshake(self: &Arc<Self>, packet: Packet) {
        let peer = packet.sender_id;
        let now = self.services.clock.monotonic();
        match self.noise.process_handshake(peer, &packet.payload, now) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let response = Packet::private(
                        MessageType::NoiseHandshake,
                        self.local_peer_id(),
                        peer,
                        self.services.clock.unix_millis(),
                        gapmesh_wire::MAX_TTL,
                        reply,
                    );
                    if let Err(e) = self.relay.send_packet(&peer, &response).await {
                        warn!(%peer, error = %e, "relay handshake reply failed");
                    }
                }
                if let Some(info) = outcome.established {
                    self.on_handshake_complete(peer, info.fingerprint.to_hex())
                        .await;
                }
            }
            Err(e) => warn!(%peer, error = %e, "relay handshake failed"),
        }
    }

    /// Relay connectivity appeared: push handshakes for peers with queued
    /// mail reachable only over the internet.
    async fn on_relay_available(self: &Arc<Self>) {
        for peer in self.router.peers_with_queued() {
            if self.noise.handshake_required(&peer) {
                if !self.mesh.has_link(&peer) && self.relay.is_peer_reachable(&peer) {
                    if let Err(e) = self.start_relay_handshake(peer).await {
                        debug!(%peer, error = %e, "deferred relay handshake failed");
                    }
                }
            } else {
                self.router.flush_peer(&peer).await;
            }
        }
    }

    async fn on_handshake_complete(self: &Arc<Self>, peer: PeerId, fingerprint: String) {
        match self.known_fingerprints.insert(peer, fingerprint.clone()) {
            Some(old) if old != fingerprint => {
                warn!(%peer, "peer identity changed");
                let _ = self
                    .events
                    .send(ControllerEvent::PeerIdentityChanged {
                        peer,
                        old_fingerprint: old,
                        new_fingerprint: fingerprint,
                    })
                    .await;
            }
            _ => {
                let _ = self
                    .events
                    .send(ControllerEvent::NoiseHandshakeComplete { peer, fingerprint })
                    .await;
            }
        }
        // Whatever waited on encryption can go now.
        self.router.flush_peer(&peer).await;
    }

    async fn on_private_envelope(
        self: &Arc<Self>,
        peer: PeerId,
        plaintext: &[u8],
        timestamp: u64,
        via: TransportKind,
    ) {
        match PrivatePayload::decode(plaintext) {
            Ok(PrivatePayload::Text { message_id, text }) => {
                self.services.notifier.present(
                    self.nicknames
                        .get(&peer)
                        .map(|n| n.value().clone())
                        .unwrap_or_else(|| peer.to_hex())
                        .as_str(),
                    &text,
                    &peer.to_hex(),
                );
                let _ = self
                    .events
                    .send(ControllerEvent::MessageReceived {
                        from: peer,
                        text,
                        message_id: Some(message_id),
                        timestamp,
                        received_at: self.stamp(),
                        private: true,
                        via,
                    })
                    .await;
                // Delivery receipt, best-effort.
                let ack = PrivatePayload::DeliveryAck { message_id }.encode();
                self.router.send_receipt(peer, ack).await;
            }
            Ok(PrivatePayload::DeliveryAck { message_id }) => {
                let _ = self
                    .events
                    .send(ControllerEvent::DeliveryAck { peer, message_id })
                    .await;
            }
            Ok(PrivatePayload::ReadAck { message_id }) => {
                let _ = self
                    .events
                    .send(ControllerEvent::ReadAck { peer, message_id })
                    .await;
            }
            Ok(PrivatePayload::Favorite(notification)) => {
                let Some(public_key) = self.noise.remote_static_key(&peer) else {
                    warn!(%peer, "favorite notification without session");
                    return;
                };
                let change = self.favorites.note_peer_assertion(
                    &public_key,
                    notification.is_favorite,
                    notification.nostr_pubkey,
                    self.services.clock.unix_millis(),
                );
                self.apply_favorites_change(change).await;
            }
            Err(e) => warn!(%peer, error = %e, "undecodable private payload"),
        }
    }

    async fn apply_favorites_change(&self, change: FavoritesChange) {
        match change {
            FavoritesChange::BecameReachable { peer, nostr_pubkey } => {
                self.relay.register_peer(peer, &nostr_pubkey);
                let _ = self
                    .events
                    .send(ControllerEvent::SystemMessage {
                        text: format!("{peer} reachable over the internet"),
                    })
                    .await;
                self.router.flush_peer(&peer).await;
            }
            FavoritesChange::BecameUnreachable { peer } => {
                self.relay.unregister_peer(&peer);
            }
            FavoritesChange::None => {}
        }
    }

    async fn on_router_event(self: &Arc<Self>, event: RouterEvent) {
        match event {
            RouterEvent::OutboxOverflow { peer, .. } => {
                let _ = self
                    .events
                    .send(ControllerEvent::SystemMessage {
                        text: format!("outbox for {peer} full, oldest message dropped"),
                    })
                    .await;
            }
            RouterEvent::OutboxExpired { peer, .. } => {
                let _ = self
                    .events
                    .send(ControllerEvent::SystemMessage {
                        text: format!("queued message to {peer} expired"),
                    })
                    .await;
            }
            RouterEvent::Flushed { peer, via, .. } => {
                debug!(%peer, %via, "queued message delivered");
            }
        }
    }
}
