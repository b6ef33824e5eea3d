//! The BLE mesh transport: discovery, connection lifecycle, announces,
//! Noise integration, and TTL-bounded flood relay.
//!
//! Every device is central and peripheral at once. The peripheral side
//! advertises the rotating service UUID set and accepts writes on the fixed
//! characteristic; the central side scans and dials. Inbound bytes flow
//! notification → stream assembler → codec → deduplicator → (Noise) →
//! events; outbound packets are encoded, padded, fragmented past the
//! threshold, and written with per-link flow control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gapmesh_crypto::{Fingerprint, IdentityKeys, NoiseSessionManager};
use gapmesh_wire::{
    broadcast_fingerprint, codec, fragment, padding, Deduplicator, FragmentHeader, MessageType,
    Packet, PeerId, Reassembler,
};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Link, LinkState};
use crate::error::MeshError;
use crate::platform::{BlePlatform, DeviceRef};
use crate::rotation::{UuidRotator, CHARACTERISTIC_UUID};

/// Wall-clock source injected by the host.
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
}

/// Host wall clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Mesh transport tuning.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Our own platform device name, used to break the mutual-connect race
    /// (the lexicographically lower name dials)
    pub device_name: DeviceRef,
    /// Nickname carried in announces
    pub nickname: String,
    /// Period of the announce broadcast
    pub announce_interval: Duration,
    /// Deadline for one characteristic write confirmation
    pub write_timeout: Duration,
    /// Inactivity threshold before a link is marked stale and dropped
    pub stale_timeout: Duration,
    /// Consecutive decode errors tolerated before disconnecting a link
    pub decode_error_threshold: u32,
    /// Encoded packets above this size are fragmented
    pub fragment_threshold: usize,
    /// Advertise and scan the legacy constant service UUID too
    pub legacy_compatibility: bool,
    /// Hop budget for packets we originate
    pub initial_ttl: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            nickname: "anonymous".into(),
            announce_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(120),
            decode_error_threshold: 8,
            fragment_threshold: 512,
            legacy_compatibility: false,
            initial_ttl: gapmesh_wire::MAX_TTL,
        }
    }
}

/// Events the mesh transport posts to its owner.
#[derive(Debug)]
pub enum MeshEvent {
    /// A peer announced itself on a live link
    PeerAppeared {
        /// The peer's mesh address
        peer: PeerId,
        /// Announced nickname
        nickname: String,
    },
    /// A peer's last link dropped or it announced leaving
    PeerDisappeared {
        /// The peer's mesh address
        peer: PeerId,
    },
    /// Noise session established with a peer
    HandshakeComplete {
        /// The peer's mesh address
        peer: PeerId,
        /// Fingerprint of its static key
        fingerprint: Fingerprint,
    },
    /// Decrypted private payload addressed to us
    SecurePayload {
        /// Sending peer
        peer: PeerId,
        /// Decrypted bytes (private-payload envelope)
        plaintext: Vec<u8>,
        /// Sender's packet timestamp
        timestamp: u64,
    },
    /// Public (broadcast) chat packet
    PublicPacket {
        /// The decoded packet
        packet: Packet,
    },
    /// A peer asked for retransmission of recent traffic
    SyncRequest {
        /// The decoded packet
        packet: Packet,
    },
    /// File-transfer envelope addressed to us
    FileTransferPacket {
        /// The decoded packet
        packet: Packet,
    },
    /// A session died mid-stream; encryption must re-establish
    EncryptionFailure {
        /// The peer whose session was purged
        peer: PeerId,
    },
    /// A link's stream assembler reset
    LinkReset {
        /// Platform handle of the link
        device: DeviceRef,
    },
}

/// The BLE mesh transport.
pub struct MeshTransport {
    config: MeshConfig,
    platform: Arc<dyn BlePlatform>,
    noise: Arc<NoiseSessionManager>,
    identity: Arc<IdentityKeys>,
    dedup: Arc<Deduplicator>,
    rotator: UuidRotator,
    clock: Arc<dyn TimeSource>,
    links: DashMap<DeviceRef, Arc<Link>>,
    peers: DashMap<PeerId, DeviceRef>,
    reassembler: Mutex<Reassembler>,
    nickname: RwLock<String>,
    events: mpsc::Sender<MeshEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MeshTransport {
    /// Build a transport; the receiver carries its events.
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        noise: Arc<NoiseSessionManager>,
        identity: Arc<IdentityKeys>,
        dedup: Arc<Deduplicator>,
        clock: Arc<dyn TimeSource>,
        config: MeshConfig,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let rotator = UuidRotator::new(config.legacy_compatibility);
        let nickname = RwLock::new(config.nickname.clone());
        (
            Arc::new(Self {
                config,
                platform,
                noise,
                identity,
                dedup,
                rotator,
                clock,
                links: DashMap::new(),
                peers: DashMap::new(),
                reassembler: Mutex::new(Reassembler::new()),
                nickname,
                events,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    /// Our mesh address.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.noise.local_peer_id()
    }

    /// True when a private payload can be delivered to `peer` right now:
    /// a live link and an established Noise session.
    #[must_use]
    pub fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        self.has_link(peer) && !self.noise.handshake_required(peer)
    }

    /// True when any link to `peer` is up, whatever the session state.
    #[must_use]
    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .and_then(|device| self.links.get(device.value()).map(|l| l.state()))
            .is_some_and(|state| {
                matches!(
                    state,
                    LinkState::Connected | LinkState::Handshaking | LinkState::Ready
                )
            })
    }

    /// Peers with a live link and their announced nicknames.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<(PeerId, Option<String>)> {
        self.peers
            .iter()
            .filter_map(|entry| {
                let link = self.links.get(entry.value())?;
                matches!(
                    link.state(),
                    LinkState::Connected | LinkState::Handshaking | LinkState::Ready
                )
                .then(|| (*entry.key(), link.nickname()))
            })
            .collect()
    }

    /// Start the radio loops.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot begin advertising or accepting.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut incoming = self.platform.accept_connections().await?;

        // Peripheral side: surface inbound connections.
        let transport = Arc::clone(self);
        self.spawn(async move {
            while let Some(connection) = incoming.recv().await {
                debug!(from = %connection.from, "accepted inbound link");
                transport.adopt_connection(connection.connection).await;
            }
        });

        // Central side plus rotation: advertise, scan, dial, re-arm at every
        // transmit-set change.
        let transport = Arc::clone(self);
        self.spawn(async move {
            transport.radio_loop().await;
        });

        // Periodic announce.
        let transport = Arc::clone(self);
        self.spawn(async move {
            let mut ticker = tokio::time::interval(transport.config.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                transport.broadcast_announce().await;
            }
        });

        // Maintenance: expire handshakes, reassembly buffers, stale links.
        let transport = Arc::clone(self);
        self.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                transport.maintain().await;
            }
        });

        Ok(())
    }

    /// Stop all tasks and drop every link.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let links: Vec<Arc<Link>> = self.links.iter().map(|e| Arc::clone(e.value())).collect();
        for link in links {
            link.disconnect().await;
        }
        self.links.clear();
        self.peers.clear();
        self.platform.shutdown().await;
    }

    /// Change the announced nickname and broadcast it immediately.
    pub async fn set_nickname(&self, nickname: &str) {
        *self.nickname.write() = nickname.to_string();
        self.broadcast_announce().await;
    }

    /// Send a public chat message to the whole mesh.
    pub async fn send_public(&self, payload: Vec<u8>) {
        let packet = Packet::broadcast(
            MessageType::Message,
            self.local_peer_id(),
            self.clock.unix_millis(),
            self.config.initial_ttl,
            payload,
        );
        self.broadcast_packet(&packet, None).await;
    }

    /// Encrypt and deliver a private payload to `peer` over its link.
    ///
    /// # Errors
    ///
    /// [`MeshError::NotConnected`] without a live link, or the Noise error
    /// when no session is established (callers start a handshake first).
    pub async fn send_private(&self, peer: &PeerId, payload: &[u8]) -> Result<(), MeshError> {
        let ciphertext = self.noise.encrypt(peer, payload, Instant::now())?;
        let packet = Packet::private(
            MessageType::NoiseEncrypted,
            self.local_peer_id(),
            *peer,
            self.clock.unix_millis(),
            self.config.initial_ttl,
            ciphertext,
        );
        self.deliver_to_peer(peer, &packet).await
    }

    /// Start a Noise handshake toward a linked peer.
    ///
    /// # Errors
    ///
    /// [`MeshError::NotConnected`] without a link; crypto errors otherwise.
    pub async fn start_handshake(&self, peer: &PeerId) -> Result<(), MeshError> {
        let message = self.noise.initiate_handshake(*peer, Instant::now())?;
        if let Some(device) = self.peers.get(peer).map(|d| d.value().clone()) {
            if let Some(link) = self.links.get(&device).map(|l| Arc::clone(l.value())) {
                link.set_state(LinkState::Handshaking);
            }
        }
        let packet = Packet::private(
            MessageType::NoiseHandshake,
            self.local_peer_id(),
            *peer,
            self.clock.unix_millis(),
            self.config.initial_ttl,
            message,
        );
        self.deliver_to_peer(peer, &packet).await
    }

    /// Broadcast a signed Leave and tear everything down.
    pub async fn emergency_disconnect(&self) {
        let mut packet = Packet::broadcast(
            MessageType::Leave,
            self.local_peer_id(),
            self.clock.unix_millis(),
            0,
            Vec::new(),
        );
        self.sign(&mut packet);
        self.broadcast_packet(&packet, None).await;
        self.stop().await;
    }

    fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(future));
    }

    fn sign(&self, packet: &mut Packet) {
        let signable = codec::signable_bytes(packet);
        packet.signature = Some(self.identity.sign(&signable));
    }

    async fn radio_loop(self: &Arc<Self>) {
        loop {
            let now_ms = self.clock.unix_millis();
            let transmit = self.rotator.transmit_set(now_ms);
            let scan = self.rotator.scan_set(now_ms);
            if let Err(e) = self.platform.advertise(&transmit, CHARACTERISTIC_UUID).await {
                warn!(error = %e, "advertise failed");
            }
            let mut discoveries = match self.platform.scan(&scan).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "scan failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let rearm_in =
                Duration::from_millis(UuidRotator::next_change_in(now_ms).max(1000));
            let deadline = tokio::time::sleep(rearm_in);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    discovery = discoveries.recv() => {
                        match discovery {
                            Some(discovery) => self.on_discovery(discovery.device).await,
                            None => break,
                        }
                    }
                    () = &mut deadline => break,
                }
            }
        }
    }

    async fn on_discovery(self: &Arc<Self>, device: DeviceRef) {
        if self.links.contains_key(&device) {
            return;
        }
        // Mutual discovery would produce two crossed links; the lower
        // device name dials, the other side accepts.
        if self.config.device_name >= device {
            trace!(%device, "leaving the dial to the peer");
            return;
        }
        debug!(%device, "dialing discovered peer");
        match self.platform.connect(&device).await {
            Ok(connection) => self.adopt_connection(connection).await,
            Err(e) => debug!(%device, error = %e, "connect failed"),
        }
    }

    async fn adopt_connection(self: &Arc<Self>, connection: Box<dyn crate::platform::BleConnection>) {
        let link = Arc::new(Link::new(connection, Instant::now()));
        let device = link.device().clone();
        let notifications = match link.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(%device, error = %e, "subscribe failed");
                link.disconnect().await;
                return;
            }
        };
        self.links.insert(device.clone(), Arc::clone(&link));

        let transport = Arc::clone(self);
        let loop_link = Arc::clone(&link);
        self.spawn(async move {
            transport.link_loop(loop_link, notifications).await;
        });

        // Introduce ourselves so the peer learns our address and nickname.
        self.send_announce_on(&link).await;
    }

    async fn link_loop(self: Arc<Self>, link: Arc<Link>, mut notifications: mpsc::Receiver<Vec<u8>>) {
        while let Some(chunk) = notifications.recv().await {
            let outcome = link.assembler.lock().append(&chunk, Instant::now());
            if outcome.did_reset {
                let _ = self
                    .events
                    .send(MeshEvent::LinkReset {
                        device: link.device().clone(),
                    })
                    .await;
            }
            for frame in outcome.frames {
                self.handle_frame(&link, &frame).await;
            }
        }
        self.drop_link(&link).await;
    }

    async fn handle_frame(self: &Arc<Self>, link: &Arc<Link>, frame: &[u8]) {
        match codec::decode(frame) {
            Ok(packet) => {
                link.note_good_frame();
                link.touch(Instant::now());
                self.handle_packet(link, packet).await;
            }
            Err(e) => {
                let streak = link.note_decode_error();
                warn!(device = %link.device(), error = %e, streak, "frame dropped");
                if streak >= self.config.decode_error_threshold {
                    warn!(device = %link.device(), "decode error threshold crossed");
                    self.drop_link(link).await;
                }
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, link: &Arc<Link>, packet: Packet) {
        let our_id = self.local_peer_id();
        if packet.sender_id == our_id {
            return; // our own flood came back around
        }

        let fingerprint = match dedup_fingerprint(&packet) {
            Some(fingerprint) => fingerprint,
            None => {
                warn!("fragment with unparseable header");
                return;
            }
        };
        if !self.dedup.insert(&fingerprint) {
            trace!(%fingerprint, "duplicate dropped");
            return;
        }

        // Only wire-received packets relay. Fragments relay individually;
        // a reassembled whole never re-enters this stage, or every
        // reassembling node would re-flood it under a fresh transfer ID
        // with its TTL reset to the origin's value.
        let addressed_to_us = packet.recipient_id == Some(our_id);
        if packet.ttl > 0 && !addressed_to_us {
            let mut relayed = packet.clone();
            relayed.ttl -= 1;
            self.broadcast_packet(&relayed, Some(link.device())).await;
        }

        if !packet.is_for(&our_id) {
            return;
        }

        let packet = if packet.message_type == MessageType::Fragment {
            let completed = {
                let mut reassembler = self.reassembler.lock();
                reassembler.accept(&packet, Instant::now())
            };
            match completed {
                Ok(Some(original)) => {
                    // The same message replayed under a new transfer ID must
                    // not deliver twice; the whole carries its own fingerprint.
                    if let Some(fingerprint) = dedup_fingerprint(&original) {
                        if !self.dedup.insert(&fingerprint) {
                            trace!(%fingerprint, "reassembled duplicate dropped");
                            return;
                        }
                    }
                    original
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "fragment rejected");
                    return;
                }
            }
        } else {
            packet
        };

        self.dispatch_local(link, packet).await;
    }

    /// Deliver a packet addressed to (or broadcast past) this node. Called
    /// once per wire packet and once per reassembled whole; nothing here
    /// feeds back into the relay path.
    async fn dispatch_local(self: &Arc<Self>, link: &Arc<Link>, packet: Packet) {
        match packet.message_type {
            MessageType::Announce => self.on_announce(link, &packet).await,
            MessageType::Leave => {
                let peer = packet.sender_id;
                self.peers.remove(&peer);
                self.noise.close(&peer);
                let _ = self.events.send(MeshEvent::PeerDisappeared { peer }).await;
            }
            MessageType::NoiseHandshake => self.on_handshake(link, &packet).await,
            MessageType::NoiseEncrypted => self.on_encrypted(&packet).await,
            MessageType::Fragment => {
                // A fragment nested inside a reassembled whole is malformed.
                warn!(peer = %packet.sender_id, "nested fragment dropped");
            }
            MessageType::Message => {
                let _ = self.events.send(MeshEvent::PublicPacket { packet }).await;
            }
            MessageType::RequestSync => {
                let _ = self.events.send(MeshEvent::SyncRequest { packet }).await;
            }
            MessageType::FileTransfer => {
                let _ = self
                    .events
                    .send(MeshEvent::FileTransferPacket { packet })
                    .await;
            }
        }
    }

    async fn on_announce(self: &Arc<Self>, link: &Arc<Link>, packet: &Packet) {
        let peer = packet.sender_id;
        let nickname = String::from_utf8_lossy(&packet.payload).into_owned();
        let is_new_peer = !self.peers.contains_key(&peer);
        self.peers.insert(peer, link.device().clone());
        link.set_peer_id(peer);
        let nickname_changed = link.set_nickname(&nickname);

        if is_new_peer || nickname_changed {
            info!(%peer, %nickname, "peer announced");
            let _ = self
                .events
                .send(MeshEvent::PeerAppeared { peer, nickname })
                .await;
        }

        // Lower address initiates the handshake; the manager's tie-break
        // covers the race when both fire anyway.
        if self.noise.handshake_required(&peer) && self.local_peer_id() < peer {
            if let Err(e) = self.start_handshake(&peer).await {
                debug!(%peer, error = %e, "handshake initiation failed");
            }
        }
    }

    async fn on_handshake(self: &Arc<Self>, link: &Arc<Link>, packet: &Packet) {
        let peer = packet.sender_id;
        self.peers.insert(peer, link.device().clone());
        link.set_peer_id(peer);
        link.set_state(LinkState::Handshaking);

        match self
            .noise
            .process_handshake(peer, &packet.payload, Instant::now())
        {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let response = Packet::private(
                        MessageType::NoiseHandshake,
                        self.local_peer_id(),
                        peer,
                        self.clock.unix_millis(),
                        self.config.initial_ttl,
                        reply,
                    );
                    if let Err(e) = self.deliver_to_peer(&peer, &response).await {
                        warn!(%peer, error = %e, "handshake reply failed");
                    }
                }
                if let Some(info) = outcome.established {
                    link.set_state(LinkState::Ready);
                    let _ = self
                        .events
                        .send(MeshEvent::HandshakeComplete {
                            peer,
                            fingerprint: info.fingerprint,
                        })
                        .await;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "handshake processing failed");
                let _ = self.events.send(MeshEvent::EncryptionFailure { peer }).await;
            }
        }
    }

    async fn on_encrypted(self: &Arc<Self>, packet: &Packet) {
        let peer = packet.sender_id;
        match self.noise.decrypt(&peer, &packet.payload, Instant::now()) {
            Ok(plaintext) => {
                let _ = self
                    .events
                    .send(MeshEvent::SecurePayload {
                        peer,
                        plaintext,
                        timestamp: packet.timestamp,
                    })
                    .await;
            }
            Err(e) => {
                warn!(%peer, error = %e, "decrypt failed, session purged");
                let _ = self.events.send(MeshEvent::EncryptionFailure { peer }).await;
            }
        }
    }

    async fn broadcast_announce(&self) {
        let mut packet = Packet::broadcast(
            MessageType::Announce,
            self.local_peer_id(),
            self.clock.unix_millis(),
            self.config.initial_ttl,
            self.nickname.read().clone().into_bytes(),
        );
        self.sign(&mut packet);
        self.broadcast_packet(&packet, None).await;
    }

    async fn send_announce_on(&self, link: &Arc<Link>) {
        let mut packet = Packet::broadcast(
            MessageType::Announce,
            self.local_peer_id(),
            self.clock.unix_millis(),
            self.config.initial_ttl,
            self.nickname.read().clone().into_bytes(),
        );
        self.sign(&mut packet);
        if let Err(e) = self.transmit(&packet, link).await {
            debug!(device = %link.device(), error = %e, "announce failed");
        }
    }

    /// Write a packet to every live link except `except`.
    async fn broadcast_packet(&self, packet: &Packet, except: Option<&DeviceRef>) {
        let targets: Vec<Arc<Link>> = self
            .links
            .iter()
            .filter(|entry| Some(entry.key()) != except)
            .filter(|entry| {
                matches!(
                    entry.value().state(),
                    LinkState::Connected | LinkState::Handshaking | LinkState::Ready
                )
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for link in targets {
            if let Err(e) = self.transmit(packet, &link).await {
                debug!(device = %link.device(), error = %e, "broadcast write failed");
            }
        }
    }

    async fn deliver_to_peer(&self, peer: &PeerId, packet: &Packet) -> Result<(), MeshError> {
        let device = self
            .peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::NotConnected(peer.to_hex()))?;
        let link = self
            .links
            .get(&device)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MeshError::NotConnected(device.clone()))?;
        self.transmit(packet, &link).await
    }

    /// Encode, pad, fragment past the threshold, and write.
    ///
    /// The first transmission consumes a hop, so the wire carries
    /// `initial_ttl - 1` for packets we originate.
    async fn transmit(&self, packet: &Packet, link: &Arc<Link>) -> Result<(), MeshError> {
        let mut outgoing = packet.clone();
        if outgoing.sender_id == self.local_peer_id() && outgoing.ttl > 0 {
            outgoing.ttl -= 1;
        }
        let encoded = codec::encode(&outgoing);
        if encoded.len() > self.config.fragment_threshold {
            let mut transfer_id = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut transfer_id);
            let fragments =
                fragment::split(&outgoing, self.config.fragment_threshold, transfer_id)?;
            trace!(count = fragments.len(), "fragmenting oversized packet");
            for piece in &fragments {
                let bytes = padding::pad(&codec::encode(piece));
                link.write(&bytes, self.config.write_timeout).await?;
            }
            Ok(())
        } else {
            link.write(&padding::pad(&encoded), self.config.write_timeout)
                .await
        }
    }

    async fn drop_link(&self, link: &Arc<Link>) {
        let device = link.device().clone();
        link.disconnect().await;
        self.links.remove(&device);
        if let Some(peer) = link.peer_id() {
            let still_mapped = self
                .peers
                .get(&peer)
                .is_some_and(|entry| entry.value() == &device);
            if still_mapped {
                self.peers.remove(&peer);
                let _ = self.events.send(MeshEvent::PeerDisappeared { peer }).await;
            }
        }
        debug!(%device, "link dropped");
    }

    async fn maintain(self: &Arc<Self>) {
        let now = Instant::now();
        for peer in self.noise.expire(now) {
            debug!(%peer, "noise session expired");
        }
        self.reassembler.lock().expire(now);

        let stale: Vec<Arc<Link>> = self
            .links
            .iter()
            .filter(|entry| {
                let link = entry.value();
                link.state() == LinkState::Stale
                    || now.duration_since(link.last_activity()) > self.config.stale_timeout
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for link in stale {
            info!(device = %link.device(), "dropping stale link");
            self.drop_link(&link).await;
        }
    }
}

/// Dedup fingerprint: `hex(sender):timestamp` for broadcasts, transfer ID
/// plus index for fragments (the transfer ID alone would swallow every
/// fragment after the first). Addressed packets additionally mix in the
/// type and a payload digest, since consecutive Noise frames from one sender
/// can share a millisecond timestamp.
fn dedup_fingerprint(packet: &Packet) -> Option<String> {
    if packet.message_type == MessageType::Fragment {
        let (header, _) = FragmentHeader::parse(&packet.payload).ok()?;
        return Some(format!(
            "{}:{}",
            gapmesh_wire::fragment_fingerprint(&header.transfer_id),
            header.index
        ));
    }
    let base = broadcast_fingerprint(&packet.sender_id, packet.timestamp);
    if packet.recipient_id.is_none() {
        return Some(base);
    }
    let digest = Sha256::digest(&packet.payload);
    Some(format!(
        "{base}:{:02x}:{}",
        packet.message_type as u8,
        hex::encode(&digest[..8])
    ))
}
