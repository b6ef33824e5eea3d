//! The internet transport: gift-wrapped core packets over Nostr relays.
//!
//! Write side embeds already-encrypted core packets (§ gift wrap); read side
//! subscribes to kind-1059 events addressed to our Nostr key, unwraps, and
//! surfaces the embedded packet. Kind-20000 ephemeral events carry
//! location-channel broadcasts keyed by a geohash tag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gapmesh_wire::{codec, Packet, PeerId};
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::event::{NostrEvent, KIND_EPHEMERAL, KIND_GIFT_WRAP, KIND_NOTE};
use crate::giftwrap;
use crate::pool::{PoolEvent, RelayPool};

/// Wall-clock source injected by the host.
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
}

/// The device's Nostr identity (secp256k1 Schnorr keypair).
pub struct NostrIdentity {
    keypair: Keypair,
}

impl NostrIdentity {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        Self {
            keypair: Keypair::new(&secp, &mut rand::thread_rng()),
        }
    }

    /// Restore from a persisted secret key.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidKey`] for out-of-range bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, RelayError> {
        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| RelayError::InvalidKey(e.to_string()))?;
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &secret),
        })
    }

    /// Our x-only public key, lowercase hex.
    #[must_use]
    pub fn pubkey_hex(&self) -> String {
        hex::encode(XOnlyPublicKey::from_keypair(&self.keypair).0.serialize())
    }

    /// Secret key for unwrapping.
    #[must_use]
    pub fn secret_key(&self) -> SecretKey {
        SecretKey::from_keypair(&self.keypair)
    }

    /// Secret key bytes for the keychain.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key().secret_bytes()
    }

    /// The signing keypair.
    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

/// Events the relay transport posts to its owner.
#[derive(Debug)]
pub enum RelayEvent {
    /// An embedded core packet arrived in a gift wrap
    PacketReceived {
        /// The true sender's Nostr pubkey (hex)
        sender_nostr: String,
        /// The sender's mesh address, when the pubkey is registered
        sender_peer: Option<PeerId>,
        /// The embedded packet
        packet: Packet,
    },
    /// A location-channel broadcast arrived
    ChannelMessage {
        /// Geohash topic
        geohash: String,
        /// Sender's Nostr pubkey (hex)
        sender_nostr: String,
        /// Message body
        content: String,
    },
    /// Relay connectivity changed
    RelayStatus {
        /// How many relay sockets are up
        connected: usize,
    },
}

/// Gift-wrap transport over a relay pool.
pub struct RelayTransport {
    identity: NostrIdentity,
    pool: Arc<RelayPool>,
    clock: Arc<dyn TimeSource>,
    // peer <-> nostr key bindings, maintained from the favorites store
    peers: DashMap<PeerId, String>,
    by_nostr: DashMap<String, PeerId>,
    events: mpsc::Sender<RelayEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl RelayTransport {
    /// Build the transport; the receiver carries its events.
    #[must_use]
    pub fn new(
        identity: NostrIdentity,
        pool: Arc<RelayPool>,
        clock: Arc<dyn TimeSource>,
    ) -> (Arc<Self>, mpsc::Receiver<RelayEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                identity,
                pool,
                clock,
                peers: DashMap::new(),
                by_nostr: DashMap::new(),
                events,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    /// Our Nostr pubkey, lowercase hex.
    #[must_use]
    pub fn local_pubkey(&self) -> String {
        self.identity.pubkey_hex()
    }

    /// Start the pool and the inbound pump.
    pub async fn start(self: &Arc<Self>, mut pool_events: mpsc::Receiver<PoolEvent>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.start();
        self.pool
            .subscribe(
                "gapmesh-dm",
                serde_json::json!({
                    "kinds": [KIND_GIFT_WRAP],
                    "#p": [self.local_pubkey()],
                }),
            )
            .await;

        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = pool_events.recv().await {
                transport.handle_pool_event(event).await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop the pool and the pump.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pool.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Bind a mesh peer to its Nostr pubkey (mutual favorite).
    pub fn register_peer(&self, peer: PeerId, nostr_pubkey: &str) {
        info!(%peer, nostr = %nostr_pubkey, "peer reachable over relays");
        self.peers.insert(peer, nostr_pubkey.to_lowercase());
        self.by_nostr.insert(nostr_pubkey.to_lowercase(), peer);
    }

    /// Remove a binding (unfavorited).
    pub fn unregister_peer(&self, peer: &PeerId) {
        if let Some((_, pubkey)) = self.peers.remove(peer) {
            self.by_nostr.remove(&pubkey);
        }
    }

    /// Forget every peer binding.
    pub fn clear_peers(&self) {
        self.peers.clear();
        self.by_nostr.clear();
    }

    /// A peer is reachable when we hold its Nostr key and any relay is up.
    #[must_use]
    pub fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer) && self.pool.connected_count() > 0
    }

    /// Gift-wrap and publish an encoded core packet to `peer`.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownPeer`] without a binding, [`RelayError::NoRelay`]
    /// with no socket up, or a sealing failure.
    pub async fn send_packet(&self, peer: &PeerId, packet: &Packet) -> Result<(), RelayError> {
        let recipient = self
            .peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::UnknownPeer)?;
        if self.pool.connected_count() == 0 {
            return Err(RelayError::NoRelay);
        }
        let encoded = codec::encode(packet);
        let gift = giftwrap::wrap_packet(
            &encoded,
            self.identity.keypair(),
            &recipient,
            self.clock.unix_millis() / 1000,
        )?;
        debug!(%peer, id = %gift.id, "publishing gift-wrapped packet");
        self.pool.publish(&gift).await;
        Ok(())
    }

    /// Broadcast to a location channel as a kind-20000 ephemeral event.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoRelay`] with no socket up, or a signing failure.
    pub async fn send_channel_message(
        &self,
        geohash: &str,
        content: &str,
    ) -> Result<(), RelayError> {
        if self.pool.connected_count() == 0 {
            return Err(RelayError::NoRelay);
        }
        let event = NostrEvent::signed(
            self.identity.keypair(),
            self.clock.unix_millis() / 1000,
            KIND_EPHEMERAL,
            vec![vec!["g".into(), geohash.to_string()]],
            content.to_string(),
        )?;
        self.pool.publish(&event).await;
        Ok(())
    }

    /// Subscribe to a location channel's ephemeral events and notes.
    pub async fn join_channel(&self, geohash: &str) {
        self.pool
            .subscribe(
                &format!("gapmesh-geo-{geohash}"),
                serde_json::json!({
                    "kinds": [KIND_EPHEMERAL, KIND_NOTE],
                    "#g": [geohash],
                }),
            )
            .await;
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::RelayConnected { url } => {
                debug!(%url, "relay up");
                let _ = self
                    .events
                    .send(RelayEvent::RelayStatus {
                        connected: self.pool.connected_count(),
                    })
                    .await;
            }
            PoolEvent::RelayDisconnected { url } => {
                debug!(%url, "relay down");
                let _ = self
                    .events
                    .send(RelayEvent::RelayStatus {
                        connected: self.pool.connected_count(),
                    })
                    .await;
            }
            PoolEvent::EventReceived { event, .. } => self.handle_event(event).await,
        }
    }

    async fn handle_event(&self, event: NostrEvent) {
        match event.kind {
            KIND_GIFT_WRAP => match giftwrap::unwrap_packet(&event, &self.identity.secret_key()) {
                Ok(unwrapped) => match codec::decode(&unwrapped.packet) {
                    Ok(packet) => {
                        let sender_peer = self
                            .by_nostr
                            .get(&unwrapped.sender_pubkey)
                            .map(|entry| *entry.value());
                        let _ = self
                            .events
                            .send(RelayEvent::PacketReceived {
                                sender_nostr: unwrapped.sender_pubkey,
                                sender_peer,
                                packet,
                            })
                            .await;
                    }
                    Err(e) => warn!(error = %e, "embedded packet undecodable"),
                },
                Err(e) => debug!(error = %e, "gift wrap not for us or malformed"),
            },
            KIND_EPHEMERAL | KIND_NOTE => {
                if event.verify().is_err() {
                    warn!(id = %event.id, "channel event with bad signature");
                    return;
                }
                if let Some(geohash) = event.tag_value("g") {
                    let _ = self
                        .events
                        .send(RelayEvent::ChannelMessage {
                            geohash: geohash.to_string(),
                            sender_nostr: event.pubkey.clone(),
                            content: event.content.clone(),
                        })
                        .await;
                }
            }
            other => debug!(kind = other, "unhandled event kind"),
        }
    }
}
