//! Favorites: local assertions that a peer matters, and the mutual links
//! that open the internet transport.
//!
//! Records are keyed by the peer's static public key and persisted as one
//! serialized blob in the injected keychain. A peer becomes eligible for
//! relay fallback only when the favorite is mutual and it has offered a
//! Nostr pubkey.

use std::collections::HashMap;
use std::sync::Arc;

use gapmesh_wire::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::services::{Keychain, KEY_FAVORITES};

/// One favorites record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteRecord {
    /// The peer's static public key
    pub peer_public_key: Vec<u8>,
    /// Last known nickname
    pub nickname: Option<String>,
    /// We favorite them
    pub we_favorite: bool,
    /// They told us they favorite us
    pub they_favorite: bool,
    /// Relay identity they offered when favoriting us
    pub nostr_pubkey: Option<String>,
    /// Wall-clock last sighting, milliseconds
    pub last_seen: u64,
}

impl FavoriteRecord {
    /// Mutual favorites may use the internet transport for each other.
    #[must_use]
    pub fn is_mutual(&self) -> bool {
        self.we_favorite && self.they_favorite
    }
}

/// Reachability-relevant change produced by a favorites update.
#[derive(Debug, PartialEq, Eq)]
pub enum FavoritesChange {
    /// The peer just became mutual with a known relay identity
    BecameReachable {
        /// The peer
        peer: PeerId,
        /// Its relay pubkey
        nostr_pubkey: String,
    },
    /// The peer stopped being mutual (or lost its relay identity)
    BecameUnreachable {
        /// The peer
        peer: PeerId,
    },
    /// Nothing reachability-relevant changed
    None,
}

/// The favorites store.
pub struct FavoritesStore {
    keychain: Arc<dyn Keychain>,
    records: Mutex<HashMap<PeerId, FavoriteRecord>>,
}

impl FavoritesStore {
    /// Load the store from the keychain blob, tolerating absence and rot.
    #[must_use]
    pub fn load(keychain: Arc<dyn Keychain>) -> Self {
        let records = keychain
            .get(KEY_FAVORITES)
            .and_then(|blob| match serde_json::from_slice::<Vec<FavoriteRecord>>(&blob) {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!(error = %e, "favorites blob unreadable, starting empty");
                    None
                }
            })
            .unwrap_or_default()
            .into_iter()
            .filter(|record| record.peer_public_key.len() >= gapmesh_wire::PEER_ID_SIZE)
            .map(|record| (PeerId::from_public_key(&record.peer_public_key), record))
            .collect();
        Self {
            keychain,
            records: Mutex::new(records),
        }
    }

    fn persist(&self, records: &HashMap<PeerId, FavoriteRecord>) {
        let list: Vec<&FavoriteRecord> = records.values().collect();
        match serde_json::to_vec(&list) {
            Ok(blob) => self.keychain.set(KEY_FAVORITES, &blob),
            Err(e) => warn!(error = %e, "favorites not persisted"),
        }
    }

    /// Set or clear our own favorite assertion for a peer.
    pub fn set_favorite(
        &self,
        public_key: &[u8],
        nickname: Option<String>,
        favorite: bool,
        now_ms: u64,
    ) -> FavoritesChange {
        let peer = PeerId::from_public_key(public_key);
        let mut records = self.records.lock();
        let record = records.entry(peer).or_insert_with(|| FavoriteRecord {
            peer_public_key: public_key.to_vec(),
            nickname: None,
            we_favorite: false,
            they_favorite: false,
            nostr_pubkey: None,
            last_seen: now_ms,
        });
        let was_mutual = record.is_mutual() && record.nostr_pubkey.is_some();
        record.we_favorite = favorite;
        if nickname.is_some() {
            record.nickname = nickname;
        }
        record.last_seen = now_ms;
        let now_mutual = record.is_mutual() && record.nostr_pubkey.is_some();
        let change = transition(peer, was_mutual, now_mutual, record.nostr_pubkey.clone());
        self.persist(&records);
        change
    }

    /// Record a favorite-notification from the peer itself.
    pub fn note_peer_assertion(
        &self,
        public_key: &[u8],
        they_favorite: bool,
        nostr_pubkey: Option<String>,
        now_ms: u64,
    ) -> FavoritesChange {
        let peer = PeerId::from_public_key(public_key);
        debug!(%peer, they_favorite, "favorite notification");
        let mut records = self.records.lock();
        let record = records.entry(peer).or_insert_with(|| FavoriteRecord {
            peer_public_key: public_key.to_vec(),
            nickname: None,
            we_favorite: false,
            they_favorite: false,
            nostr_pubkey: None,
            last_seen: now_ms,
        });
        let was_mutual = record.is_mutual() && record.nostr_pubkey.is_some();
        record.they_favorite = they_favorite;
        if nostr_pubkey.is_some() {
            record.nostr_pubkey = nostr_pubkey;
        }
        record.last_seen = now_ms;
        let now_mutual = record.is_mutual() && record.nostr_pubkey.is_some();
        let change = transition(peer, was_mutual, now_mutual, record.nostr_pubkey.clone());
        self.persist(&records);
        change
    }

    /// Update a peer's nickname and sighting time.
    pub fn note_seen(&self, peer: &PeerId, nickname: Option<&str>, now_ms: u64) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(peer) {
            if let Some(nickname) = nickname {
                record.nickname = Some(nickname.to_string());
            }
            record.last_seen = now_ms;
            self.persist(&records);
        }
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<FavoriteRecord> {
        self.records.lock().get(peer).cloned()
    }

    /// Every mutual favorite with a relay identity.
    #[must_use]
    pub fn relay_reachable(&self) -> Vec<(PeerId, String)> {
        self.records
            .lock()
            .iter()
            .filter(|(_, record)| record.is_mutual())
            .filter_map(|(peer, record)| {
                record.nostr_pubkey.clone().map(|pubkey| (*peer, pubkey))
            })
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Destroy all records and the persisted blob (panic wipe).
    pub fn wipe(&self) {
        self.records.lock().clear();
        self.keychain.delete(KEY_FAVORITES);
    }
}

fn transition(
    peer: PeerId,
    was_mutual: bool,
    now_mutual: bool,
    nostr_pubkey: Option<String>,
) -> FavoritesChange {
    match (was_mutual, now_mutual) {
        (false, true) => FavoritesChange::BecameReachable {
            peer,
            nostr_pubkey: nostr_pubkey.unwrap_or_default(),
        },
        (true, false) => FavoritesChange::BecameUnreachable { peer },
        _ => FavoritesChange::None,
    }
}
