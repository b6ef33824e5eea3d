//! Bounded seen-ID set for flood deduplication.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::packet::PeerId;

/// Default capacity of the seen set.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Fingerprint of a broadcast packet: `hex(senderID):timestamp`.
#[must_use]
pub fn broadcast_fingerprint(sender: &PeerId, timestamp: u64) -> String {
    format!("{}:{timestamp}", sender.to_hex())
}

/// Fingerprint of a fragment: the hex transfer ID.
#[must_use]
pub fn fragment_fingerprint(transfer_id: &[u8; 16]) -> String {
    hex::encode(transfer_id)
}

/// Thread-safe seen-ID set with LRU eviction.
///
/// Eviction begins only after `capacity` distinct fingerprints have been
/// inserted; until then every inserted fingerprint stays visible.
pub struct Deduplicator {
    seen: Mutex<LruCache<String, ()>>,
}

impl Deduplicator {
    /// Create a deduplicator with the given capacity (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record a fingerprint. Returns `true` iff it was not already present.
    pub fn insert(&self, fingerprint: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(fingerprint).is_some() {
            false
        } else {
            seen.put(fingerprint.to_owned(), ());
            true
        }
    }

    /// True when the fingerprint is currently tracked. Does not refresh LRU order.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.lock().contains(fingerprint)
    }

    /// Number of tracked fingerprints.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
