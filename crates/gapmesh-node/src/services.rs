//! Injected host services.
//!
//! The core owns no storage, wall clock, entropy source, or notification
//! surface of its own; the host provides all four with explicit init and
//! teardown. In-memory implementations live here for tests and for hosts
//! that want ephemeral nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngCore;

/// Keychain slot for the static X25519 identity key.
pub const KEY_STATIC_IDENTITY: &str = "identity/static";

/// Keychain slot for the Ed25519 signing key.
pub const KEY_SIGNING_IDENTITY: &str = "identity/signing";

/// Keychain slot for the serialized favorites list.
pub const KEY_FAVORITES: &str = "favorites/v1";

/// Opaque secure blob store.
pub trait Keychain: Send + Sync + 'static {
    /// Read a blob.
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    /// Write a blob.
    fn set(&self, key: &str, value: &[u8]);
    /// Remove a blob.
    fn delete(&self, key: &str);
    /// Destroy everything. Used by panic wipe.
    fn wipe_all(&self);
}

/// Wall and monotonic clock.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
    /// Monotonic instant for timeouts and ordering.
    fn monotonic(&self) -> Instant;
}

/// Cryptographically strong randomness.
pub trait Random: Send + Sync + 'static {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);
}

/// User-visible notification surface.
pub trait Notifier: Send + Sync + 'static {
    /// Present a notification.
    fn present(&self, title: &str, body: &str, payload: &str);
}

/// The full set of injected services.
#[derive(Clone)]
pub struct Services {
    /// Secure blob store
    pub keychain: Arc<dyn Keychain>,
    /// Clocks
    pub clock: Arc<dyn Clock>,
    /// Entropy
    pub random: Arc<dyn Random>,
    /// Notifications
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Ephemeral in-memory services, suitable for tests.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            keychain: Arc::new(MemoryKeychain::default()),
            clock: Arc::new(SystemClock),
            random: Arc::new(OsRandom),
            notifier: Arc::new(NullNotifier),
        }
    }
}

/// Adapter exposing the injected clock to the transport crates.
pub struct ClockAdapter(pub Arc<dyn Clock>);

impl gapmesh_mesh::TimeSource for ClockAdapter {
    fn unix_millis(&self) -> u64 {
        self.0.unix_millis()
    }
}

impl gapmesh_relay::TimeSource for ClockAdapter {
    fn unix_millis(&self) -> u64 {
        self.0.unix_millis()
    }
}

/// Volatile keychain.
#[derive(Default)]
pub struct MemoryKeychain {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl Keychain for MemoryKeychain {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &[u8]) {
        self.blobs.lock().insert(key.to_string(), value.to_vec());
    }

    fn delete(&self, key: &str) {
        self.blobs.lock().remove(key);
    }

    fn wipe_all(&self) {
        self.blobs.lock().clear();
    }
}

/// Host wall and monotonic clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Operating-system entropy.
pub struct OsRandom;

impl Random for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

/// Notifier that drops everything; hosts without a notification surface.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn present(&self, _title: &str, _body: &str, _payload: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_keychain_crud() {
        let keychain = MemoryKeychain::default();
        assert!(keychain.get("identity/static").is_none());
        keychain.set("identity/static", b"key material");
        assert_eq!(keychain.get("identity/static").unwrap(), b"key material");
        keychain.delete("identity/static");
        assert!(keychain.get("identity/static").is_none());
    }

    #[test]
    fn wipe_all_destroys_everything() {
        let keychain = MemoryKeychain::default();
        keychain.set(KEY_STATIC_IDENTITY, b"a");
        keychain.set(KEY_SIGNING_IDENTITY, b"b");
        keychain.set(KEY_FAVORITES, b"c");
        keychain.wipe_all();
        assert!(keychain.get(KEY_STATIC_IDENTITY).is_none());
        assert!(keychain.get(KEY_SIGNING_IDENTITY).is_none());
        assert!(keychain.get(KEY_FAVORITES).is_none());
    }
}
