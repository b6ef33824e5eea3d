//! Long-term identity keys.
//!
//! A device identity is two keypairs: a static X25519 keypair used by the
//! Noise handshake (its public key also yields the mesh [`PeerId`]) and an
//! Ed25519 keypair for packet signatures. Key material is zeroized on drop
//! and persisted only through the injected keychain at the node layer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use gapmesh_wire::PeerId;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::noise::NoiseKeypair;

/// User-visible stable identity: hex SHA-256 of a static public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a static public key.
    #[must_use]
    pub fn of(static_public_key: &[u8]) -> Self {
        let digest = Sha256::digest(static_public_key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({}…)", &self.to_hex()[..16])
    }
}

/// The device's long-term keys.
pub struct IdentityKeys {
    noise: NoiseKeypair,
    signing: SigningKey,
}

impl IdentityKeys {
    /// Generate a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Snow`] when keypair generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        use rand_core::OsRng;

        let noise = NoiseKeypair::generate()?;
        let signing = SigningKey::generate(&mut OsRng);
        Ok(Self { noise, signing })
    }

    /// Restore an identity from persisted key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] when either blob is not 32 bytes.
    pub fn from_bytes(static_key: &[u8], signing_key: &[u8]) -> Result<Self, CryptoError> {
        let static_key: [u8; 32] = static_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("static key must be 32 bytes".into()))?;
        let signing_key: [u8; 32] = signing_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signing key must be 32 bytes".into()))?;
        let noise = NoiseKeypair::from_private(static_key)?;
        let signing = SigningKey::from_bytes(&signing_key);
        Ok(Self { noise, signing })
    }

    /// The static X25519 keypair used by Noise handshakes.
    #[must_use]
    pub fn noise_keypair(&self) -> &NoiseKeypair {
        &self.noise
    }

    /// This device's mesh address: first 8 bytes of the static public key.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self.noise.public_key())
    }

    /// This device's stable fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.noise.public_key())
    }

    /// Ed25519 public key bytes for announce payloads.
    #[must_use]
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign bytes with the identity's Ed25519 key.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    /// Serialized private key blobs `(static, signing)` for the keychain.
    #[must_use]
    pub fn to_bytes(&self) -> ([u8; 32], [u8; 32]) {
        let mut static_key = [0u8; 32];
        static_key.copy_from_slice(self.noise.private_key());
        (static_key, self.signing.to_bytes())
    }

    /// Destroy key material in place. The identity is unusable afterwards;
    /// callers drop it immediately.
    pub fn wipe(&mut self) {
        self.noise.wipe();
        self.signing = SigningKey::from_bytes(&[0u8; 32]);
    }
}

/// Verify an Ed25519 signature against a public key.
///
/// # Errors
///
/// Returns [`CryptoError::BadSignature`] on any mismatch and
/// [`CryptoError::InvalidKey`] for a malformed public key.
pub fn verify_signature(
    public_key: &[u8; 32],
    data: &[u8],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_bytes(signature);
    key.verify(data, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_key_prefix() {
        let identity = IdentityKeys::generate().unwrap();
        let id = identity.peer_id();
        assert_eq!(
            id.as_bytes(),
            &identity.noise_keypair().public_key()[..8]
        );
    }

    #[test]
    fn fingerprint_is_stable() {
        let identity = IdentityKeys::generate().unwrap();
        assert_eq!(identity.fingerprint(), identity.fingerprint());
        assert_eq!(identity.fingerprint().to_hex().len(), 64);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let identity = IdentityKeys::generate().unwrap();
        let (static_key, signing_key) = identity.to_bytes();
        let restored = IdentityKeys::from_bytes(&static_key, &signing_key).unwrap();
        assert_eq!(identity.peer_id(), restored.peer_id());
        assert_eq!(identity.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn sign_and_verify() {
        let identity = IdentityKeys::generate().unwrap();
        let signature = identity.sign(b"announce");
        verify_signature(&identity.verifying_key(), b"announce", &signature).unwrap();
        assert!(verify_signature(&identity.verifying_key(), b"tampered", &signature).is_err());
    }

    #[test]
    fn distinct_identities_distinct_ids() {
        let a = IdentityKeys::generate().unwrap();
        let b = IdentityKeys::generate().unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
