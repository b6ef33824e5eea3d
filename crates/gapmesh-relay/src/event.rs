//! Nostr event model: ids, Schnorr signatures, and the kinds gapmesh uses.

use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Unsigned inner private message ("rumor").
pub const KIND_RUMOR: u32 = 14;

/// Seal: rumor encrypted to the recipient under the sender's key.
pub const KIND_SEAL: u32 = 13;

/// Gift wrap: seal encrypted under a throwaway key.
pub const KIND_GIFT_WRAP: u32 = 1059;

/// Ephemeral location-channel broadcast.
pub const KIND_EPHEMERAL: u32 = 20000;

/// Plain note, used with a geohash topic tag.
pub const KIND_NOTE: u32 = 1;

/// A Nostr event as it travels to and from relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrEvent {
    /// Lowercase hex SHA-256 of the canonical serialization
    pub id: String,
    /// Author x-only public key, lowercase hex
    pub pubkey: String,
    /// Seconds since the Unix epoch
    pub created_at: u64,
    /// Event kind
    pub kind: u32,
    /// Tag lists, first element is the tag name
    pub tags: Vec<Vec<String>>,
    /// Content, format depends on kind
    pub content: String,
    /// Schnorr signature over the id, lowercase hex; empty for rumors
    pub sig: String,
}

impl NostrEvent {
    /// Canonical id preimage: `[0, pubkey, created_at, kind, tags, content]`.
    fn id_preimage(&self) -> Result<Vec<u8>, RelayError> {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        serde_json::to_vec(&canonical).map_err(|e| RelayError::EventFormat(e.to_string()))
    }

    /// Compute the event id from the current fields.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::EventFormat`] on serialization failure.
    pub fn compute_id(&self) -> Result<String, RelayError> {
        Ok(hex::encode(Sha256::digest(self.id_preimage()?)))
    }

    /// Build an unsigned event (a rumor keeps an empty `sig` forever).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::EventFormat`] on serialization failure.
    pub fn unsigned(
        pubkey: &str,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Self, RelayError> {
        let mut event = Self {
            id: String::new(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        };
        event.id = event.compute_id()?;
        Ok(event)
    }

    /// Build and Schnorr-sign an event with `keypair`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::EventFormat`] on serialization failure.
    pub fn signed(
        keypair: &Keypair,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Self, RelayError> {
        let secp = Secp256k1::new();
        let (xonly, _) = XOnlyPublicKey::from_keypair(keypair);
        let mut event = Self::unsigned(&hex::encode(xonly.serialize()), created_at, kind, tags, content)?;
        let digest: [u8; 32] = Sha256::digest(event.id_preimage()?).into();
        let message = Message::from_digest(digest);
        let signature = secp.sign_schnorr(&message, keypair);
        event.sig = hex::encode(signature.serialize());
        Ok(event)
    }

    /// Verify the id and signature.
    ///
    /// # Errors
    ///
    /// [`RelayError::EventFormat`] for a wrong id or malformed fields,
    /// [`RelayError::BadSignature`] for a failed Schnorr check.
    pub fn verify(&self) -> Result<(), RelayError> {
        let expected = self.compute_id()?;
        if expected != self.id {
            return Err(RelayError::EventFormat("id mismatch".into()));
        }
        let secp = Secp256k1::verification_only();
        let pubkey_bytes =
            hex::decode(&self.pubkey).map_err(|e| RelayError::InvalidKey(e.to_string()))?;
        let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| RelayError::InvalidKey(e.to_string()))?;
        let sig_bytes =
            hex::decode(&self.sig).map_err(|_| RelayError::BadSignature)?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| RelayError::BadSignature)?;
        let digest: [u8; 32] = Sha256::digest(self.id_preimage()?).into();
        let message = Message::from_digest(digest);
        secp.verify_schnorr(&signature, &message, &xonly)
            .map_err(|_| RelayError::BadSignature)
    }

    /// First value of a tag, e.g. the pubkey of a `p` tag.
    #[must_use]
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}
