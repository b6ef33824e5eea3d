//! NIP-44 v2 payload sealing.
//!
//! Conversation key: HKDF-SHA256-extract with salt `nip44-v2` over the
//! secp256k1 ECDH x-coordinate. Each payload gets a fresh 24-byte nonce; the
//! message key is HKDF-expanded from the conversation key and nonce, and the
//! body is XChaCha20-Poly1305. The wire form is
//! `base64(version 0x02 | nonce | ciphertext)`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};
use sha2::Sha256;

use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// Version byte of the payload format.
const VERSION: u8 = 0x02;

/// Nonce length for XChaCha20-Poly1305.
const NONCE_LEN: usize = 24;

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HKDF-SHA256 extract.
fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    hmac_sha256(salt, ikm)
}

/// Single-block HKDF-SHA256 expand (32 bytes of output material).
fn hkdf_expand(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(info.len() + 1);
    data.extend_from_slice(info);
    data.push(0x01);
    hmac_sha256(prk, &data)
}

/// Derive the symmetric conversation key between our secret key and a peer's
/// x-only public key. Both directions derive the same key.
///
/// # Errors
///
/// Returns [`RelayError::InvalidKey`] when the public key is off-curve.
pub fn conversation_key(
    secret: &SecretKey,
    peer_xonly: &XOnlyPublicKey,
) -> Result<[u8; 32], RelayError> {
    let peer = PublicKey::from_x_only_public_key(*peer_xonly, secp256k1::Parity::Even);
    let point = secp256k1::ecdh::shared_secret_point(&peer, secret);
    // x-coordinate only, per NIP-44.
    Ok(hkdf_extract(b"nip44-v2", &point[..32]))
}

/// Seal a plaintext under a conversation key.
///
/// # Errors
///
/// Returns [`RelayError::Seal`] when the AEAD refuses.
pub fn encrypt(conversation_key: &[u8; 32], plaintext: &[u8]) -> Result<String, RelayError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let message_key = hkdf_expand(conversation_key, &nonce);
    let cipher = XChaCha20Poly1305::new((&message_key).into());
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| RelayError::Seal("encryption failed".into()))?;

    let mut payload = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

/// Open a sealed payload.
///
/// # Errors
///
/// Returns [`RelayError::Seal`] for a malformed payload, unknown version, or
/// failed authentication.
pub fn decrypt(conversation_key: &[u8; 32], payload: &str) -> Result<Vec<u8>, RelayError> {
    let raw = BASE64
        .decode(payload)
        .map_err(|_| RelayError::Seal("payload is not base64".into()))?;
    if raw.len() < 1 + NONCE_LEN + 16 {
        return Err(RelayError::Seal("payload too short".into()));
    }
    if raw[0] != VERSION {
        return Err(RelayError::Seal(format!("unknown version {}", raw[0])));
    }
    let nonce = &raw[1..1 + NONCE_LEN];
    let ciphertext = &raw[1 + NONCE_LEN..];
    let message_key = hkdf_expand(conversation_key, nonce);
    let cipher = XChaCha20Poly1305::new((&message_key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| RelayError::Seal("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Keypair, Secp256k1};

    fn party() -> (SecretKey, XOnlyPublicKey) {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        (
            SecretKey::from_keypair(&keypair),
            XOnlyPublicKey::from_keypair(&keypair).0,
        )
    }

    #[test]
    fn both_directions_derive_one_key() {
        let (alice_secret, alice_public) = party();
        let (bob_secret, bob_public) = party();
        let from_alice = conversation_key(&alice_secret, &bob_public).unwrap();
        let from_bob = conversation_key(&bob_secret, &alice_public).unwrap();
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn seal_roundtrip() {
        let (alice_secret, _) = party();
        let (_, bob_public) = party();
        let key = conversation_key(&alice_secret, &bob_public).unwrap();
        let sealed = encrypt(&key, b"the quick brown fox").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn tampering_detected() {
        let (alice_secret, _) = party();
        let (_, bob_public) = party();
        let key = conversation_key(&alice_secret, &bob_public).unwrap();
        let sealed = encrypt(&key, b"intact").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 1;
        let forged = BASE64.encode(raw);
        assert!(decrypt(&key, &forged).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (alice_secret, _) = party();
        let (_, bob_public) = party();
        let (carol_secret, _) = party();
        let key = conversation_key(&alice_secret, &bob_public).unwrap();
        let other = conversation_key(&carol_secret, &bob_public).unwrap();
        let sealed = encrypt(&key, b"secret").unwrap();
        assert!(decrypt(&other, &sealed).is_err());
    }
}
