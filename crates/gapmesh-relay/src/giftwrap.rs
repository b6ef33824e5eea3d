//! NIP-17/NIP-59 gift wrapping of embedded core packets.
//!
//! Write path: the already-Noise-encrypted packet bytes ride as
//! `bitchat1:<base64>` in an unsigned kind-14 rumor; the rumor is sealed
//! (kind 13) to the recipient under the sender's key, and the seal is
//! wrapped (kind 1059) under a single-use ephemeral key so relays cannot
//! pair sender and recipient. Seal and wrap timestamps are smeared up to
//! two days into the past.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::error::RelayError;
use crate::event::{NostrEvent, KIND_GIFT_WRAP, KIND_RUMOR, KIND_SEAL};
use crate::nip44;

/// Literal prefix marking an embedded core packet inside a rumor.
pub const PACKET_MARKER: &str = "bitchat1:";

/// Maximum backdating applied to seal and wrap timestamps.
const TIMESTAMP_SMEAR_SECS: u64 = 2 * 24 * 3600;

fn xonly_from_hex(pubkey: &str) -> Result<XOnlyPublicKey, RelayError> {
    let bytes = hex::decode(pubkey).map_err(|e| RelayError::InvalidKey(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| RelayError::InvalidKey(e.to_string()))
}

fn smear(created_at: u64) -> u64 {
    created_at.saturating_sub(rand::thread_rng().gen_range(0..TIMESTAMP_SMEAR_SECS))
}

/// What unwrapping a gift produced.
#[derive(Debug)]
pub struct Unwrapped {
    /// The true sender's x-only pubkey, lowercase hex
    pub sender_pubkey: String,
    /// The embedded core packet bytes
    pub packet: Vec<u8>,
    /// The rumor's honest timestamp (seconds)
    pub created_at: u64,
}

/// Gift-wrap encoded packet bytes for `recipient`.
///
/// # Errors
///
/// Key or sealing failures from the underlying layers.
pub fn wrap_packet(
    packet_bytes: &[u8],
    sender: &Keypair,
    recipient_pubkey: &str,
    created_at_secs: u64,
) -> Result<NostrEvent, RelayError> {
    let secp = Secp256k1::new();
    let recipient = xonly_from_hex(recipient_pubkey)?;
    let sender_secret = SecretKey::from_keypair(sender);
    let (sender_xonly, _) = XOnlyPublicKey::from_keypair(sender);

    // Kind 14 rumor: unsigned, honest timestamp, embedded packet.
    let rumor = NostrEvent::unsigned(
        &hex::encode(sender_xonly.serialize()),
        created_at_secs,
        KIND_RUMOR,
        vec![vec!["p".into(), recipient_pubkey.to_string()]],
        format!("{PACKET_MARKER}{}", BASE64.encode(packet_bytes)),
    )?;
    let rumor_json =
        serde_json::to_string(&rumor).map_err(|e| RelayError::EventFormat(e.to_string()))?;

    // Kind 13 seal: rumor sealed to the recipient under our long-term key.
    let seal_key = nip44::conversation_key(&sender_secret, &recipient)?;
    let seal = NostrEvent::signed(
        sender,
        smear(created_at_secs),
        KIND_SEAL,
        Vec::new(),
        nip44::encrypt(&seal_key, rumor_json.as_bytes())?,
    )?;
    let seal_json =
        serde_json::to_string(&seal).map_err(|e| RelayError::EventFormat(e.to_string()))?;

    // Kind 1059 wrap under a throwaway key; only the p tag routes it.
    let ephemeral = Keypair::new(&secp, &mut rand::thread_rng());
    let ephemeral_secret = SecretKey::from_keypair(&ephemeral);
    let wrap_key = nip44::conversation_key(&ephemeral_secret, &recipient)?;
    NostrEvent::signed(
        &ephemeral,
        smear(created_at_secs),
        KIND_GIFT_WRAP,
        vec![vec!["p".into(), recipient_pubkey.to_string()]],
        nip44::encrypt(&wrap_key, seal_json.as_bytes())?,
    )
}

/// Unwrap a kind-1059 event addressed to us.
///
/// # Errors
///
/// Fails on any layer that does not verify, unseal, or carry the packet
/// marker.
pub fn unwrap_packet(gift: &NostrEvent, our_secret: &SecretKey) -> Result<Unwrapped, RelayError> {
    if gift.kind != KIND_GIFT_WRAP {
        return Err(RelayError::EventFormat(format!(
            "expected kind {KIND_GIFT_WRAP}, got {}",
            gift.kind
        )));
    }
    gift.verify()?;

    // Peel the wrap with the ephemeral sender's pubkey.
    let wrap_sender = xonly_from_hex(&gift.pubkey)?;
    let wrap_key = nip44::conversation_key(our_secret, &wrap_sender)?;
    let seal_json = nip44::decrypt(&wrap_key, &gift.content)?;
    let seal: NostrEvent = serde_json::from_slice(&seal_json)
        .map_err(|e| RelayError::EventFormat(e.to_string()))?;
    if seal.kind != KIND_SEAL {
        return Err(RelayError::EventFormat("wrap did not contain a seal".into()));
    }
    seal.verify()?;

    // Peel the seal with the true sender's pubkey.
    let seal_sender = xonly_from_hex(&seal.pubkey)?;
    let seal_key = nip44::conversation_key(our_secret, &seal_sender)?;
    let rumor_json = nip44::decrypt(&seal_key, &seal.content)?;
    let rumor: NostrEvent = serde_json::from_slice(&rumor_json)
        .map_err(|e| RelayError::EventFormat(e.to_string()))?;
    if rumor.kind != KIND_RUMOR {
        return Err(RelayError::EventFormat("seal did not contain a rumor".into()));
    }
    // The rumor author must be the seal author, or the sender is spoofed.
    if rumor.pubkey != seal.pubkey {
        return Err(RelayError::EventFormat("rumor author mismatch".into()));
    }

    let encoded = rumor
        .content
        .strip_prefix(PACKET_MARKER)
        .ok_or(RelayError::NoEmbeddedPacket)?;
    let packet = BASE64
        .decode(encoded)
        .map_err(|_| RelayError::NoEmbeddedPacket)?;
    Ok(Unwrapped {
        sender_pubkey: seal.pubkey.clone(),
        packet,
        created_at: rumor.created_at,
    })
}
