//! Packet types for the gapmesh wire protocol.
//!
//! A [`Packet`] is the unit that crosses a wire, on any transport. All
//! multi-byte fields are big-endian (network byte order).

use crate::error::WireError;

/// Size of a peer identifier in bytes.
pub const PEER_ID_SIZE: usize = 8;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Header size for version 1 packets (through the 2-byte payload length).
pub const HEADER_SIZE_V1: usize = 14;

/// Header size for version 2 packets (through the 4-byte payload length).
pub const HEADER_SIZE_V2: usize = 16;

/// Maximum TTL a packet may carry.
pub const MAX_TTL: u8 = 7;

/// Mesh routing address: the first 8 bytes of a peer's static public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Broadcast sentinel (all 0xFF) used where an address slot must be filled.
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive from a static public key: first 8 bytes.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&public_key[..PEER_ID_SIZE]);
        Self(id)
    }

    /// Raw bytes of the identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering, the canonical string form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::MissingSection("peer id hex"))?;
        if bytes.len() != PEER_ID_SIZE {
            return Err(WireError::MissingSection("peer id length"));
        }
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

/// Message types carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Nickname/identity broadcast
    Announce = 0x01,
    /// Public chat message
    Message = 0x02,
    /// Graceful departure
    Leave = 0x03,
    /// Noise XX handshake message
    NoiseHandshake = 0x10,
    /// Noise transport ciphertext
    NoiseEncrypted = 0x11,
    /// Piece of an oversized packet
    Fragment = 0x20,
    /// Request retransmission of recent traffic
    RequestSync = 0x21,
    /// File transfer envelope
    FileTransfer = 0x22,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::Message),
            0x03 => Ok(Self::Leave),
            0x10 => Ok(Self::NoiseHandshake),
            0x11 => Ok(Self::NoiseEncrypted),
            0x20 => Ok(Self::Fragment),
            0x21 => Ok(Self::RequestSync),
            0x22 => Ok(Self::FileTransfer),
            other => Err(WireError::InvalidMessageType(other)),
        }
    }
}

/// Packet flags bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Recipient ID section present
    pub const HAS_RECIPIENT: u8 = 0b0000_0001;
    /// Signature section present
    pub const HAS_SIGNATURE: u8 = 0b0000_0010;
    /// Payload is zlib-compressed (set by the codec, not by callers)
    pub const IS_COMPRESSED: u8 = 0b0000_0100;
    /// Source-route section present (v2; parsed and preserved, never interpreted)
    pub const HAS_ROUTE: u8 = 0b0000_1000;

    /// Empty flag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Wrap a raw byte.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw byte value.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Recipient section present.
    #[must_use]
    pub const fn has_recipient(&self) -> bool {
        self.0 & Self::HAS_RECIPIENT != 0
    }

    /// Signature section present.
    #[must_use]
    pub const fn has_signature(&self) -> bool {
        self.0 & Self::HAS_SIGNATURE != 0
    }

    /// Payload compressed on the wire.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.0 & Self::IS_COMPRESSED != 0
    }

    /// Route section flagged (v2).
    #[must_use]
    pub const fn has_route(&self) -> bool {
        self.0 & Self::HAS_ROUTE != 0
    }
}

/// The unit that crosses a wire.
///
/// Equality covers every field the codec round-trips; the compression flag is
/// transport-internal and never appears on a decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version, 1 or 2
    pub version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Remaining relay hops, 0..=7; 0 means do not relay
    pub ttl: u8,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Flags not implied by the optional fields (currently only `HAS_ROUTE`)
    pub flags: PacketFlags,
    /// Originating peer
    pub sender_id: PeerId,
    /// Addressed recipient; broadcast when absent
    pub recipient_id: Option<PeerId>,
    /// Application payload
    pub payload: Vec<u8>,
    /// Ed25519 signature over header and payload
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Build a broadcast packet with the default version.
    #[must_use]
    pub fn broadcast(
        message_type: MessageType,
        sender_id: PeerId,
        timestamp: u64,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 1,
            message_type,
            ttl,
            timestamp,
            flags: PacketFlags::new(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Build an addressed packet with the default version.
    #[must_use]
    pub fn private(
        message_type: MessageType,
        sender_id: PeerId,
        recipient_id: PeerId,
        timestamp: u64,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 1,
            message_type,
            ttl,
            timestamp,
            flags: PacketFlags::new(),
            sender_id,
            recipient_id: Some(recipient_id),
            payload,
            signature: None,
        }
    }

    /// Header size for this packet's version.
    #[must_use]
    pub fn header_size(&self) -> usize {
        if self.version == 2 {
            HEADER_SIZE_V2
        } else {
            HEADER_SIZE_V1
        }
    }

    /// True when this packet is addressed to `peer` (or broadcast).
    #[must_use]
    pub fn is_for(&self, peer: &PeerId) -> bool {
        match &self.recipient_id {
            Some(r) => r == peer || *r == PeerId::BROADCAST,
            None => true,
        }
    }
}
