//! Binary encoding and decoding of [`Packet`]s.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! offset 0   version        (1)   1 or 2
//! offset 1   type           (1)
//! offset 2   ttl            (1)
//! offset 3   timestamp      (8)   milliseconds since epoch
//! offset 11  flags          (1)
//! offset 12  payload length (2 in v1, 4 in v2)
//! then       sender id      (8)
//!            recipient id   (8, if HAS_RECIPIENT)
//!            payload        (payload length bytes)
//!            signature      (64, if HAS_SIGNATURE)
//! ```
//!
//! When `IS_COMPRESSED` is set the payload opens with a raw-length field
//! (u16 in v1, u32 in v2) followed by a zlib stream. Compression is a codec
//! decision: callers never set the flag, and decoded packets never carry it.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::WireError;
use crate::packet::{
    MessageType, Packet, PacketFlags, PeerId, HEADER_SIZE_V1, HEADER_SIZE_V2, PEER_ID_SIZE,
    SIGNATURE_SIZE,
};

/// Default cap on a decoded payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Payloads below this size are never worth a zlib header.
const COMPRESSION_THRESHOLD: usize = 100;

/// True for the protocol versions this codec understands.
#[must_use]
pub const fn is_supported_version(version: u8) -> bool {
    version == 1 || version == 2
}

fn payload_len_field_size(version: u8) -> usize {
    if version == 2 {
        4
    } else {
        2
    }
}

/// Compute the full frame length from a buffer that starts at a packet
/// boundary.
///
/// Returns `Ok(None)` when the buffer is too short to know yet. The stream
/// assembler relies on this to decide whether to wait for more bytes.
///
/// # Errors
///
/// Returns [`WireError::UnknownVersion`] for an unrecognized version byte and
/// [`WireError::PayloadTooLarge`] when the declared payload exceeds `cap`.
pub fn frame_length(buf: &[u8], cap: usize) -> Result<Option<usize>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let version = buf[0];
    if !is_supported_version(version) {
        return Err(WireError::UnknownVersion(version));
    }
    let header = if version == 2 {
        HEADER_SIZE_V2
    } else {
        HEADER_SIZE_V1
    };
    if buf.len() < header {
        return Ok(None);
    }
    let flags = PacketFlags::from_bits(buf[11]);
    let payload_len = if version == 2 {
        u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize
    } else {
        u16::from_be_bytes([buf[12], buf[13]]) as usize
    };
    if payload_len > cap {
        return Err(WireError::PayloadTooLarge {
            len: payload_len,
            cap,
        });
    }
    let mut total = header + PEER_ID_SIZE + payload_len;
    if flags.has_recipient() {
        total += PEER_ID_SIZE;
    }
    if flags.has_signature() {
        total += SIGNATURE_SIZE;
    }
    Ok(Some(total))
}

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn inflate(data: &[u8], raw_len: usize) -> Result<Vec<u8>, WireError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(raw_len);
    decoder
        .by_ref()
        .take(raw_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| WireError::Decompression(e.to_string()))?;
    if out.len() != raw_len {
        return Err(WireError::Decompression(format!(
            "raw length mismatch: declared {raw_len}, got {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Encode a packet to its wire form.
///
/// The codec compresses the payload when it pays for itself; the caller's
/// flags are carried through untouched otherwise.
#[must_use]
pub fn encode(packet: &Packet) -> Vec<u8> {
    let field = payload_len_field_size(packet.version);

    // Compression decision: worthwhile only past the threshold, only when the
    // zlib stream plus the raw-length field is actually smaller, and only when
    // the raw length fits the version's field.
    let raw_len = packet.payload.len();
    let raw_len_fits = packet.version == 2 || raw_len <= u16::MAX as usize;
    let compressed = if raw_len > COMPRESSION_THRESHOLD && raw_len_fits {
        deflate(&packet.payload).filter(|c| c.len() + field < raw_len)
    } else {
        None
    };

    let mut flags = packet.flags.bits();
    if packet.recipient_id.is_some() {
        flags |= PacketFlags::HAS_RECIPIENT;
    }
    if packet.signature.is_some() {
        flags |= PacketFlags::HAS_SIGNATURE;
    }
    let payload_section = match &compressed {
        Some(c) => field + c.len(),
        None => raw_len,
    };
    if compressed.is_some() {
        flags |= PacketFlags::IS_COMPRESSED;
    }

    let mut out = Vec::with_capacity(
        packet.header_size()
            + PEER_ID_SIZE * 2
            + payload_section
            + if packet.signature.is_some() {
                SIGNATURE_SIZE
            } else {
                0
            },
    );
    out.push(packet.version);
    out.push(packet.message_type as u8);
    out.push(packet.ttl);
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    out.push(flags);
    if packet.version == 2 {
        out.extend_from_slice(&(payload_section as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&(payload_section as u16).to_be_bytes());
    }
    out.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    match &compressed {
        Some(c) => {
            if packet.version == 2 {
                out.extend_from_slice(&(raw_len as u32).to_be_bytes());
            } else {
                out.extend_from_slice(&(raw_len as u16).to_be_bytes());
            }
            out.extend_from_slice(c);
        }
        None => out.extend_from_slice(&packet.payload),
    }
    if let Some(signature) = &packet.signature {
        out.extend_from_slice(signature);
    }
    out
}

/// Decode a packet with the default payload cap.
///
/// # Errors
///
/// See [`decode_with_limit`].
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    decode_with_limit(data, DEFAULT_MAX_PAYLOAD)
}

/// Decode a packet, capping the declared payload length at `cap`.
///
/// Trailing bytes past the declared framing are ignored; that is how
/// transmission padding is shed on whole-frame reads.
///
/// # Errors
///
/// Every failure here is a non-fatal decode error per the protocol contract:
/// unknown version, bad type, truncation, an over-cap length, or a corrupt
/// zlib stream.
pub fn decode_with_limit(data: &[u8], cap: usize) -> Result<Packet, WireError> {
    if data.is_empty() {
        return Err(WireError::Truncated {
            expected: HEADER_SIZE_V1,
            actual: 0,
        });
    }
    let version = data[0];
    if !is_supported_version(version) {
        return Err(WireError::UnknownVersion(version));
    }
    let header = if version == 2 {
        HEADER_SIZE_V2
    } else {
        HEADER_SIZE_V1
    };
    if data.len() < header + PEER_ID_SIZE {
        return Err(WireError::Truncated {
            expected: header + PEER_ID_SIZE,
            actual: data.len(),
        });
    }

    let message_type = MessageType::try_from(data[1])?;
    let ttl = data[2];
    let timestamp = u64::from_be_bytes([
        data[3], data[4], data[5], data[6], data[7], data[8], data[9], data[10],
    ]);
    let flags = PacketFlags::from_bits(data[11]);
    let payload_len = if version == 2 {
        u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize
    } else {
        u16::from_be_bytes([data[12], data[13]]) as usize
    };
    if payload_len > cap {
        return Err(WireError::PayloadTooLarge {
            len: payload_len,
            cap,
        });
    }

    let mut offset = header;
    let mut sender = [0u8; PEER_ID_SIZE];
    sender.copy_from_slice(&data[offset..offset + PEER_ID_SIZE]);
    let sender_id = PeerId::from_bytes(sender);
    offset += PEER_ID_SIZE;

    let recipient_id = if flags.has_recipient() {
        if data.len() < offset + PEER_ID_SIZE {
            return Err(WireError::Truncated {
                expected: offset + PEER_ID_SIZE,
                actual: data.len(),
            });
        }
        let mut recipient = [0u8; PEER_ID_SIZE];
        recipient.copy_from_slice(&data[offset..offset + PEER_ID_SIZE]);
        offset += PEER_ID_SIZE;
        Some(PeerId::from_bytes(recipient))
    } else {
        None
    };

    if data.len() < offset + payload_len {
        return Err(WireError::Truncated {
            expected: offset + payload_len,
            actual: data.len(),
        });
    }
    let payload_section = &data[offset..offset + payload_len];
    offset += payload_len;

    let payload = if flags.is_compressed() {
        let field = payload_len_field_size(version);
        if payload_section.len() < field {
            return Err(WireError::Decompression(
                "compressed payload shorter than raw-length field".into(),
            ));
        }
        let raw_len = if version == 2 {
            u32::from_be_bytes([
                payload_section[0],
                payload_section[1],
                payload_section[2],
                payload_section[3],
            ]) as usize
        } else {
            u16::from_be_bytes([payload_section[0], payload_section[1]]) as usize
        };
        if raw_len > cap {
            return Err(WireError::PayloadTooLarge { len: raw_len, cap });
        }
        inflate(&payload_section[field..], raw_len)?
    } else {
        payload_section.to_vec()
    };

    let signature = if flags.has_signature() {
        if data.len() < offset + SIGNATURE_SIZE {
            return Err(WireError::Truncated {
                expected: offset + SIGNATURE_SIZE,
                actual: data.len(),
            });
        }
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(&data[offset..offset + SIGNATURE_SIZE]);
        Some(sig)
    } else {
        None
    };

    trace!(
        version,
        packet_type = ?message_type,
        ttl,
        payload_len = payload.len(),
        "decoded packet"
    );

    // HAS_RECIPIENT / HAS_SIGNATURE are implied by the optional fields, and
    // IS_COMPRESSED never survives decode. HAS_ROUTE is preserved verbatim.
    let stored = flags.bits()
        & !(PacketFlags::HAS_RECIPIENT | PacketFlags::HAS_SIGNATURE | PacketFlags::IS_COMPRESSED);

    Ok(Packet {
        version,
        message_type,
        ttl,
        timestamp,
        flags: PacketFlags::from_bits(stored),
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}

/// The byte view an Ed25519 signature covers: the canonical encoding of the
/// packet with no signature section and no compression applied.
#[must_use]
pub fn signable_bytes(packet: &Packet) -> Vec<u8> {
    let mut unsigned = packet.clone();
    unsigned.signature = None;
    let mut flags = unsigned.flags.bits() & !PacketFlags::HAS_SIGNATURE;
    if unsigned.recipient_id.is_some() {
        flags |= PacketFlags::HAS_RECIPIENT;
    }
    let field = payload_len_field_size(unsigned.version);
    let mut out = Vec::with_capacity(
        unsigned.header_size() + PEER_ID_SIZE * 2 + unsigned.payload.len(),
    );
    out.push(unsigned.version);
    out.push(unsigned.message_type as u8);
    out.push(unsigned.ttl);
    out.extend_from_slice(&unsigned.timestamp.to_be_bytes());
    out.push(flags);
    if field == 4 {
        out.extend_from_slice(&(unsigned.payload.len() as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&(unsigned.payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(unsigned.sender_id.as_bytes());
    if let Some(recipient) = &unsigned.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    out.extend_from_slice(&unsigned.payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: u8) -> Packet {
        Packet {
            version,
            message_type: MessageType::Message,
            ttl: 5,
            timestamp: 1_700_000_000_123,
            flags: PacketFlags::new(),
            sender_id: PeerId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            recipient_id: Some(PeerId::from_bytes([9, 10, 11, 12, 13, 14, 15, 16])),
            payload: b"hello".to_vec(),
            signature: None,
        }
    }

    #[test]
    fn roundtrip_v1() {
        let packet = sample(1);
        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_v2() {
        let packet = sample(2);
        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn header_sizes() {
        let mut packet = sample(1);
        packet.recipient_id = None;
        let encoded = encode(&packet);
        assert_eq!(encoded.len(), HEADER_SIZE_V1 + PEER_ID_SIZE + 5);

        packet.version = 2;
        let encoded = encode(&packet);
        assert_eq!(encoded.len(), HEADER_SIZE_V2 + PEER_ID_SIZE + 5);
    }

    #[test]
    fn compresses_large_repetitive_payloads() {
        let mut packet = sample(1);
        packet.payload = vec![0x41; 4096];
        let encoded = encode(&packet);
        assert!(encoded.len() < 4096);
        assert!(PacketFlags::from_bits(encoded[11]).is_compressed());
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.payload, packet.payload);
        assert!(!decoded.flags.is_compressed());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut encoded = encode(&sample(1));
        encoded[0] = 9;
        assert!(matches!(decode(&encoded), Err(WireError::UnknownVersion(9))));
    }

    #[test]
    fn truncated_rejected() {
        let encoded = encode(&sample(1));
        assert!(matches!(
            decode(&encoded[..encoded.len() - 1]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn oversize_payload_rejected() {
        let mut packet = sample(1);
        packet.payload = vec![7; 2048];
        let encoded = encode(&packet);
        assert!(matches!(
            decode_with_limit(&encoded, 1024),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn signature_carried() {
        let mut packet = sample(1);
        packet.signature = Some([0xAB; SIGNATURE_SIZE]);
        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(decoded.signature, packet.signature);
    }

    #[test]
    fn trailing_padding_ignored() {
        let packet = sample(1);
        let mut encoded = encode(&packet);
        encoded.extend_from_slice(&[0u8; 37]);
        assert_eq!(decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn frame_length_matches_encoding() {
        let packet = sample(2);
        let encoded = encode(&packet);
        assert_eq!(
            frame_length(&encoded, DEFAULT_MAX_PAYLOAD).unwrap(),
            Some(encoded.len())
        );
        assert_eq!(frame_length(&encoded[..4], DEFAULT_MAX_PAYLOAD).unwrap(), None);
    }

    #[test]
    fn signable_bytes_excludes_signature() {
        let mut packet = sample(1);
        let unsigned_view = signable_bytes(&packet);
        packet.signature = Some([1; SIGNATURE_SIZE]);
        assert_eq!(signable_bytes(&packet), unsigned_view);
    }
}
