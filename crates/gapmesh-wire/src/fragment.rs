//! Fragmentation and reassembly of oversized packets.
//!
//! A packet whose encoded form does not fit the link MTU is split into
//! `Fragment` packets. Each fragment payload carries a fixed header followed
//! by a chunk of the *encoded original packet*:
//!
//! ```text
//! transfer id (16) | index u16 | total u16 | chunk
//! ```
//!
//! TTL and recipient are inherited from the original so fragments relay the
//! same way it would have. Reassembly buffers are keyed by transfer ID,
//! tolerate any arrival order, drop duplicates, expire after a timeout, and
//! deliver the synthesized original exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec;
use crate::error::WireError;
use crate::packet::{MessageType, Packet};

/// Size of a fragment transfer identifier.
pub const TRANSFER_ID_SIZE: usize = 16;

/// Fixed bytes a fragment payload spends before its chunk.
pub const FRAGMENT_HEADER_SIZE: usize = TRANSFER_ID_SIZE + 2 + 2;

/// How long an incomplete transfer is kept before being abandoned.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a completed transfer ID is remembered to shed late duplicates.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(30);

/// Bound on concurrently reassembling transfers.
pub const DEFAULT_MAX_TRANSFERS: usize = 128;

/// Parsed view of a fragment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Identifier shared by all fragments of one transfer
    pub transfer_id: [u8; TRANSFER_ID_SIZE],
    /// Position of this chunk, 0-based
    pub index: u16,
    /// Number of chunks in the transfer
    pub total: u16,
}

impl FragmentHeader {
    /// Parse the fragment payload prefix.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadFragment`] when the payload is shorter than
    /// the fixed header or declares an impossible index.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::BadFragment("payload shorter than header"));
        }
        let mut transfer_id = [0u8; TRANSFER_ID_SIZE];
        transfer_id.copy_from_slice(&payload[..TRANSFER_ID_SIZE]);
        let index = u16::from_be_bytes([payload[16], payload[17]]);
        let total = u16::from_be_bytes([payload[18], payload[19]]);
        if total == 0 {
            return Err(WireError::BadFragment("zero total"));
        }
        if index >= total {
            return Err(WireError::BadFragment("index past total"));
        }
        Ok((
            Self {
                transfer_id,
                index,
                total,
            },
            &payload[FRAGMENT_HEADER_SIZE..],
        ))
    }

    fn encode(&self, chunk: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        payload.extend_from_slice(&self.transfer_id);
        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.total.to_be_bytes());
        payload.extend_from_slice(chunk);
        payload
    }
}

/// Split a packet into fragments whose encoded size fits `mtu`.
///
/// # Errors
///
/// Returns [`WireError::MtuTooSmall`] when even a one-byte chunk cannot fit,
/// and [`WireError::FragmentMismatch`] when the packet would need more than
/// `u16::MAX` fragments.
pub fn split(
    packet: &Packet,
    mtu: usize,
    transfer_id: [u8; TRANSFER_ID_SIZE],
) -> Result<Vec<Packet>, WireError> {
    let encoded = codec::encode(packet);

    // A fragment spends header + sender + optional recipient + the fixed
    // fragment prefix before any chunk byte.
    let mut overhead = packet.header_size() + crate::packet::PEER_ID_SIZE + FRAGMENT_HEADER_SIZE;
    if packet.recipient_id.is_some() {
        overhead += crate::packet::PEER_ID_SIZE;
    }
    let budget = mtu.saturating_sub(overhead);
    if budget == 0 {
        return Err(WireError::MtuTooSmall(mtu));
    }

    let total = encoded.len().div_ceil(budget);
    if total > u16::MAX as usize {
        return Err(WireError::FragmentMismatch("transfer needs too many chunks"));
    }
    let total = total as u16;

    let fragments = encoded
        .chunks(budget)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader {
                transfer_id,
                index: index as u16,
                total,
            };
            Packet {
                version: packet.version,
                message_type: MessageType::Fragment,
                ttl: packet.ttl,
                timestamp: packet.timestamp,
                flags: crate::packet::PacketFlags::new(),
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                payload: header.encode(chunk),
                signature: None,
            }
        })
        .collect();
    Ok(fragments)
}

struct PendingTransfer {
    total: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_rx: Instant,
}

/// Reassembles fragment packets back into their original packet.
pub struct Reassembler {
    pending: HashMap<[u8; TRANSFER_ID_SIZE], PendingTransfer>,
    completed: HashMap<[u8; TRANSFER_ID_SIZE], Instant>,
    timeout: Duration,
    grace: Duration,
    max_transfers: usize,
}

impl Reassembler {
    /// Reassembler with the default windows.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_REASSEMBLY_TIMEOUT,
            DEFAULT_COMPLETION_GRACE,
            DEFAULT_MAX_TRANSFERS,
        )
    }

    /// Reassembler with explicit timeout, completion grace, and capacity.
    #[must_use]
    pub fn with_config(timeout: Duration, grace: Duration, max_transfers: usize) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            timeout,
            grace,
            max_transfers: max_transfers.max(1),
        }
    }

    /// Feed one fragment packet.
    ///
    /// Returns the synthesized original exactly once, on the fragment that
    /// completes it. Duplicates are silently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadFragment`] / [`WireError::FragmentMismatch`]
    /// for malformed or inconsistent fragments, and decode errors when a
    /// completed transfer does not parse back into a packet.
    pub fn accept(&mut self, packet: &Packet, now: Instant) -> Result<Option<Packet>, WireError> {
        if packet.message_type != MessageType::Fragment {
            return Err(WireError::BadFragment("not a fragment packet"));
        }
        let (header, chunk) = FragmentHeader::parse(&packet.payload)?;

        if let Some(done_at) = self.completed.get(&header.transfer_id) {
            if now.duration_since(*done_at) < self.grace {
                return Ok(None);
            }
            self.completed.remove(&header.transfer_id);
        }

        self.expire(now);

        if !self.pending.contains_key(&header.transfer_id) {
            if self.pending.len() >= self.max_transfers {
                self.evict_oldest();
            }
            self.pending.insert(
                header.transfer_id,
                PendingTransfer {
                    total: header.total,
                    chunks: vec![None; header.total as usize],
                    received: 0,
                    first_rx: now,
                },
            );
        }
        let entry = self
            .pending
            .get_mut(&header.transfer_id)
            .ok_or(WireError::FragmentMismatch("transfer vanished"))?;

        if entry.total != header.total {
            return Err(WireError::FragmentMismatch("total changed mid-transfer"));
        }
        let slot = &mut entry.chunks[header.index as usize];
        if slot.is_some() {
            // Duplicate fragment.
            return Ok(None);
        }
        *slot = Some(chunk.to_vec());
        entry.received += 1;

        if entry.received < entry.total as usize {
            return Ok(None);
        }

        let entry = self
            .pending
            .remove(&header.transfer_id)
            .ok_or(WireError::FragmentMismatch("transfer vanished"))?;
        self.completed.insert(header.transfer_id, now);

        let mut encoded = Vec::new();
        for chunk in entry.chunks.into_iter().flatten() {
            encoded.extend_from_slice(&chunk);
        }
        let original = codec::decode(&encoded)?;
        debug!(
            transfer = %hex::encode(header.transfer_id),
            size = encoded.len(),
            "reassembled fragmented packet"
        );
        Ok(Some(original))
    }

    /// Drop transfers whose reassembly window has elapsed and completed IDs
    /// past their grace window. Returns how many pending transfers were
    /// abandoned.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| now.duration_since(entry.first_rx) < timeout);
        let grace = self.grace;
        self.completed
            .retain(|_, done_at| now.duration_since(*done_at) < grace);
        before - self.pending.len()
    }

    /// Number of transfers currently buffering.
    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.pending.len()
    }

    /// Forget all state.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .pending
            .iter()
            .min_by_key(|(_, entry)| entry.first_rx)
            .map(|(id, _)| *id)
        {
            warn!(
                transfer = %hex::encode(oldest),
                "reassembly buffer full, evicting oldest transfer"
            );
            self.pending.remove(&oldest);
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PeerId;

    fn big_packet(len: usize) -> Packet {
        Packet::private(
            MessageType::NoiseEncrypted,
            PeerId::from_bytes([1; 8]),
            PeerId::from_bytes([2; 8]),
            1_700_000_000_000,
            7,
            // Random-ish bytes so zlib cannot flatten the payload.
            (0..len).map(|i| (i * 31 % 251) as u8).collect(),
        )
    }

    #[test]
    fn split_fits_mtu() {
        let packet = big_packet(9000);
        let fragments = split(&packet, 512, [9; 16]).unwrap();
        assert!(fragments.len() >= 5);
        for fragment in &fragments {
            assert!(codec::encode(fragment).len() <= 512);
            assert_eq!(fragment.ttl, packet.ttl);
            assert_eq!(fragment.recipient_id, packet.recipient_id);
        }
    }

    #[test]
    fn reassembles_in_order() {
        let packet = big_packet(3000);
        let fragments = split(&packet, 256, [1; 16]).unwrap();
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for fragment in &fragments {
            if let Some(original) = reassembler.accept(fragment, now).unwrap() {
                assert!(result.is_none(), "delivered more than once");
                result = Some(original);
            }
        }
        assert_eq!(result.unwrap(), packet);
    }

    #[test]
    fn reassembles_any_permutation() {
        let packet = big_packet(2000);
        let mut fragments = split(&packet, 300, [2; 16]).unwrap();
        fragments.reverse();
        let mid = fragments.len() / 2;
        fragments.swap(0, mid);
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for fragment in &fragments {
            if let Some(original) = reassembler.accept(fragment, now).unwrap() {
                result = Some(original);
            }
        }
        assert_eq!(result.unwrap(), packet);
    }

    #[test]
    fn duplicate_fragments_ignored() {
        let packet = big_packet(1000);
        let fragments = split(&packet, 300, [3; 16]).unwrap();
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        assert!(reassembler.accept(&fragments[0], now).unwrap().is_none());
        assert!(reassembler.accept(&fragments[0], now).unwrap().is_none());
        assert_eq!(reassembler.pending_transfers(), 1);
    }

    #[test]
    fn missing_fragment_never_completes_and_expires() {
        let packet = big_packet(2000);
        let fragments = split(&packet, 300, [4; 16]).unwrap();
        let mut reassembler =
            Reassembler::with_config(Duration::from_secs(30), Duration::from_secs(30), 16);
        let start = Instant::now();
        for (i, fragment) in fragments.iter().enumerate() {
            if i == 2 {
                continue;
            }
            assert!(reassembler.accept(fragment, start).unwrap().is_none());
        }
        assert_eq!(reassembler.pending_transfers(), 1);
        let expired = reassembler.expire(start + Duration::from_secs(31));
        assert_eq!(expired, 1);
        assert_eq!(reassembler.pending_transfers(), 0);
    }

    #[test]
    fn late_duplicate_after_completion_is_dropped() {
        let packet = big_packet(1000);
        let fragments = split(&packet, 300, [5; 16]).unwrap();
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut delivered = 0;
        for fragment in &fragments {
            if reassembler.accept(fragment, now).unwrap().is_some() {
                delivered += 1;
            }
        }
        // Replaying the whole transfer inside the grace window delivers nothing.
        for fragment in &fragments {
            if reassembler.accept(fragment, now).unwrap().is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[test]
    fn mtu_too_small_rejected() {
        let packet = big_packet(100);
        assert!(matches!(
            split(&packet, 30, [6; 16]),
            Err(WireError::MtuTooSmall(30))
        ));
    }
}
