//! Property-based tests for the gapmesh wire protocol.
//!
//! Uses proptest to verify codec, padding, fragmentation, and framing
//! invariants across large input spaces.

use std::time::Instant;

use proptest::prelude::*;

use gapmesh_wire::{
    codec, fragment, padding, MessageType, Packet, PacketFlags, PeerId, StreamAssembler,
};

fn arb_message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Announce),
        Just(MessageType::Message),
        Just(MessageType::Leave),
        Just(MessageType::NoiseHandshake),
        Just(MessageType::NoiseEncrypted),
        Just(MessageType::Fragment),
        Just(MessageType::RequestSync),
        Just(MessageType::FileTransfer),
    ]
}

prop_compose! {
    fn arb_packet()(
        version in 1u8..=2,
        message_type in arb_message_type(),
        ttl in 0u8..=7,
        timestamp in any::<u64>(),
        has_route in any::<bool>(),
        sender in any::<[u8; 8]>(),
        recipient in prop::option::of(any::<[u8; 8]>()),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        signature in prop::option::of(any::<[u8; 32]>()),
    ) -> Packet {
        let flags = if has_route && version == 2 {
            PacketFlags::from_bits(PacketFlags::HAS_ROUTE)
        } else {
            PacketFlags::new()
        };
        // proptest caps array strategies at 32; widen to the wire's 64.
        let signature = signature.map(|half| {
            let mut sig = [0u8; 64];
            sig[..32].copy_from_slice(&half);
            sig[32..].copy_from_slice(&half);
            sig
        });
        Packet {
            version,
            message_type,
            ttl,
            timestamp,
            flags,
            sender_id: PeerId::from_bytes(sender),
            recipient_id: recipient.map(PeerId::from_bytes),
            payload,
            signature,
        }
    }
}

proptest! {
    /// decode(encode(P)) == P for every in-range packet.
    #[test]
    fn codec_roundtrip(packet in arb_packet()) {
        let encoded = codec::encode(&packet);
        let decoded = codec::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    /// The encoded length equals the declared framing.
    #[test]
    fn encoded_length_matches_framing(packet in arb_packet()) {
        let encoded = codec::encode(&packet);
        let declared = codec::frame_length(&encoded, gapmesh_wire::DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        prop_assert_eq!(declared, encoded.len());
    }

    /// unpad(pad(x, block)) == x whenever the pad fits its count byte.
    #[test]
    fn padding_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..2048),
        block_idx in 0usize..4,
    ) {
        let block = padding::BLOCK_SIZES[block_idx];
        let padded = padding::pad_to(&data, block);
        let needed = block.saturating_sub(data.len());
        if (1..=255).contains(&needed) {
            prop_assert_eq!(padded.len(), block);
            prop_assert_eq!(padding::unpad(&padded), &data[..]);
        } else {
            prop_assert_eq!(&padded, &data);
        }
    }

    /// Any permutation of the fragments reassembles to the original.
    #[test]
    fn fragment_reassembly_under_permutation(
        payload in prop::collection::vec(any::<u8>(), 600..4000),
        seed in any::<u64>(),
        transfer_id in any::<[u8; 16]>(),
    ) {
        let packet = Packet::private(
            MessageType::NoiseEncrypted,
            PeerId::from_bytes([1; 8]),
            PeerId::from_bytes([2; 8]),
            1_700_000_000_000,
            7,
            payload,
        );
        let mut fragments = fragment::split(&packet, 200, transfer_id).unwrap();
        prop_assert!(fragments.len() > 1);

        // Cheap deterministic shuffle.
        let mut state = seed | 1;
        for i in (1..fragments.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            fragments.swap(i, (state as usize) % (i + 1));
        }

        let mut reassembler = fragment::Reassembler::new();
        let now = Instant::now();
        let mut delivered = Vec::new();
        for fragment in &fragments {
            if let Some(original) = reassembler.accept(fragment, now).unwrap() {
                delivered.push(original);
            }
        }
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(&delivered[0], &packet);
    }

    /// Feeding concatenated frames under any chunking yields them in order.
    #[test]
    fn assembler_liveness(
        payload_lens in prop::collection::vec(0usize..100, 1..6),
        chunk_size in 1usize..600,
    ) {
        let packets: Vec<Packet> = payload_lens
            .iter()
            .enumerate()
            .map(|(i, &len)| Packet::broadcast(
                MessageType::Message,
                PeerId::from_bytes([(i + 1) as u8; 8]),
                1_700_000_000_000 + i as u64,
                3,
                vec![i as u8; len],
            ))
            .collect();
        let stream: Vec<u8> = packets.iter().flat_map(codec::encode).collect();

        let mut assembler = StreamAssembler::new();
        let now = Instant::now();
        let mut frames = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            let outcome = assembler.append(chunk, now);
            prop_assert!(!outcome.did_reset);
            prop_assert_eq!(outcome.dropped_prefix, 0);
            frames.extend(outcome.frames);
        }
        let expected: Vec<Vec<u8>> = packets.iter().map(codec::encode).collect();
        prop_assert_eq!(frames, expected);
    }

    /// Once inserted, a fingerprint stays visible until capacity inserts occur.
    #[test]
    fn dedup_monotonic(count in 1usize..200) {
        let dedup = gapmesh_wire::Deduplicator::new(256);
        for i in 0..count {
            let fp = format!("fp:{i}");
            prop_assert!(dedup.insert(&fp));
        }
        for i in 0..count {
            let fp = format!("fp:{i}");
            prop_assert!(dedup.contains(&fp));
        }
    }
}
