//! Whole-transport integration over the in-process loopback bus: discovery,
//! handshakes, private traffic, flood relay, and fragmentation.

use std::sync::Arc;
use std::time::Duration;

use gapmesh_crypto::{IdentityKeys, NoiseSessionManager};
use gapmesh_mesh::platform::loopback::LoopbackBus;
use gapmesh_mesh::{MeshConfig, MeshEvent, MeshTransport, SystemTimeSource};
use gapmesh_wire::{Deduplicator, PeerId};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Node {
    transport: Arc<MeshTransport>,
    events: mpsc::Receiver<MeshEvent>,
    peer_id: PeerId,
}

async fn spawn_node(bus: &LoopbackBus, name: &str, nickname: &str) -> Node {
    let identity = Arc::new(IdentityKeys::generate().unwrap());
    let noise = Arc::new(NoiseSessionManager::new(identity.noise_keypair().clone()));
    let dedup = Arc::new(Deduplicator::default());
    let platform = Arc::new(bus.endpoint(name));
    let config = MeshConfig {
        device_name: name.to_string(),
        nickname: nickname.to_string(),
        announce_interval: Duration::from_millis(200),
        ..MeshConfig::default()
    };
    let peer_id = noise.local_peer_id();
    let (transport, events) = MeshTransport::new(
        platform,
        noise,
        identity,
        dedup,
        Arc::new(SystemTimeSource),
        config,
    );
    transport.start().await.unwrap();
    Node {
        transport,
        events,
        peer_id,
    }
}

async fn wait_for<F>(node: &mut Node, what: &str, mut predicate: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = node.events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_discover_handshake_and_chat() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_node(&bus, "node-a", "alice").await;
    let mut bob = spawn_node(&bus, "node-b", "bob").await;

    // Announce exchange surfaces each peer to the other.
    let bob_id = bob.peer_id;
    wait_for(&mut alice, "bob to appear", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == bob_id)
    })
    .await;

    // The lower peer ID initiates; both sides reach Established.
    let alice_id = alice.peer_id;
    wait_for(&mut alice, "handshake at alice", |e| {
        matches!(e, MeshEvent::HandshakeComplete { peer, .. } if *peer == bob_id)
    })
    .await;
    wait_for(&mut bob, "handshake at bob", |e| {
        matches!(e, MeshEvent::HandshakeComplete { peer, .. } if *peer == alice_id)
    })
    .await;

    assert!(alice.transport.is_peer_reachable(&bob_id));
    assert!(bob.transport.is_peer_reachable(&alice_id));

    // Private payload flows encrypted and surfaces exactly once.
    alice
        .transport
        .send_private(&bob_id, b"\x01hello over the mesh")
        .await
        .unwrap();
    let event = wait_for(&mut bob, "private payload", |e| {
        matches!(e, MeshEvent::SecurePayload { peer, .. } if *peer == alice_id)
    })
    .await;
    let MeshEvent::SecurePayload { plaintext, .. } = event else {
        unreachable!()
    };
    assert_eq!(plaintext, b"\x01hello over the mesh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn public_message_reaches_all_nodes_once() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_node(&bus, "node-a", "alice").await;
    let mut bob = spawn_node(&bus, "node-b", "bob").await;
    let mut carol = spawn_node(&bus, "node-c", "carol").await;

    // Wait until everyone can see alice.
    let alice_id = alice.peer_id;
    wait_for(&mut bob, "alice at bob", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == alice_id)
    })
    .await;
    wait_for(&mut carol, "alice at carol", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == alice_id)
    })
    .await;

    alice.transport.send_public(b"ping".to_vec()).await;

    for node in [&mut bob, &mut carol] {
        let event = wait_for(node, "public packet", |e| {
            matches!(e, MeshEvent::PublicPacket { packet }
                if packet.sender_id == alice_id && packet.payload == b"ping")
        })
        .await;
        let MeshEvent::PublicPacket { packet } = event else {
            unreachable!()
        };
        assert_eq!(packet.payload, b"ping");
    }

    // Dedup: no second delivery of the same flood.
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            if let Some(MeshEvent::PublicPacket { packet }) = bob.events.recv().await {
                if packet.payload == b"ping" {
                    return;
                }
            }
        }
    })
    .await;
    assert!(extra.is_err(), "duplicate public delivery");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_hop_flood_delivers_once_with_decremented_ttl() {
    let bus = LoopbackBus::new();
    // Linear chain a-b-c-d: everyone else is out of radio range.
    bus.block("node-a", "node-c");
    bus.block("node-a", "node-d");
    bus.block("node-b", "node-d");

    let mut a = spawn_node(&bus, "node-a", "a").await;
    let mut b = spawn_node(&bus, "node-b", "b").await;
    let mut c = spawn_node(&bus, "node-c", "c").await;
    let mut d = spawn_node(&bus, "node-d", "d").await;

    let a_id = a.peer_id;
    // Direct neighbor first, then the relayed announces ripple outward.
    wait_for(&mut b, "a at b", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == a_id)
    })
    .await;
    wait_for(&mut c, "a at c", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == a_id)
    })
    .await;
    wait_for(&mut d, "a at d", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == a_id)
    })
    .await;

    a.transport.send_public(b"ping".to_vec()).await;

    // Every node sees the flood exactly once; the TTL on d's inbound link
    // has burned three hops of the original budget of seven.
    for (node, expected_ttl) in [(&mut b, 6u8), (&mut c, 5), (&mut d, 4)] {
        let event = wait_for(node, "flooded packet", |e| {
            matches!(e, MeshEvent::PublicPacket { packet }
                if packet.sender_id == a_id && packet.payload == b"ping")
        })
        .await;
        let MeshEvent::PublicPacket { packet } = event else {
            unreachable!()
        };
        assert_eq!(packet.ttl, expected_ttl);
    }

    let duplicate = timeout(Duration::from_millis(300), async {
        loop {
            if let Some(MeshEvent::PublicPacket { packet }) = d.events.recv().await {
                if packet.payload == b"ping" {
                    return;
                }
            }
        }
    })
    .await;
    assert!(duplicate.is_err(), "flood delivered twice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fragmented_broadcast_delivers_once_per_node_without_reflooding() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_node(&bus, "node-a", "alice").await;
    let mut bob = spawn_node(&bus, "node-b", "bob").await;
    let mut carol = spawn_node(&bus, "node-c", "carol").await;

    let alice_id = alice.peer_id;
    wait_for(&mut bob, "alice at bob", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == alice_id)
    })
    .await;
    wait_for(&mut carol, "alice at carol", |e| {
        matches!(e, MeshEvent::PeerAppeared { peer, .. } if *peer == alice_id)
    })
    .await;

    // Incompressible and well past the fragment threshold, so the broadcast
    // goes out as several fragments that every node both relays and buffers.
    let payload: Vec<u8> = (0..3000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    alice.transport.send_public(payload.clone()).await;

    for node in [&mut bob, &mut carol] {
        let event = wait_for(node, "reassembled broadcast", |e| {
            matches!(e, MeshEvent::PublicPacket { packet } if packet.sender_id == alice_id)
        })
        .await;
        let MeshEvent::PublicPacket { packet } = event else {
            unreachable!()
        };
        assert_eq!(packet.payload, payload);
    }

    // Each node delivers the whole exactly once, even though fragments
    // arrive both directly and relayed through the third node.
    for node in [&mut bob, &mut carol] {
        let duplicate = timeout(Duration::from_millis(400), async {
            loop {
                if let Some(MeshEvent::PublicPacket { packet }) = node.events.recv().await {
                    if packet.sender_id == alice_id {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(duplicate.is_err(), "fragmented broadcast delivered twice");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragmented_private_payload_reassembles() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_node(&bus, "node-a", "alice").await;
    let mut bob = spawn_node(&bus, "node-b", "bob").await;

    let bob_id = bob.peer_id;
    let alice_id = alice.peer_id;
    wait_for(&mut alice, "handshake", |e| {
        matches!(e, MeshEvent::HandshakeComplete { peer, .. } if *peer == bob_id)
    })
    .await;
    wait_for(&mut bob, "handshake", |e| {
        matches!(e, MeshEvent::HandshakeComplete { peer, .. } if *peer == alice_id)
    })
    .await;

    // 9000 incompressible bytes force at least five fragments.
    let payload: Vec<u8> = (0..9000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    alice.transport.send_private(&bob_id, &payload).await.unwrap();

    let event = wait_for(&mut bob, "reassembled payload", |e| {
        matches!(e, MeshEvent::SecurePayload { peer, .. } if *peer == alice_id)
    })
    .await;
    let MeshEvent::SecurePayload { plaintext, .. } = event else {
        unreachable!()
    };
    assert_eq!(plaintext, payload);
}
