//! Whole-core end-to-end: two session controllers over the in-process BLE
//! bus, exercising handshake, private messaging with acks, outbox flush,
//! and panic wipe.

use std::sync::Arc;
use std::time::Duration;

use gapmesh_mesh::platform::loopback::LoopbackBus;
use gapmesh_node::{
    ControllerConfig, ControllerEvent, Keychain, MemoryKeychain, Services, SessionController,
};
use gapmesh_relay::PoolConfig;
use gapmesh_wire::PeerId;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct App {
    controller: Arc<SessionController>,
    events: mpsc::Receiver<ControllerEvent>,
    peer_id: PeerId,
    keychain: Arc<MemoryKeychain>,
}

async fn spawn_app(bus: &LoopbackBus, name: &str, nickname: &str) -> App {
    let keychain = Arc::new(MemoryKeychain::default());
    let services = Services {
        keychain: keychain.clone(),
        ..Services::in_memory()
    };
    let platform = Arc::new(bus.endpoint(name));
    let config = ControllerConfig {
        nickname: nickname.to_string(),
        device_name: name.to_string(),
        relay: PoolConfig {
            relays: vec![], // no sockets in tests
            ..PoolConfig::default()
        },
        ..ControllerConfig::default()
    };
    let (controller, events) = SessionController::build(platform, services, config).unwrap();
    controller.start().await.unwrap();
    let peer_id = controller.local_peer_id();
    App {
        controller,
        events,
        peer_id,
        keychain,
    }
}

async fn wait_for<F>(app: &mut App, what: &str, mut predicate: F) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = app.events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_message_with_delivery_and_read_acks() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_app(&bus, "phone-a", "alice").await;
    let mut bob = spawn_app(&bus, "phone-b", "bob").await;
    let alice_id = alice.peer_id;
    let bob_id = bob.peer_id;

    wait_for(&mut alice, "handshake", |e| {
        matches!(e, ControllerEvent::NoiseHandshakeComplete { peer, .. } if *peer == bob_id)
    })
    .await;

    let sent_id = alice.controller.send_private("hello", bob_id).await;

    // Exactly one receive event on bob, carrying the text and sender.
    let event = wait_for(&mut bob, "message at bob", |e| {
        matches!(e, ControllerEvent::MessageReceived { from, .. } if *from == alice_id)
    })
    .await;
    let ControllerEvent::MessageReceived {
        text,
        message_id,
        private,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(text, "hello");
    assert!(private);
    assert_eq!(message_id, Some(sent_id));

    // Alice sees the delivery ack for that id.
    let event = wait_for(&mut alice, "delivery ack", |e| {
        matches!(e, ControllerEvent::DeliveryAck { peer, .. } if *peer == bob_id)
    })
    .await;
    let ControllerEvent::DeliveryAck { message_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(message_id, sent_id);

    // Read receipt flows back too.
    bob.controller.mark_read(alice_id, sent_id).await;
    let event = wait_for(&mut alice, "read ack", |e| {
        matches!(e, ControllerEvent::ReadAck { peer, .. } if *peer == bob_id)
    })
    .await;
    let ControllerEvent::ReadAck { message_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(message_id, sent_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_message_flushes_exactly_once_on_handshake() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_app(&bus, "phone-a", "alice").await;
    let mut bob = spawn_app(&bus, "phone-b", "bob").await;
    let alice_id = alice.peer_id;
    let bob_id = bob.peer_id;

    // Send before any session exists: the message parks in the outbox and
    // the handshake is kicked automatically once a link is up.
    alice.controller.send_private("early bird", bob_id).await;

    let event = wait_for(&mut bob, "flushed message", |e| {
        matches!(e, ControllerEvent::MessageReceived { from, .. } if *from == alice_id)
    })
    .await;
    let ControllerEvent::MessageReceived { text, .. } = event else {
        unreachable!()
    };
    assert_eq!(text, "early bird");

    // Exactly once.
    let duplicate = timeout(Duration::from_millis(500), async {
        loop {
            if let Some(ControllerEvent::MessageReceived { text, .. }) = bob.events.recv().await {
                if text == "early bird" {
                    return;
                }
            }
        }
    })
    .await;
    assert!(duplicate.is_err(), "queued message delivered twice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn public_message_reaches_the_room() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_app(&bus, "phone-a", "alice").await;
    let mut bob = spawn_app(&bus, "phone-b", "bob").await;
    let alice_id = alice.peer_id;

    wait_for(&mut bob, "alice visible", |e| {
        matches!(e, ControllerEvent::PeerAppeared { peer, .. } if *peer == alice_id)
    })
    .await;
    wait_for(&mut alice, "bob visible", |e| {
        matches!(e, ControllerEvent::PeerAppeared { .. })
    })
    .await;

    alice.controller.send_public("ping", &[]).await;
    let event = wait_for(&mut bob, "public message", |e| {
        matches!(e, ControllerEvent::MessageReceived { private: false, .. })
    })
    .await;
    let ControllerEvent::MessageReceived { text, from, .. } = event else {
        unreachable!()
    };
    assert_eq!(text, "ping");
    assert_eq!(from, alice_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_wipe_destroys_everything_and_rotates_identity() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_app(&bus, "phone-a", "alice").await;
    let mut bob = spawn_app(&bus, "phone-b", "bob").await;
    let bob_id = bob.peer_id;

    wait_for(&mut alice, "handshake", |e| {
        matches!(e, ControllerEvent::NoiseHandshakeComplete { peer, .. } if *peer == bob_id)
    })
    .await;
    let old_fingerprint = alice.controller.local_fingerprint();

    alice.controller.panic_wipe().await;

    // Keychain empty, favorites gone, new identity on next start.
    assert!(alice
        .keychain
        .get(gapmesh_node::KEY_STATIC_IDENTITY)
        .is_none());
    assert!(alice.keychain.get(gapmesh_node::KEY_FAVORITES).is_none());

    let services = Services {
        keychain: alice.keychain.clone(),
        ..Services::in_memory()
    };
    let fresh = gapmesh_node::load_or_create_identity(&services).unwrap();
    assert_ne!(fresh.fingerprint().to_hex(), old_fingerprint);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn emergency_disconnect_drops_the_mesh() {
    let bus = LoopbackBus::new();
    let mut alice = spawn_app(&bus, "phone-a", "alice").await;
    let mut bob = spawn_app(&bus, "phone-b", "bob").await;
    let alice_id = alice.peer_id;
    let bob_id = bob.peer_id;

    wait_for(&mut alice, "handshake", |e| {
        matches!(e, ControllerEvent::NoiseHandshakeComplete { peer, .. } if *peer == bob_id)
    })
    .await;

    alice.controller.emergency_disconnect_all().await;
    wait_for(&mut bob, "alice gone", |e| {
        matches!(e, ControllerEvent::PeerDisappeared { peer } if *peer == alice_id)
    })
    .await;
}
