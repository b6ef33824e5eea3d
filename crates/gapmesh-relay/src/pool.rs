//! Relay connection pool.
//!
//! One task per relay URL. Each task dials, replays the active
//! subscriptions, pumps messages, and on any failure backs off
//! exponentially with jitter before retrying. Nothing is queued here:
//! messages published while a relay is down are simply not sent to it (the
//! Router's outbox owns retry semantics).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::event::NostrEvent;

/// Relays dialed when the host does not supply its own set.
pub const DEFAULT_RELAYS: [&str; 5] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://offchain.pub",
    "wss://nostr21.com",
];

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relay websocket URLs
    pub relays: Vec<String>,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Ceiling for the reconnect delay
    pub max_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|s| (*s).to_string()).collect(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Events the pool posts to its owner.
#[derive(Debug)]
pub enum PoolEvent {
    /// A relay socket came up
    RelayConnected {
        /// Relay URL
        url: String,
    },
    /// A relay socket dropped; the pool is already backing off to retry
    RelayDisconnected {
        /// Relay URL
        url: String,
    },
    /// An EVENT message arrived for one of our subscriptions
    EventReceived {
        /// Relay URL it came from
        url: String,
        /// Subscription id it matched
        subscription: String,
        /// The event
        event: NostrEvent,
    },
}

struct RelayHandle {
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
}

/// Pool of relay connections with shared subscriptions.
pub struct RelayPool {
    config: PoolConfig,
    relays: DashMap<String, RelayHandle>,
    subscriptions: Mutex<HashMap<String, serde_json::Value>>,
    events: mpsc::Sender<PoolEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl RelayPool {
    /// Build a pool; the receiver carries its events.
    #[must_use]
    pub fn new(config: PoolConfig) -> (Arc<Self>, mpsc::Receiver<PoolEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                config,
                relays: DashMap::new(),
                subscriptions: Mutex::new(HashMap::new()),
                events,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    /// Spawn one connection task per configured relay.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for url in self.config.relays.clone() {
            let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
            let connected = Arc::new(AtomicBool::new(false));
            self.relays.insert(
                url.clone(),
                RelayHandle {
                    outbound: outbound_tx,
                    connected: Arc::clone(&connected),
                },
            );
            let pool = Arc::clone(self);
            let task = tokio::spawn(async move {
                pool.run_relay(url, outbound_rx, connected).await;
            });
            self.tasks.lock().push(task);
        }
    }

    /// Abort every connection task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in self.relays.iter() {
            entry.value().connected.store(false, Ordering::SeqCst);
        }
    }

    /// How many relay sockets are currently up.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.relays
            .iter()
            .filter(|entry| entry.value().connected.load(Ordering::SeqCst))
            .count()
    }

    /// Register a subscription; sent now to live relays and replayed on
    /// every reconnect.
    pub async fn subscribe(&self, id: &str, filter: serde_json::Value) {
        let request =
            serde_json::to_string(&serde_json::json!(["REQ", id, filter])).unwrap_or_default();
        self.subscriptions.lock().insert(id.to_string(), filter);
        self.send_to_connected(&request).await;
    }

    /// Publish an event to every connected relay.
    pub async fn publish(&self, event: &NostrEvent) {
        match serde_json::to_string(&serde_json::json!(["EVENT", event])) {
            Ok(message) => self.send_to_connected(&message).await,
            Err(e) => warn!(error = %e, "unserializable event"),
        }
    }

    async fn send_to_connected(&self, message: &str) {
        let targets: Vec<mpsc::Sender<String>> = self
            .relays
            .iter()
            .filter(|entry| entry.value().connected.load(Ordering::SeqCst))
            .map(|entry| entry.value().outbound.clone())
            .collect();
        for outbound in targets {
            let _ = outbound.send(message.to_string()).await;
        }
    }

    async fn run_relay(
        self: Arc<Self>,
        url: String,
        mut outbound: mpsc::Receiver<String>,
        connected: Arc<AtomicBool>,
    ) {
        let mut backoff = self.config.initial_backoff;
        loop {
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    info!(%url, "relay connected");
                    connected.store(true, Ordering::SeqCst);
                    backoff = self.config.initial_backoff;
                    let _ = self
                        .events
                        .send(PoolEvent::RelayConnected { url: url.clone() })
                        .await;

                    let (mut sink, mut stream) = socket.split();

                    // Replay the active subscriptions on the fresh socket.
                    let replay: Vec<String> = self
                        .subscriptions
                        .lock()
                        .iter()
                        .map(|(id, filter)| {
                            serde_json::to_string(&serde_json::json!(["REQ", id, filter]))
                                .unwrap_or_default()
                        })
                        .collect();
                    for request in replay {
                        if sink.send(WsMessage::Text(request)).await.is_err() {
                            break;
                        }
                    }

                    loop {
                        tokio::select! {
                            queued = outbound.recv() => {
                                let Some(message) = queued else { return };
                                if sink.send(WsMessage::Text(message)).await.is_err() {
                                    break;
                                }
                            }
                            incoming = stream.next() => {
                                match incoming {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        if let Some((subscription, event)) = parse_relay_message(&text) {
                                            let _ = self.events.send(PoolEvent::EventReceived {
                                                url: url.clone(),
                                                subscription,
                                                event,
                                            }).await;
                                        }
                                    }
                                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                    }

                    connected.store(false, Ordering::SeqCst);
                    let _ = self
                        .events
                        .send(PoolEvent::RelayDisconnected { url: url.clone() })
                        .await;
                }
                Err(e) => {
                    debug!(%url, error = %e, "relay dial failed");
                }
            }

            // Exponential backoff with jitter before the next attempt.
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            let delay = backoff.mul_f64(jitter).min(self.config.max_backoff);
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

/// Parse one relay → client message; only EVENT frames carry payloads we
/// surface, the rest are logged.
fn parse_relay_message(text: &str) -> Option<(String, NostrEvent)> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let array = value.as_array()?;
    match array.first()?.as_str()? {
        "EVENT" => {
            let subscription = array.get(1)?.as_str()?.to_string();
            let event: NostrEvent = serde_json::from_value(array.get(2)?.clone()).ok()?;
            Some((subscription, event))
        }
        "EOSE" => {
            debug!(raw = %text, "end of stored events");
            None
        }
        "OK" => {
            debug!(raw = %text, "publish acknowledged");
            None
        }
        "NOTICE" => {
            warn!(raw = %text, "relay notice");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_GIFT_WRAP;

    #[test]
    fn parses_event_frames() {
        let event = NostrEvent {
            id: "00".repeat(32),
            pubkey: "ab".repeat(32),
            created_at: 1_700_000_000,
            kind: KIND_GIFT_WRAP,
            tags: vec![],
            content: "payload".into(),
            sig: "cd".repeat(64),
        };
        let frame = serde_json::to_string(&serde_json::json!(["EVENT", "sub-1", event])).unwrap();
        let (subscription, parsed) = parse_relay_message(&frame).unwrap();
        assert_eq!(subscription, "sub-1");
        assert_eq!(parsed.kind, KIND_GIFT_WRAP);
        assert_eq!(parsed.content, "payload");
    }

    #[test]
    fn ignores_non_event_frames() {
        assert!(parse_relay_message(r#"["EOSE","sub-1"]"#).is_none());
        assert!(parse_relay_message(r#"["NOTICE","slow down"]"#).is_none());
        assert!(parse_relay_message("not json").is_none());
    }
}
