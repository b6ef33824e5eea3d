//! Per-peer transport choice and the outbox.
//!
//! An outbound private message goes to the first transport, in preference
//! order, that reports the peer reachable. With none, the message waits in
//! that peer's outbox until a reachability or favorites event flushes it.
//! Receipts are best-effort: delivered if a transport can take them now,
//! dropped otherwise, never queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gapmesh_wire::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::payload::MESSAGE_ID_LEN;
use crate::transport::{Transport, TransportKind};

/// Entries one peer's outbox may hold before the oldest is rejected.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;

/// Queued messages older than this are discarded.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(72 * 3600);

/// One queued message.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Message identifier for ack correlation
    pub message_id: [u8; MESSAGE_ID_LEN],
    /// Encoded private payload envelope
    pub envelope: Vec<u8>,
    /// Last known nickname of the recipient, for system messages
    pub recipient_nickname: Option<String>,
    /// Wall-clock enqueue time, milliseconds
    pub enqueued_at: u64,
}

/// Where a send ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to a transport
    Sent(TransportKind),
    /// Parked in the peer's outbox
    Queued,
}

/// Events the router reports upward.
#[derive(Debug)]
pub enum RouterEvent {
    /// An outbox hit capacity and dropped its oldest entry
    OutboxOverflow {
        /// The affected peer
        peer: PeerId,
        /// Message id of the dropped entry
        dropped: [u8; MESSAGE_ID_LEN],
    },
    /// A queued message aged out
    OutboxExpired {
        /// The affected peer
        peer: PeerId,
        /// Message id of the dropped entry
        dropped: [u8; MESSAGE_ID_LEN],
    },
    /// A queued message finally left over a transport
    Flushed {
        /// The peer it went to
        peer: PeerId,
        /// Message id delivered
        message_id: [u8; MESSAGE_ID_LEN],
        /// Which transport carried it
        via: TransportKind,
    },
}

/// The router.
pub struct Router {
    transports: Vec<Arc<dyn Transport>>,
    outbox: DashMap<PeerId, VecDeque<OutboxEntry>>,
    capacity: usize,
    max_age: Duration,
    events: mpsc::Sender<RouterEvent>,
}

impl Router {
    /// Build a router over transports in preference order.
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> (Arc<Self>, mpsc::Receiver<RouterEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                transports,
                outbox: DashMap::new(),
                capacity: DEFAULT_OUTBOX_CAPACITY,
                max_age: DEFAULT_MAX_AGE,
                events,
            }),
            events_rx,
        )
    }

    fn pick_transport(&self, peer: &PeerId) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|transport| transport.is_peer_reachable(peer))
    }

    /// True when any transport reports the peer reachable.
    #[must_use]
    pub fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        self.pick_transport(peer).is_some()
    }

    /// Send a user-visible private message, queueing when no transport can
    /// carry it.
    pub async fn send_private(
        &self,
        peer: PeerId,
        message_id: [u8; MESSAGE_ID_LEN],
        envelope: Vec<u8>,
        recipient_nickname: Option<String>,
        now_ms: u64,
    ) -> SendOutcome {
        if let Some(transport) = self.pick_transport(&peer) {
            match transport.send_private(&peer, &envelope).await {
                Ok(()) => {
                    debug!(%peer, via = %transport.kind(), "private message sent");
                    return SendOutcome::Sent(transport.kind());
                }
                Err(e) => {
                    warn!(%peer, via = %transport.kind(), error = %e, "send failed, queueing");
                }
            }
        }
        self.enqueue(peer, message_id, envelope, recipient_nickname, now_ms)
            .await;
        SendOutcome::Queued
    }

    /// Best-effort receipt: sent if a transport can take it now, otherwise
    /// dropped.
    pub async fn send_receipt(&self, peer: PeerId, envelope: Vec<u8>) {
        if let Some(transport) = self.pick_transport(&peer) {
            if let Err(e) = transport.send_private(&peer, &envelope).await {
                debug!(%peer, error = %e, "receipt dropped");
            }
        } else {
            debug!(%peer, "receipt dropped, peer unreachable");
        }
    }

    async fn enqueue(
        &self,
        peer: PeerId,
        message_id: [u8; MESSAGE_ID_LEN],
        envelope: Vec<u8>,
        recipient_nickname: Option<String>,
        now_ms: u64,
    ) {
        let overflow = {
            let mut queue = self.outbox.entry(peer).or_default();
            let overflow = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(OutboxEntry {
                message_id,
                envelope,
                recipient_nickname,
                enqueued_at: now_ms,
            });
            info!(%peer, queued = queue.len(), "message parked in outbox");
            overflow
        };
        if let Some(dropped) = overflow {
            warn!(%peer, "outbox full, oldest entry rejected");
            let _ = self
                .events
                .send(RouterEvent::OutboxOverflow {
                    peer,
                    dropped: dropped.message_id,
                })
                .await;
        }
    }

    /// Flush a peer's outbox in order over the first reachable transport.
    /// Stops at the first failure, leaving the rest queued. Returns the
    /// message ids that left.
    pub async fn flush_peer(&self, peer: &PeerId) -> Vec<[u8; MESSAGE_ID_LEN]> {
        let mut delivered = Vec::new();
        loop {
            // Take one entry at a time so a mid-flush failure keeps order.
            let entry = {
                let mut queue = match self.outbox.get_mut(peer) {
                    Some(queue) => queue,
                    None => break,
                };
                match queue.pop_front() {
                    Some(entry) => entry,
                    None => break,
                }
            };

            let Some(transport) = self.pick_transport(peer) else {
                // Reachability vanished mid-flush; put it back at the front.
                self.outbox.entry(*peer).or_default().push_front(entry);
                break;
            };
            match transport.send_private(peer, &entry.envelope).await {
                Ok(()) => {
                    info!(%peer, via = %transport.kind(), "outbox entry flushed");
                    let _ = self
                        .events
                        .send(RouterEvent::Flushed {
                            peer: *peer,
                            message_id: entry.message_id,
                            via: transport.kind(),
                        })
                        .await;
                    delivered.push(entry.message_id);
                }
                Err(e) => {
                    warn!(%peer, error = %e, "flush stopped");
                    self.outbox.entry(*peer).or_default().push_front(entry);
                    break;
                }
            }
        }
        self.outbox.remove_if(peer, |_, queue| queue.is_empty());
        delivered
    }

    /// Discard entries older than the maximum age.
    pub async fn expire(&self, now_ms: u64) {
        let max_age_ms = self.max_age.as_millis() as u64;
        let mut expired = Vec::new();
        for mut entry in self.outbox.iter_mut() {
            let peer = *entry.key();
            let queue = entry.value_mut();
            while let Some(front) = queue.front() {
                if now_ms.saturating_sub(front.enqueued_at) <= max_age_ms {
                    break;
                }
                let dropped = queue.pop_front().map(|e| e.message_id);
                if let Some(dropped) = dropped {
                    expired.push((peer, dropped));
                }
            }
        }
        self.outbox.retain(|_, queue| !queue.is_empty());
        for (peer, dropped) in expired {
            let _ = self
                .events
                .send(RouterEvent::OutboxExpired { peer, dropped })
                .await;
        }
    }

    /// Queued entries for a peer.
    #[must_use]
    pub fn queued_for(&self, peer: &PeerId) -> usize {
        self.outbox.get(peer).map_or(0, |queue| queue.len())
    }

    /// Peers that currently have queued messages.
    #[must_use]
    pub fn peers_with_queued(&self) -> Vec<PeerId> {
        self.outbox.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop everything (panic wipe).
    pub fn clear(&self) {
        self.outbox.clear();
    }
}
