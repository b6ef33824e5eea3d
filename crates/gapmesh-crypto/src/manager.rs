//! Per-peer Noise session coordination.
//!
//! One session per (local, remote) identity pair, keyed by [`PeerId`] in a
//! concurrent map. A map entry guard serializes all cryptographic work for a
//! single peer; different peers proceed in parallel. No lock is held across
//! I/O; every method is pure computation over in-memory state.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use gapmesh_wire::PeerId;
use tracing::{debug, info, warn};

use crate::error::CryptoError;
use crate::identity::Fingerprint;
use crate::noise::{NoiseHandshake, NoiseKeypair, Role, MESSAGE_1_SIZE};
use crate::session::EstablishedSession;

/// Abort a handshake that makes no progress for this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tear down an established session idle for this long.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Observable lifecycle of a peer's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session and no handshake
    Idle,
    /// We sent message 1 and await message 2
    HandshakeSent,
    /// We answered message 1 and await message 3
    HandshakeReceived,
    /// Transport ciphers live
    Established,
    /// Send direction due for a rekey at the next encrypt
    Rekeying,
}

/// What processing a handshake message produced.
#[derive(Default)]
pub struct HandshakeOutcome {
    /// Bytes to send back, when it is our turn
    pub reply: Option<Vec<u8>>,
    /// Set when this message completed the handshake
    pub established: Option<EstablishedInfo>,
}

/// Facts about a freshly established session.
#[derive(Clone)]
pub struct EstablishedInfo {
    /// Remote static public key
    pub remote_static: [u8; 32],
    /// Fingerprint of that key
    pub fingerprint: Fingerprint,
}

enum PeerSession {
    Handshaking {
        handshake: NoiseHandshake,
        started: Instant,
    },
    Established(Box<EstablishedSession>),
}

/// Thread-safe manager of every Noise session on this device.
pub struct NoiseSessionManager {
    local: NoiseKeypair,
    local_id: PeerId,
    sessions: DashMap<PeerId, PeerSession>,
    inactivity_timeout: Duration,
}

impl NoiseSessionManager {
    /// Manager bound to this device's static keypair.
    #[must_use]
    pub fn new(local: NoiseKeypair) -> Self {
        let local_id = PeerId::from_public_key(local.public_key());
        Self {
            local,
            local_id,
            sessions: DashMap::new(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    /// Override the inactivity timeout.
    pub fn set_inactivity_timeout(&mut self, timeout: Duration) {
        self.inactivity_timeout = timeout;
    }

    /// Our own mesh address.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    /// True when a packet to `peer` must wait for a handshake first.
    #[must_use]
    pub fn handshake_required(&self, peer: &PeerId) -> bool {
        !matches!(
            self.sessions.get(peer).as_deref(),
            Some(PeerSession::Established(_))
        )
    }

    /// Current phase for a peer.
    #[must_use]
    pub fn phase(&self, peer: &PeerId, now: Instant) -> SessionPhase {
        match self.sessions.get(peer).as_deref() {
            None => SessionPhase::Idle,
            Some(PeerSession::Handshaking { handshake, .. }) => match handshake.role() {
                Role::Initiator => SessionPhase::HandshakeSent,
                Role::Responder => SessionPhase::HandshakeReceived,
            },
            Some(PeerSession::Established(session)) => {
                if session.needs_rekey(now) {
                    SessionPhase::Rekeying
                } else {
                    SessionPhase::Established
                }
            }
        }
    }

    /// The peer's static public key, once established.
    #[must_use]
    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        match self.sessions.get(peer).as_deref() {
            Some(PeerSession::Established(session)) => Some(*session.remote_static()),
            _ => None,
        }
    }

    /// Fingerprint of the peer's static key, once established.
    #[must_use]
    pub fn remote_fingerprint(&self, peer: &PeerId) -> Option<Fingerprint> {
        match self.sessions.get(peer).as_deref() {
            Some(PeerSession::Established(session)) => Some(session.fingerprint().clone()),
            _ => None,
        }
    }

    /// Start a handshake toward `peer`, returning message 1.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeInProgress`] when one is already in
    /// flight or the session is already established.
    pub fn initiate_handshake(&self, peer: PeerId, now: Instant) -> Result<Vec<u8>, CryptoError> {
        if self.sessions.contains_key(&peer) {
            return Err(CryptoError::HandshakeInProgress);
        }
        let mut handshake = NoiseHandshake::new_initiator(&self.local)?;
        let message = handshake.write_message()?;
        self.sessions.insert(
            peer,
            PeerSession::Handshaking {
                handshake,
                started: now,
            },
        );
        debug!(%peer, "handshake initiated");
        Ok(message)
    }

    /// Process an inbound handshake message from `peer`.
    ///
    /// Handles the concurrent-initiator race: when both sides sent message 1,
    /// the lexicographically lower peer ID stays initiator and the other
    /// discards its own attempt.
    ///
    /// # Errors
    ///
    /// Hands back the underlying handshake failure; the broken handshake
    /// state is dropped so the peer can retry from scratch.
    pub fn process_handshake(
        &self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<HandshakeOutcome, CryptoError> {
        // An established peer restarting with a fresh message 1 means it
        // lost our session; drop ours and renegotiate.
        if message.len() == MESSAGE_1_SIZE {
            if let Some(entry) = self.sessions.get(&peer) {
                if matches!(entry.value(), PeerSession::Established(_)) {
                    drop(entry);
                    info!(%peer, "peer restarted handshake over live session");
                    self.sessions.remove(&peer);
                }
            }
        }

        let existing = self.sessions.remove(&peer);
        let result = self.process_handshake_inner(peer, message, now, existing);
        if result.is_err() {
            self.sessions.remove(&peer);
        }
        result
    }

    fn process_handshake_inner(
        &self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
        existing: Option<(PeerId, PeerSession)>,
    ) -> Result<HandshakeOutcome, CryptoError> {
        let mut handshake = match existing {
            Some((_, PeerSession::Handshaking { handshake, started })) => {
                if handshake.role() == Role::Initiator && message.len() == MESSAGE_1_SIZE {
                    // Both sides initiated. Lower peer ID keeps its attempt.
                    if self.local_id < peer {
                        debug!(%peer, "concurrent handshake, keeping ours");
                        self.sessions.insert(
                            peer,
                            PeerSession::Handshaking { handshake, started },
                        );
                        return Ok(HandshakeOutcome::default());
                    }
                    debug!(%peer, "concurrent handshake, yielding to peer");
                    NoiseHandshake::new_responder(&self.local)?
                } else {
                    handshake
                }
            }
            _ => NoiseHandshake::new_responder(&self.local)?,
        };

        handshake.read_message(message)?;

        let mut outcome = HandshakeOutcome::default();
        if !handshake.is_complete() {
            // Our turn produces message 2 (responder) or message 3 (initiator).
            outcome.reply = Some(handshake.write_message()?);
        }

        if handshake.is_complete() {
            let remote_static = handshake
                .remote_static()
                .ok_or(CryptoError::InvalidState)?;
            let session =
                EstablishedSession::new(handshake.into_transport()?, remote_static, now);
            outcome.established = Some(EstablishedInfo {
                remote_static,
                fingerprint: session.fingerprint().clone(),
            });
            self.sessions
                .insert(peer, PeerSession::Established(Box::new(session)));
            info!(%peer, "noise session established");
        } else {
            self.sessions.insert(
                peer,
                PeerSession::Handshaking {
                    handshake,
                    started: now,
                },
            );
        }
        Ok(outcome)
    }

    /// Encrypt a plaintext for `peer`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoSession`] without an established session; any
    /// encryption failure purges the session.
    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let mut entry = self.sessions.get_mut(peer).ok_or(CryptoError::NoSession)?;
        let PeerSession::Established(session) = entry.value_mut() else {
            return Err(CryptoError::NoSession);
        };
        match session.encrypt(plaintext, now) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                drop(entry);
                warn!(%peer, error = %e, "encrypt failed, purging session");
                self.sessions.remove(peer);
                Err(e)
            }
        }
    }

    /// Decrypt a session frame from `peer`.
    ///
    /// Replay violations, stale epochs, and authentication failures purge the
    /// session; the caller must re-handshake.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoSession`] without an established session, otherwise
    /// the terminal error that killed it.
    pub fn decrypt(&self, peer: &PeerId, frame: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let mut entry = self.sessions.get_mut(peer).ok_or(CryptoError::NoSession)?;
        let PeerSession::Established(session) = entry.value_mut() else {
            return Err(CryptoError::NoSession);
        };
        match session.decrypt(frame, now) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                drop(entry);
                warn!(%peer, error = %e, "decrypt failed, purging session");
                self.sessions.remove(peer);
                Err(e)
            }
        }
    }

    /// Close and forget the session with `peer`.
    pub fn close(&self, peer: &PeerId) {
        if self.sessions.remove(peer).is_some() {
            debug!(%peer, "session closed");
        }
    }

    /// Close every session (emergency disconnect, panic wipe).
    pub fn close_all(&self) {
        self.sessions.clear();
    }

    /// Drop handshakes that stalled and sessions idle past the timeout.
    /// Returns the peers that were torn down.
    pub fn expire(&self, now: Instant) -> Vec<PeerId> {
        let mut expired = Vec::new();
        self.sessions.retain(|peer, state| {
            let keep = match state {
                PeerSession::Handshaking { started, .. } => {
                    now.duration_since(*started) < HANDSHAKE_TIMEOUT
                }
                PeerSession::Established(session) => {
                    now.duration_since(session.last_activity()) < self.inactivity_timeout
                }
            };
            if !keep {
                expired.push(*peer);
            }
            keep
        });
        for peer in &expired {
            info!(%peer, "session expired");
        }
        expired
    }

    /// Peers with an established session.
    #[must_use]
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|entry| matches!(entry.value(), PeerSession::Established(_)))
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_pair() -> (NoiseSessionManager, NoiseSessionManager) {
        (
            NoiseSessionManager::new(NoiseKeypair::generate().unwrap()),
            NoiseSessionManager::new(NoiseKeypair::generate().unwrap()),
        )
    }

    fn run_handshake(a: &NoiseSessionManager, b: &NoiseSessionManager) {
        let now = Instant::now();
        let a_id = a.local_peer_id();
        let b_id = b.local_peer_id();
        let m1 = a.initiate_handshake(b_id, now).unwrap();
        let o1 = b.process_handshake(a_id, &m1, now).unwrap();
        let m2 = o1.reply.unwrap();
        let o2 = a.process_handshake(b_id, &m2, now).unwrap();
        assert!(o2.established.is_some());
        let m3 = o2.reply.unwrap();
        let o3 = b.process_handshake(a_id, &m3, now).unwrap();
        assert!(o3.established.is_some());
        assert!(o3.reply.is_none());
    }

    #[test]
    fn full_handshake_and_traffic() {
        let (a, b) = manager_pair();
        run_handshake(&a, &b);
        let now = Instant::now();
        assert!(!a.handshake_required(&b.local_peer_id()));
        assert!(!b.handshake_required(&a.local_peer_id()));

        let frame = a.encrypt(&b.local_peer_id(), b"hi", now).unwrap();
        assert_eq!(b.decrypt(&a.local_peer_id(), &frame, now).unwrap(), b"hi");
    }

    #[test]
    fn fingerprints_agree_with_keys() {
        let (a, b) = manager_pair();
        run_handshake(&a, &b);
        assert_eq!(
            a.remote_fingerprint(&b.local_peer_id()).unwrap(),
            Fingerprint::of(b.local.public_key())
        );
    }

    #[test]
    fn concurrent_initiators_converge() {
        let (a, b) = manager_pair();
        let now = Instant::now();
        let a_id = a.local_peer_id();
        let b_id = b.local_peer_id();

        let m1_from_a = a.initiate_handshake(b_id, now).unwrap();
        let m1_from_b = b.initiate_handshake(a_id, now).unwrap();

        // Cross-deliver both first messages.
        let outcome_at_b = b.process_handshake(a_id, &m1_from_a, now).unwrap();
        let outcome_at_a = a.process_handshake(b_id, &m1_from_b, now).unwrap();

        // Exactly one side yielded and answered with message 2.
        let (winner, loser, m2) = match (outcome_at_a.reply, outcome_at_b.reply) {
            (Some(m2), None) => (&b, &a, m2),
            (None, Some(m2)) => (&a, &b, m2),
            other => panic!("expected exactly one responder, got {:?}", (other.0.is_some(), other.1.is_some())),
        };
        assert!(winner.local_peer_id() < loser.local_peer_id());

        let o = winner
            .process_handshake(loser.local_peer_id(), &m2, now)
            .unwrap();
        assert!(o.established.is_some());
        let m3 = o.reply.unwrap();
        let o = loser
            .process_handshake(winner.local_peer_id(), &m3, now)
            .unwrap();
        assert!(o.established.is_some());

        let frame = a.encrypt(&b_id, b"settled", now).unwrap();
        assert_eq!(b.decrypt(&a_id, &frame, now).unwrap(), b"settled");
    }

    #[test]
    fn stalled_handshake_expires() {
        let (a, b) = manager_pair();
        let now = Instant::now();
        a.initiate_handshake(b.local_peer_id(), now).unwrap();
        assert!(a.expire(now + Duration::from_secs(5)).is_empty());
        let expired = a.expire(now + HANDSHAKE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(expired, vec![b.local_peer_id()]);
        assert!(a.handshake_required(&b.local_peer_id()));
    }

    #[test]
    fn purge_on_decrypt_failure_requires_rehandshake() {
        let (a, b) = manager_pair();
        run_handshake(&a, &b);
        let now = Instant::now();
        let mut frame = a.encrypt(&b.local_peer_id(), b"x", now).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(b.decrypt(&a.local_peer_id(), &frame, now).is_err());
        assert!(b.handshake_required(&a.local_peer_id()));
    }

    #[test]
    fn restart_over_live_session() {
        let (a, b) = manager_pair();
        run_handshake(&a, &b);
        let now = Instant::now();
        // A loses state and initiates again; B renegotiates.
        a.close(&b.local_peer_id());
        let m1 = a.initiate_handshake(b.local_peer_id(), now).unwrap();
        let o = b.process_handshake(a.local_peer_id(), &m1, now).unwrap();
        assert!(o.reply.is_some());
        assert_eq!(
            b.phase(&a.local_peer_id(), now),
            SessionPhase::HandshakeReceived
        );
    }
}
