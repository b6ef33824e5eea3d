//! Established Noise session state: transport ciphers, explicit nonces,
//! replay protection, and per-direction rekeying.
//!
//! A transport ciphertext is framed as:
//!
//! ```text
//! epoch u32 BE | nonce u64 BE | snow ciphertext (payload + 16-byte tag)
//! ```
//!
//! Nonces are snow's running counters and never reset, so the replay window
//! slides over one monotonic sequence per direction. Each direction rekeys
//! with the Noise rekey primitive when its epoch ends: after 10 000 messages
//! or one hour, whichever comes first. The receiver chains `rekey_incoming`
//! to whatever epoch an arriving ciphertext declares; going backwards is a
//! terminal error.

use std::time::{Duration, Instant};

use snow::TransportState;
use tracing::{debug, warn};

use crate::error::CryptoError;
use crate::identity::Fingerprint;
use crate::replay::ReplayWindow;

/// Messages per direction before a mandatory rekey.
pub const REKEY_MESSAGES: u64 = 10_000;

/// Wall-time bound on an epoch.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Bytes the session frame spends before the snow ciphertext.
pub const SESSION_HEADER: usize = 4 + 8;

/// AEAD tag size appended by snow.
pub const TAG_SIZE: usize = 16;

/// One established session with a remote peer.
pub struct EstablishedSession {
    transport: TransportState,
    remote_static: [u8; 32],
    fingerprint: Fingerprint,
    send_epoch: u32,
    recv_epoch: u32,
    sent_in_epoch: u64,
    send_epoch_started: Instant,
    replay: ReplayWindow,
    established_at: Instant,
    last_activity: Instant,
    messages_sent: u64,
    messages_received: u64,
}

impl EstablishedSession {
    /// Wrap a completed handshake's transport state.
    #[must_use]
    pub fn new(transport: TransportState, remote_static: [u8; 32], now: Instant) -> Self {
        let fingerprint = Fingerprint::of(&remote_static);
        Self {
            transport,
            remote_static,
            fingerprint,
            send_epoch: 0,
            recv_epoch: 0,
            sent_in_epoch: 0,
            send_epoch_started: now,
            replay: ReplayWindow::new(),
            established_at: now,
            last_activity: now,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// The peer's static public key.
    #[must_use]
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// The peer's stable fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// When the session reached Established.
    #[must_use]
    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Last successful encrypt or decrypt.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Messages sent over this session.
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Messages received over this session.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// True when the send direction is due for a rekey at the next encrypt.
    #[must_use]
    pub fn needs_rekey(&self, now: Instant) -> bool {
        self.sent_in_epoch >= REKEY_MESSAGES
            || now.duration_since(self.send_epoch_started) >= REKEY_INTERVAL
    }

    /// Encrypt a plaintext, rolling the send epoch first when due.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] when snow refuses, which is
    /// terminal for the session.
    pub fn encrypt(&mut self, plaintext: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        if self.needs_rekey(now) {
            self.transport.rekey_outgoing();
            self.send_epoch = self.send_epoch.wrapping_add(1);
            self.sent_in_epoch = 0;
            self.send_epoch_started = now;
            debug!(epoch = self.send_epoch, "send direction rekeyed");
        }

        let nonce = self.transport.sending_nonce();
        let mut out = Vec::with_capacity(SESSION_HEADER + plaintext.len() + TAG_SIZE);
        out.extend_from_slice(&self.send_epoch.to_be_bytes());
        out.extend_from_slice(&nonce.to_be_bytes());
        let mut body = vec![0u8; plaintext.len() + TAG_SIZE];
        let len = self
            .transport
            .write_message(plaintext, &mut body)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        body.truncate(len);
        out.extend_from_slice(&body);

        self.sent_in_epoch += 1;
        self.messages_sent += 1;
        self.last_activity = now;
        Ok(out)
    }

    /// Decrypt a session frame.
    ///
    /// Out-of-order arrival inside the 1024-entry window is fine; a replay,
    /// a pre-window nonce, a stale epoch, or an authentication failure is
    /// terminal; the caller purges the session.
    ///
    /// # Errors
    ///
    /// [`CryptoError::CiphertextTooShort`], [`CryptoError::StaleEpoch`],
    /// [`CryptoError::ReplayViolation`], or [`CryptoError::DecryptionFailed`].
    pub fn decrypt(&mut self, frame: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < SESSION_HEADER + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }
        let epoch = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let nonce = u64::from_be_bytes([
            frame[4], frame[5], frame[6], frame[7], frame[8], frame[9], frame[10], frame[11],
        ]);
        let body = &frame[SESSION_HEADER..];

        if epoch < self.recv_epoch {
            warn!(got = epoch, current = self.recv_epoch, "stale rekey epoch");
            return Err(CryptoError::StaleEpoch {
                got: u64::from(epoch),
                current: u64::from(self.recv_epoch),
            });
        }
        while self.recv_epoch < epoch {
            self.transport.rekey_incoming();
            self.recv_epoch += 1;
            debug!(epoch = self.recv_epoch, "receive direction rekeyed");
        }

        if !self.replay.would_accept(nonce) {
            return Err(CryptoError::ReplayViolation(nonce));
        }

        self.transport.set_receiving_nonce(nonce);
        let mut plaintext = vec![0u8; body.len()];
        let len = self
            .transport
            .read_message(body, &mut plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        plaintext.truncate(len);

        // Mark the nonce only after authentication so a forgery cannot
        // poison the window against the genuine packet.
        if !self.replay.check_and_update(nonce) {
            return Err(CryptoError::ReplayViolation(nonce));
        }
        self.messages_received += 1;
        self.last_activity = now;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{NoiseHandshake, NoiseKeypair};

    fn established_pair() -> (EstablishedSession, EstablishedSession) {
        let a_keys = NoiseKeypair::generate().unwrap();
        let b_keys = NoiseKeypair::generate().unwrap();
        let mut a = NoiseHandshake::new_initiator(&a_keys).unwrap();
        let mut b = NoiseHandshake::new_responder(&b_keys).unwrap();
        let m1 = a.write_message().unwrap();
        b.read_message(&m1).unwrap();
        let m2 = b.write_message().unwrap();
        a.read_message(&m2).unwrap();
        let m3 = a.write_message().unwrap();
        b.read_message(&m3).unwrap();
        let a_remote = a.remote_static().unwrap();
        let b_remote = b.remote_static().unwrap();
        let now = Instant::now();
        (
            EstablishedSession::new(a.into_transport().unwrap(), a_remote, now),
            EstablishedSession::new(b.into_transport().unwrap(), b_remote, now),
        )
    }

    #[test]
    fn roundtrip() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        let frame = a.encrypt(b"hello", now).unwrap();
        assert_eq!(b.decrypt(&frame, now).unwrap(), b"hello");
        let frame = b.encrypt("回声".as_bytes(), now).unwrap();
        assert_eq!(a.decrypt(&frame, now).unwrap(), "回声".as_bytes());
    }

    #[test]
    fn out_of_order_within_window() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        let f0 = a.encrypt(b"zero", now).unwrap();
        let f1 = a.encrypt(b"one", now).unwrap();
        let f2 = a.encrypt(b"two", now).unwrap();
        assert_eq!(b.decrypt(&f2, now).unwrap(), b"two");
        assert_eq!(b.decrypt(&f0, now).unwrap(), b"zero");
        assert_eq!(b.decrypt(&f1, now).unwrap(), b"one");
    }

    #[test]
    fn replay_is_terminal() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        let frame = a.encrypt(b"once", now).unwrap();
        assert_eq!(b.decrypt(&frame, now).unwrap(), b"once");
        assert!(matches!(
            b.decrypt(&frame, now),
            Err(CryptoError::ReplayViolation(_))
        ));
    }

    #[test]
    fn tampered_frame_fails_auth() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        let mut frame = a.encrypt(b"payload", now).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            b.decrypt(&frame, now),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn count_triggered_rekey_continuity() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        // Force the boundary without sending ten thousand messages.
        a.sent_in_epoch = REKEY_MESSAGES;
        let frame = a.encrypt(b"after boundary", now).unwrap();
        assert_eq!(a.send_epoch, 1);
        assert_eq!(b.decrypt(&frame, now).unwrap(), b"after boundary");
        assert_eq!(b.recv_epoch, 1);
        // Traffic keeps flowing in the new epoch.
        let frame = a.encrypt(b"steady", now).unwrap();
        assert_eq!(b.decrypt(&frame, now).unwrap(), b"steady");
    }

    #[test]
    fn time_triggered_rekey() {
        let (mut a, mut b) = established_pair();
        let start = Instant::now();
        let frame = a.encrypt(b"early", start).unwrap();
        assert_eq!(b.decrypt(&frame, start).unwrap(), b"early");
        let late = start + REKEY_INTERVAL + Duration::from_secs(1);
        let frame = a.encrypt(b"an hour on", late).unwrap();
        assert_eq!(a.send_epoch, 1);
        assert_eq!(b.decrypt(&frame, late).unwrap(), b"an hour on");
    }

    #[test]
    fn stale_epoch_rejected() {
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        a.sent_in_epoch = REKEY_MESSAGES;
        let fresh = a.encrypt(b"new epoch", now).unwrap();
        assert_eq!(b.decrypt(&fresh, now).unwrap(), b"new epoch");
        // Hand-craft a frame claiming epoch 0 again.
        let mut stale = a.encrypt(b"x", now).unwrap();
        stale[0..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            b.decrypt(&stale, now),
            Err(CryptoError::StaleEpoch { .. })
        ));
    }

    #[test]
    fn missed_rekey_fails_to_decrypt() {
        // A receiver that ignores the declared epoch (simulated by stripping
        // it back to zero before the peer rekeys its own state) cannot read
        // post-boundary traffic.
        let (mut a, mut b) = established_pair();
        let now = Instant::now();
        a.sent_in_epoch = REKEY_MESSAGES;
        let mut frame = a.encrypt(b"sealed", now).unwrap();
        frame[0..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            b.decrypt(&frame, now),
            Err(CryptoError::DecryptionFailed)
        ));
    }
}
