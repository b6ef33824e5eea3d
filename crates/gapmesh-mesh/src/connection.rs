//! Per-link connection state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gapmesh_wire::{AssemblerConfig, PeerId, StreamAssembler};
use parking_lot::Mutex;
use tokio::time::timeout;

use crate::error::MeshError;
use crate::platform::{BleConnection, DeviceRef};

/// Lifecycle of one remote link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Seen in an advertisement within the current window
    Discovered,
    /// GATT connection initiated
    Connecting,
    /// Characteristic resolved, notifications subscribed
    Connected,
    /// Noise XX in progress
    Handshaking,
    /// Encrypted session established, announces exchanged
    Ready,
    /// No data past the inactivity threshold; disconnect scheduled
    Stale,
    /// Torn down
    Disconnected,
}

/// One connection to a remote device, either role.
pub struct Link {
    device: DeviceRef,
    connection: Arc<dyn BleConnection>,
    state: Mutex<LinkState>,
    peer_id: Mutex<Option<PeerId>>,
    nickname: Mutex<Option<String>>,
    pub(crate) assembler: Mutex<StreamAssembler>,
    last_activity: Mutex<Instant>,
    decode_errors: AtomicU32,
    write_gate: tokio::sync::Mutex<()>,
}

impl Link {
    /// Wrap a platform connection.
    #[must_use]
    pub fn new(connection: Box<dyn BleConnection>, now: Instant) -> Self {
        // Every gapmesh peer pads its writes, so the framer sheds each
        // frame's fill deterministically instead of sniffing through it.
        let assembler = StreamAssembler::with_config(AssemblerConfig {
            padded_stream: true,
            ..AssemblerConfig::default()
        });
        Self {
            device: connection.device(),
            connection: Arc::from(connection),
            state: Mutex::new(LinkState::Connected),
            peer_id: Mutex::new(None),
            nickname: Mutex::new(None),
            assembler: Mutex::new(assembler),
            last_activity: Mutex::new(now),
            decode_errors: AtomicU32::new(0),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Platform handle of the remote.
    #[must_use]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Negotiated write MTU.
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.connection.mtu()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Move to a new lifecycle state.
    pub fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    /// Mesh address of the peer, once learned from an announce or handshake.
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock()
    }

    /// Record the peer's mesh address.
    pub fn set_peer_id(&self, peer: PeerId) {
        *self.peer_id.lock() = Some(peer);
    }

    /// Last announced nickname.
    #[must_use]
    pub fn nickname(&self) -> Option<String> {
        self.nickname.lock().clone()
    }

    /// Record the peer's nickname. Returns true when it changed.
    pub fn set_nickname(&self, nickname: &str) -> bool {
        let mut slot = self.nickname.lock();
        if slot.as_deref() == Some(nickname) {
            false
        } else {
            *slot = Some(nickname.to_string());
            true
        }
    }

    /// Timestamp of the last inbound or confirmed outbound byte.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Note link activity.
    pub fn touch(&self, now: Instant) {
        *self.last_activity.lock() = now;
    }

    /// Bump the consecutive-decode-error counter, returning the new value.
    pub fn note_decode_error(&self) -> u32 {
        self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A good frame resets the error streak.
    pub fn note_good_frame(&self) {
        self.decode_errors.store(0, Ordering::Relaxed);
    }

    /// Serialized, deadline-bounded characteristic write.
    ///
    /// Writes on one link never interleave; a missed confirmation marks the
    /// link [`LinkState::Stale`].
    ///
    /// # Errors
    ///
    /// [`MeshError::WriteTimeout`] after `deadline`, or the platform error.
    pub async fn write(&self, bytes: &[u8], deadline: Duration) -> Result<(), MeshError> {
        let _gate = self.write_gate.lock().await;
        match timeout(deadline, self.connection.write(bytes)).await {
            Ok(result) => {
                if result.is_ok() {
                    self.touch(Instant::now());
                }
                result
            }
            Err(_) => {
                self.set_state(LinkState::Stale);
                Err(MeshError::WriteTimeout {
                    peer: self.device.clone(),
                })
            }
        }
    }

    /// Take the notification stream.
    ///
    /// # Errors
    ///
    /// Platform error when the stream was already taken.
    pub async fn subscribe(&self) -> Result<tokio::sync::mpsc::Receiver<Vec<u8>>, MeshError> {
        self.connection.subscribe().await
    }

    /// Disconnect the underlying GATT connection.
    pub async fn disconnect(&self) {
        self.set_state(LinkState::Disconnected);
        self.connection.disconnect().await;
    }
}
