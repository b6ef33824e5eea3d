//! Injected BLE platform interface.
//!
//! The core never talks to a radio directly; the host application provides
//! an implementation of [`BlePlatform`] (CoreBluetooth, BlueZ, an emulator).
//! Each device plays both roles: central (scan + connect) and peripheral
//! (advertise + accept). The [`loopback`] module ships an in-process bus
//! used by the integration tests to run whole nodes against each other
//! without hardware.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::MeshError;

/// Opaque reference to a remote device as the platform names it.
pub type DeviceRef = String;

/// One advertisement observation.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Platform handle for the advertising device
    pub device: DeviceRef,
    /// Which service UUID it advertised
    pub service_uuid: Uuid,
    /// Received signal strength, when the platform reports one
    pub rssi: Option<i16>,
}

/// A live GATT connection with the gapmesh characteristic resolved.
#[async_trait]
pub trait BleConnection: Send + Sync {
    /// Platform handle of the remote device.
    fn device(&self) -> DeviceRef;

    /// Negotiated MTU for characteristic writes.
    fn mtu(&self) -> usize;

    /// Write bytes to the characteristic; resolves when the remote confirms.
    async fn write(&self, bytes: &[u8]) -> Result<(), MeshError>;

    /// Take the notification stream. Chunk boundaries are arbitrary; the
    /// stream may be taken once.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, MeshError>;

    /// Tear the connection down.
    async fn disconnect(&self);
}

/// A connection another device opened to our peripheral.
pub struct IncomingConnection {
    /// Who dialed us
    pub from: DeviceRef,
    /// The accepted connection; call `subscribe` for its inbound bytes
    pub connection: Box<dyn BleConnection>,
}

/// The BLE platform surface the host injects.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Advertise the given service UUIDs with our characteristic. Replaces
    /// any previous advertisement.
    async fn advertise(
        &self,
        service_uuids: &[Uuid],
        characteristic: Uuid,
    ) -> Result<(), MeshError>;

    /// Scan for any of the given service UUIDs. Replaces any previous scan.
    async fn scan(&self, service_uuids: &[Uuid]) -> Result<mpsc::Receiver<Discovery>, MeshError>;

    /// Open a GATT connection and resolve the gapmesh characteristic.
    async fn connect(&self, device: &DeviceRef) -> Result<Box<dyn BleConnection>, MeshError>;

    /// Stream of connections other devices open to us. May be taken once.
    async fn accept_connections(&self) -> Result<mpsc::Receiver<IncomingConnection>, MeshError>;

    /// Stop advertising and scanning.
    async fn shutdown(&self);
}

/// In-process BLE bus for tests: every registered endpoint sees every other
/// endpoint whose advertised UUIDs intersect its scan set.
pub mod loopback {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{BleConnection, BlePlatform, DeviceRef, Discovery, IncomingConnection};
    use crate::error::MeshError;

    /// MTU the loopback bus reports, matching a conservative real stack.
    pub const LOOPBACK_MTU: usize = 185;

    struct ConnectRequest {
        from: DeviceRef,
        // Sender the acceptor uses to notify the initiator.
        to_initiator: mpsc::Sender<Vec<u8>>,
        // Returns the sender the initiator uses to write to the acceptor.
        reply: tokio::sync::oneshot::Sender<mpsc::Sender<Vec<u8>>>,
    }

    struct Endpoint {
        advertised: Vec<Uuid>,
        scanning: Vec<Uuid>,
        discovery_tx: Option<mpsc::Sender<Discovery>>,
        accept_tx: mpsc::Sender<ConnectRequest>,
        reachable: bool,
    }

    /// Shared in-memory bus.
    #[derive(Clone, Default)]
    pub struct LoopbackBus {
        inner: Arc<Mutex<HashMap<DeviceRef, Endpoint>>>,
        blocked: Arc<Mutex<std::collections::HashSet<(DeviceRef, DeviceRef)>>>,
    }

    impl LoopbackBus {
        /// Fresh empty bus.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a named endpoint.
        #[must_use]
        pub fn endpoint(&self, name: &str) -> LoopbackPlatform {
            let (accept_tx, accept_rx) = mpsc::channel::<ConnectRequest>(16);
            self.inner.lock().insert(
                name.to_string(),
                Endpoint {
                    advertised: Vec::new(),
                    scanning: Vec::new(),
                    discovery_tx: None,
                    accept_tx,
                    reachable: true,
                },
            );
            LoopbackPlatform {
                bus: self.clone(),
                name: name.to_string(),
                accept_rx: Mutex::new(Some(accept_rx)),
            }
        }

        /// Put two devices out of radio range of each other: they stop
        /// discovering one another and cannot connect. Symmetric.
        pub fn block(&self, a: &str, b: &str) {
            let mut blocked = self.blocked.lock();
            blocked.insert((a.to_string(), b.to_string()));
            blocked.insert((b.to_string(), a.to_string()));
        }

        fn is_blocked(&self, a: &DeviceRef, b: &DeviceRef) -> bool {
            self.blocked.lock().contains(&(a.clone(), b.clone()))
        }

        /// Simulate radio loss for a device: it stops being discoverable and
        /// writes toward it fail.
        pub fn set_reachable(&self, name: &str, reachable: bool) {
            if let Some(endpoint) = self.inner.lock().get_mut(name) {
                endpoint.reachable = reachable;
            }
            self.push_discoveries();
        }

        fn push_discoveries(&self) {
            let blocked = self.blocked.lock().clone();
            let mut inner = self.inner.lock();
            let snapshot: Vec<(DeviceRef, Vec<Uuid>)> = inner
                .iter()
                .filter(|(_, e)| e.reachable)
                .map(|(name, e)| (name.clone(), e.advertised.clone()))
                .collect();
            for (scanner_name, endpoint) in inner.iter_mut() {
                if !endpoint.reachable {
                    continue;
                }
                let Some(tx) = endpoint.discovery_tx.clone() else {
                    continue;
                };
                for (advertiser, uuids) in &snapshot {
                    if advertiser == scanner_name || blocked.contains(&(advertiser.clone(), scanner_name.clone())) {
                        continue;
                    }
                    for uuid in uuids {
                        if endpoint.scanning.contains(uuid) {
                            let _ = tx.try_send(Discovery {
                                device: advertiser.clone(),
                                service_uuid: *uuid,
                                rssi: Some(-40),
                            });
                        }
                    }
                }
            }
        }

        fn is_reachable(&self, name: &DeviceRef) -> bool {
            self.inner.lock().get(name).is_some_and(|e| e.reachable)
        }
    }

    /// Per-endpoint handle implementing [`BlePlatform`].
    pub struct LoopbackPlatform {
        bus: LoopbackBus,
        name: DeviceRef,
        accept_rx: Mutex<Option<mpsc::Receiver<ConnectRequest>>>,
    }

    struct LoopbackConnection {
        bus: LoopbackBus,
        remote: DeviceRef,
        outbound: mpsc::Sender<Vec<u8>>,
        notifications: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl BleConnection for LoopbackConnection {
        fn device(&self) -> DeviceRef {
            self.remote.clone()
        }

        fn mtu(&self) -> usize {
            LOOPBACK_MTU
        }

        async fn write(&self, bytes: &[u8]) -> Result<(), MeshError> {
            if !self.bus.is_reachable(&self.remote) {
                return Err(MeshError::NotConnected(self.remote.clone()));
            }
            // Deliver in MTU-sized notification chunks like a real stack.
            for chunk in bytes.chunks(LOOPBACK_MTU) {
                self.outbound
                    .send(chunk.to_vec())
                    .await
                    .map_err(|_| MeshError::NotConnected(self.remote.clone()))?;
            }
            Ok(())
        }

        async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, MeshError> {
            self.notifications
                .lock()
                .take()
                .ok_or_else(|| MeshError::Platform("notifications already taken".into()))
        }

        async fn disconnect(&self) {}
    }

    #[async_trait::async_trait]
    impl BlePlatform for LoopbackPlatform {
        async fn advertise(
            &self,
            service_uuids: &[Uuid],
            _characteristic: Uuid,
        ) -> Result<(), MeshError> {
            if let Some(endpoint) = self.bus.inner.lock().get_mut(&self.name) {
                endpoint.advertised = service_uuids.to_vec();
            }
            self.bus.push_discoveries();
            Ok(())
        }

        async fn scan(
            &self,
            service_uuids: &[Uuid],
        ) -> Result<mpsc::Receiver<Discovery>, MeshError> {
            let (tx, rx) = mpsc::channel(64);
            if let Some(endpoint) = self.bus.inner.lock().get_mut(&self.name) {
                endpoint.scanning = service_uuids.to_vec();
                endpoint.discovery_tx = Some(tx);
            }
            self.bus.push_discoveries();
            Ok(rx)
        }

        async fn connect(&self, device: &DeviceRef) -> Result<Box<dyn BleConnection>, MeshError> {
            if self.bus.is_blocked(&self.name, device) {
                return Err(MeshError::NotConnected(device.clone()));
            }
            let accept_tx = {
                let inner = self.bus.inner.lock();
                let endpoint = inner
                    .get(device)
                    .filter(|e| e.reachable)
                    .ok_or_else(|| MeshError::NotConnected(device.clone()))?;
                endpoint.accept_tx.clone()
            };

            let (to_initiator_tx, to_initiator_rx) = mpsc::channel::<Vec<u8>>(256);
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            accept_tx
                .send(ConnectRequest {
                    from: self.name.clone(),
                    to_initiator: to_initiator_tx,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| MeshError::NotConnected(device.clone()))?;
            let to_acceptor = reply_rx
                .await
                .map_err(|_| MeshError::NotConnected(device.clone()))?;

            Ok(Box::new(LoopbackConnection {
                bus: self.bus.clone(),
                remote: device.clone(),
                outbound: to_acceptor,
                notifications: Mutex::new(Some(to_initiator_rx)),
            }))
        }

        async fn accept_connections(
            &self,
        ) -> Result<mpsc::Receiver<IncomingConnection>, MeshError> {
            let mut accept_rx = self
                .accept_rx
                .lock()
                .take()
                .ok_or_else(|| MeshError::Platform("acceptor already taken".into()))?;
            let (incoming_tx, incoming_rx) = mpsc::channel(16);
            let bus = self.bus.clone();
            tokio::spawn(async move {
                while let Some(request) = accept_rx.recv().await {
                    let (notify_tx, notify_rx) = mpsc::channel::<Vec<u8>>(256);
                    if request.reply.send(notify_tx).is_err() {
                        continue;
                    }
                    let connection = LoopbackConnection {
                        bus: bus.clone(),
                        remote: request.from.clone(),
                        outbound: request.to_initiator,
                        notifications: Mutex::new(Some(notify_rx)),
                    };
                    let incoming = IncomingConnection {
                        from: request.from,
                        connection: Box::new(connection),
                    };
                    if incoming_tx.send(incoming).await.is_err() {
                        break;
                    }
                }
            });
            Ok(incoming_rx)
        }

        async fn shutdown(&self) {
            if let Some(endpoint) = self.bus.inner.lock().get_mut(&self.name) {
                endpoint.advertised.clear();
                endpoint.scanning.clear();
                endpoint.discovery_tx = None;
            }
        }
    }
}
