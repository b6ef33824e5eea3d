//! # gapmesh-mesh
//!
//! BLE mesh transport for the gapmesh chat core.
//!
//! This crate provides:
//! - Hourly rotating service-UUID derivation with a boundary overlap window
//! - The injected [`platform::BlePlatform`] surface and an in-process
//!   loopback bus for tests
//! - Per-link connection lifecycle with stream reassembly and flow control
//! - TTL-bounded flood relay with deduplication
//! - Noise session integration and the announce schedule

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod platform;
pub mod rotation;
pub mod transport;

pub use connection::{Link, LinkState};
pub use error::MeshError;
pub use platform::{BleConnection, BlePlatform, DeviceRef, Discovery, IncomingConnection};
pub use rotation::{UuidRotator, CHARACTERISTIC_UUID, LEGACY_SERVICE_UUID};
pub use transport::{
    MeshConfig, MeshEvent, MeshTransport, SystemTimeSource, TimeSource,
};
