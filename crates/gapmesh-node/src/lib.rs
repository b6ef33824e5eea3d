//! # gapmesh-node
//!
//! Application-facing core of the gapmesh chat system.
//!
//! This crate provides:
//! - The [`Transport`] capability the Router depends on, with the mesh and
//!   relay transports plugged in behind it
//! - The [`Router`]: per-peer transport choice and the bounded outbox
//! - The [`FavoritesStore`] and the mutual-favorite relay eligibility rule
//! - The injected host services (keychain, clock, random, notifier)
//! - The [`SessionController`], the only surface applications see
//! - Slash-command and share-link parsing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod controller;
pub mod error;
pub mod favorites;
pub mod payload;
pub mod router;
pub mod services;
pub mod transport;

pub use commands::{parse_command, parse_share_link, Command};
pub use controller::{
    load_or_create_identity, ControllerConfig, ControllerEvent, SessionController,
};
pub use error::NodeError;
pub use favorites::{FavoriteRecord, FavoritesChange, FavoritesStore};
pub use payload::{FavoriteNotification, PrivatePayload, MESSAGE_ID_LEN};
pub use router::{
    OutboxEntry, Router, RouterEvent, SendOutcome, DEFAULT_MAX_AGE, DEFAULT_OUTBOX_CAPACITY,
};
pub use services::{
    Clock, ClockAdapter, Keychain, MemoryKeychain, Notifier, NullNotifier, OsRandom, Random,
    Services, SystemClock, KEY_FAVORITES, KEY_SIGNING_IDENTITY, KEY_STATIC_IDENTITY,
};
pub use transport::{RelayCapability, Transport, TransportKind};
