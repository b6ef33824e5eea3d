//! # gapmesh-wire
//!
//! Binary wire protocol for the gapmesh chat core.
//!
//! This crate provides:
//! - Packet encoding and decoding with zlib payload compression
//! - PKCS#7-style transmission padding to standard block sizes
//! - Fragmentation and reassembly of oversized packets
//! - A per-connection byte-stream framer for notification transports
//! - A bounded seen-ID set for flood deduplication
//!
//! Everything here is reentrant and pure-computational; any number of tasks
//! may call into it. The [`Deduplicator`] is additionally thread-safe for
//! shared use.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod padding;

pub use assembler::{AppendOutcome, AssemblerConfig, StreamAssembler, MIN_FRAMING_PREFIX};
pub use codec::{decode, decode_with_limit, encode, frame_length, signable_bytes, DEFAULT_MAX_PAYLOAD};
pub use dedup::{broadcast_fingerprint, fragment_fingerprint, Deduplicator};
pub use error::WireError;
pub use fragment::{split, FragmentHeader, Reassembler, FRAGMENT_HEADER_SIZE, TRANSFER_ID_SIZE};
pub use packet::{
    MessageType, Packet, PacketFlags, PeerId, HEADER_SIZE_V1, HEADER_SIZE_V2, MAX_TTL,
    PEER_ID_SIZE, SIGNATURE_SIZE,
};
