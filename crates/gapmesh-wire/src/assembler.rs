//! Per-connection byte-stream framer for BLE notifications.
//!
//! Notifications deliver arbitrarily chunked bytes. One assembler per
//! connection turns that stream back into whole encoded frames. On a padded
//! stream (every gapmesh BLE link) the pad decision is a pure function of
//! the frame length, so after draining a frame the assembler knows exactly
//! how many fill bytes follow and sheds them without inspecting their
//! (random) content. Prefix-byte drops are reserved for genuine desync
//! noise, and a reset discards the buffer outright when its state can no
//! longer be trusted.

use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::codec;
use crate::packet::{HEADER_SIZE_V1, PEER_ID_SIZE};
use crate::padding;

/// Minimum bytes before the assembler attempts to frame: v1 header + sender.
pub const MIN_FRAMING_PREFIX: usize = HEADER_SIZE_V1 + PEER_ID_SIZE;

/// Assembler tuning knobs.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Hard cap on a single frame and on buffered bytes.
    pub max_frame: usize,
    /// How long a partial frame may sit without growing before a reset.
    pub stall_threshold: Duration,
    /// The sender pads every frame to a standard block
    /// ([`crate::padding::pad`]); shed each frame's fill deterministically.
    /// Off, the stream is taken as bare concatenated frames.
    pub padded_stream: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            // Largest payload plus every optional section, with headroom.
            max_frame: codec::DEFAULT_MAX_PAYLOAD + 256,
            stall_threshold: Duration::from_millis(1500),
            padded_stream: false,
        }
    }
}

/// What one `append` call produced.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Whole encoded frames, in stream order
    pub frames: Vec<Vec<u8>>,
    /// Garbage bytes dropped from the front of the buffer
    pub dropped_prefix: usize,
    /// True when the assembler discarded its buffer this call
    pub did_reset: bool,
}

/// Streaming frame assembler. One instance per connection.
pub struct StreamAssembler {
    buffer: Vec<u8>,
    partial: Option<(usize, Instant)>,
    // Transmission-padding bytes still owed to the last emitted frame.
    pending_padding: usize,
    config: AssemblerConfig,
}

impl StreamAssembler {
    /// Assembler with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AssemblerConfig::default())
    }

    /// Assembler with explicit tuning.
    #[must_use]
    pub fn with_config(config: AssemblerConfig) -> Self {
        Self {
            buffer: Vec::new(),
            partial: None,
            pending_padding: 0,
            config,
        }
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one notification chunk, harvesting whatever frames complete.
    pub fn append(&mut self, chunk: &[u8], now: Instant) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        self.buffer.extend_from_slice(chunk);

        loop {
            // Shed the previous frame's padding before looking for a header.
            if self.pending_padding > 0 {
                let shed = self.pending_padding.min(self.buffer.len());
                self.buffer.drain(..shed);
                self.pending_padding -= shed;
                if self.pending_padding > 0 {
                    break; // rest of the padding has not arrived yet
                }
            }
            if self.buffer.len() < MIN_FRAMING_PREFIX {
                break;
            }

            let version = self.buffer[0];
            if !codec::is_supported_version(version) {
                if self.partial.is_some() {
                    // A frame start we already validated cannot stop being
                    // one; the buffer is corrupted.
                    self.reset(&mut outcome, "invalid version mid-frame");
                    break;
                }
                self.buffer.remove(0);
                outcome.dropped_prefix += 1;
                continue;
            }

            let total = match codec::frame_length(&self.buffer, self.config.max_frame) {
                Ok(Some(total)) => total,
                Ok(None) => break, // header itself incomplete; wait
                Err(_) => {
                    self.reset(&mut outcome, "declared frame exceeds cap");
                    break;
                }
            };

            if self.buffer.len() < total {
                match self.partial {
                    Some((expected, since)) if expected == total => {
                        if now.duration_since(since) >= self.config.stall_threshold {
                            self.reset(&mut outcome, "partial frame stalled");
                        }
                    }
                    _ => self.partial = Some((total, now)),
                }
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            trace!(len = frame.len(), "assembled frame");
            if self.config.padded_stream {
                // The sender padded this frame to a block boundary; the
                // extent is determined by the frame length alone.
                self.pending_padding = padding::padded_extent(total) - total;
            }
            outcome.frames.push(frame);
            self.partial = None;
        }

        // Leftover bytes that cannot belong to any legal frame mean the
        // stream is garbage beyond recovery by prefix drops.
        if self.buffer.len() > self.config.max_frame {
            self.reset(&mut outcome, "buffer exceeds hard cap");
        }

        outcome
    }

    fn reset(&mut self, outcome: &mut AppendOutcome, reason: &str) {
        warn!(buffered = self.buffer.len(), reason, "stream assembler reset");
        self.buffer.clear();
        self.partial = None;
        self.pending_padding = 0;
        outcome.did_reset = true;
    }
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageType, Packet, PeerId};

    fn frame(n: u8, payload_len: usize) -> Vec<u8> {
        codec::encode(&Packet::broadcast(
            MessageType::Message,
            PeerId::from_bytes([n; 8]),
            1_700_000_000_000 + u64::from(n),
            3,
            vec![n; payload_len],
        ))
    }

    fn padded_assembler() -> StreamAssembler {
        StreamAssembler::with_config(AssemblerConfig {
            padded_stream: true,
            ..AssemblerConfig::default()
        })
    }

    #[test]
    fn single_chunk_single_frame() {
        let mut assembler = StreamAssembler::new();
        let encoded = frame(1, 40);
        let outcome = assembler.append(&encoded, Instant::now());
        assert_eq!(outcome.frames, vec![encoded]);
        assert_eq!(outcome.dropped_prefix, 0);
        assert!(!outcome.did_reset);
    }

    #[test]
    fn arbitrary_chunking_preserves_order() {
        let stream: Vec<u8> = [frame(1, 33), frame(2, 7), frame(3, 90)].concat();
        // Try several chunk sizes, byte-by-byte included.
        for chunk_size in [1usize, 2, 5, 20, 64, 1024] {
            let mut assembler = StreamAssembler::new();
            let now = Instant::now();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(assembler.append(chunk, now).frames);
            }
            assert_eq!(frames, vec![frame(1, 33), frame(2, 7), frame(3, 90)]);
        }
    }

    #[test]
    fn garbage_prefix_dropped() {
        let mut assembler = StreamAssembler::new();
        let mut stream = vec![0xFFu8, 0xEE, 0x00];
        let encoded = frame(4, 10);
        stream.extend_from_slice(&encoded);
        let outcome = assembler.append(&stream, Instant::now());
        assert_eq!(outcome.dropped_prefix, 3);
        assert_eq!(outcome.frames, vec![encoded]);
    }

    #[test]
    fn padding_between_frames_is_shed() {
        // Padded frames back to back, under every chunking: the random fill
        // bytes must never cost a frame, a prefix drop, or a reset.
        let first = frame(5, 30);
        let second = frame(6, 55);
        let third = frame(7, 12);
        let stream: Vec<u8> = [
            crate::padding::pad(&first),
            crate::padding::pad(&second),
            crate::padding::pad(&third),
        ]
        .concat();
        for chunk_size in [1usize, 3, 17, 64, 185, 300, 4096] {
            let mut assembler = padded_assembler();
            let now = Instant::now();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                let outcome = assembler.append(chunk, now);
                assert!(!outcome.did_reset, "chunk size {chunk_size}");
                assert_eq!(outcome.dropped_prefix, 0, "chunk size {chunk_size}");
                frames.extend(outcome.frames);
            }
            assert_eq!(
                frames,
                vec![first.clone(), second.clone(), third.clone()],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn padding_arriving_late_is_still_shed() {
        // The padding of frame one straggles in a separate chunk; the next
        // frame must survive untouched.
        let first = frame(8, 20);
        let second = frame(9, 20);
        let padded = crate::padding::pad(&first);
        let now = Instant::now();
        let mut assembler = padded_assembler();

        let outcome = assembler.append(&padded[..first.len() + 10], now);
        assert_eq!(outcome.frames, vec![first.clone()]);
        let mut frames = Vec::new();
        frames.extend(assembler.append(&padded[first.len() + 10..], now).frames);
        let outcome = assembler.append(&second, now);
        frames.extend(outcome.frames);
        assert!(!outcome.did_reset);
        assert_eq!(outcome.dropped_prefix, 0);
        assert_eq!(frames, vec![second]);
    }

    #[test]
    fn oversize_declared_length_resets() {
        let mut assembler = StreamAssembler::with_config(AssemblerConfig {
            max_frame: 512,
            ..AssemblerConfig::default()
        });
        let mut encoded = frame(7, 10);
        // Corrupt the declared payload length far past the cap.
        encoded[12] = 0xFF;
        encoded[13] = 0xFF;
        let outcome = assembler.append(&encoded, Instant::now());
        assert!(outcome.did_reset);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn stalled_partial_frame_resets() {
        let mut assembler = StreamAssembler::new();
        let encoded = frame(8, 95);
        let start = Instant::now();
        let outcome = assembler.append(&encoded[..encoded.len() - 5], start);
        assert!(outcome.frames.is_empty());
        assert!(!outcome.did_reset);
        // Still stalled past the threshold: reset on the next touch.
        let outcome = assembler.append(&[], start + Duration::from_millis(1600));
        assert!(outcome.did_reset);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn partial_frame_completing_in_time_survives() {
        let mut assembler = StreamAssembler::new();
        let encoded = frame(9, 100);
        let start = Instant::now();
        assert!(assembler
            .append(&encoded[..50], start)
            .frames
            .is_empty());
        let outcome = assembler.append(&encoded[50..], start + Duration::from_millis(200));
        assert_eq!(outcome.frames, vec![encoded]);
        assert!(!outcome.did_reset);
    }
}
