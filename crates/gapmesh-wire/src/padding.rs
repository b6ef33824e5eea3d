//! PKCS#7-style transmission padding.
//!
//! Encoded frames are right-padded to the smallest standard block before a
//! BLE write so an observer learns only a size bucket. The fill bytes are
//! random; the final byte carries the pad count, which caps a single pad run
//! at 255 bytes. Frames that would need more padding than that, or that
//! exceed the largest block, go out unpadded (oversized frames are
//! fragmented instead).

use rand::RngCore;

/// Standard block sizes, smallest first.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Largest block; frames beyond this are never padded.
pub const MAX_BLOCK_SIZE: usize = 2048;

/// The smallest standard block that fits `len` plus at least one pad byte.
#[must_use]
pub fn optimal_block_size(len: usize) -> Option<usize> {
    BLOCK_SIZES.iter().copied().find(|&block| len < block)
}

/// Pad `data` to exactly `block` bytes.
///
/// Returns the input unchanged when padding is impossible: `data` already at
/// or past the block, or more than 255 pad bytes required.
#[must_use]
pub fn pad_to(data: &[u8], block: usize) -> Vec<u8> {
    let needed = block.saturating_sub(data.len());
    if needed == 0 || needed > 255 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(block);
    out.extend_from_slice(data);
    let mut fill = vec![0u8; needed - 1];
    rand::thread_rng().fill_bytes(&mut fill);
    out.extend_from_slice(&fill);
    out.push(needed as u8);
    out
}

/// Pad `data` to the smallest standard block that fits it.
#[must_use]
pub fn pad(data: &[u8]) -> Vec<u8> {
    match optimal_block_size(data.len()) {
        Some(block) => pad_to(data, block),
        None => data.to_vec(),
    }
}

/// Total bytes a frame of length `len` occupies on the wire after [`pad`].
///
/// Mirrors the pad decision exactly, so a receiver that knows a frame's
/// length also knows where its transmission padding ends: the block
/// boundary when padding was possible, the bare length otherwise.
#[must_use]
pub fn padded_extent(len: usize) -> usize {
    match optimal_block_size(len) {
        Some(block) if block - len <= 255 => block,
        _ => len,
    }
}

/// Strip transmission padding using the final byte.
///
/// Input that does not carry a plausible pad count is returned unchanged;
/// the codec's declared framing bounds the parse either way.
#[must_use]
pub fn unpad(data: &[u8]) -> &[u8] {
    if data.is_empty() {
        return data;
    }
    let count = data[data.len() - 1] as usize;
    if count == 0 || count > data.len() {
        return data;
    }
    &data[..data.len() - count]
}
