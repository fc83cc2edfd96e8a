//! Word copies across the wrap point of the data region

/// Copy `src` into `ring` starting at `start`, wrapping at the end.
///
/// `start` must be `< ring.len()` and `src.len() <= ring.len()`.
pub(crate) fn copy_into(ring: &mut [u32], start: usize, src: &[u32]) {
    debug_assert!(start < ring.len() && src.len() <= ring.len());
    let tail = (ring.len() - start).min(src.len());
    ring[start..start + tail].copy_from_slice(&src[..tail]);
    let rest = src.len() - tail;
    if rest > 0 {
        ring[..rest].copy_from_slice(&src[tail..]);
    }
}

/// Copy `dst.len()` words out of `ring` starting at `start`, wrapping at the end.
pub(crate) fn copy_out(ring: &[u32], start: usize, dst: &mut [u32]) {
    debug_assert!(start < ring.len() && dst.len() <= ring.len());
    let tail = (ring.len() - start).min(dst.len());
    dst[..tail].copy_from_slice(&ring[start..start + tail]);
    let rest = dst.len() - tail;
    if rest > 0 {
        dst[tail..].copy_from_slice(&ring[..rest]);
    }
}

/// Word at logical position `pos` (any value, reduced modulo capacity).
pub(crate) fn word_at(ring: &[u32], pos: u64) -> u32 {
    ring[(pos % ring.len() as u64) as usize]
}

/// Store `value` at logical position `pos`.
pub(crate) fn set_word_at(ring: &mut [u32], pos: u64, value: u32) {
    let len = ring.len() as u64;
    ring[(pos % len) as usize] = value;
}
