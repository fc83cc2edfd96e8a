//! Ring header and segment layout
//!
//! A ring segment is one contiguous block:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────────────────┐
//! │ mutex        │ condvar      │ RingHeader   │ data: capacity × u32     │
//! │ (64-aligned) │ (64-aligned) │ (64 bytes)   │                          │
//! └──────────────┴──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Offsets depend only on the platform's pthread type sizes, so every
//! process computes the same layout.

use evbuf::shm::consts::{CACHE_LINE_SIZE, CONTROL_PLANE_MAX_BYTES, WORD_SIZE};
use libc::{pthread_cond_t, pthread_mutex_t};
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use std::sync::atomic::AtomicU64;

/// Magic value marking a fully initialised ring header: `"EVBUFRNG"`.
pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"EVBUFRNG");

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Byte offset of the mutex.
pub const MUTEX_OFFSET: usize = 0;
/// Byte offset of the condition variable.
pub const COND_OFFSET: usize =
    MUTEX_OFFSET + align_up(std::mem::size_of::<pthread_mutex_t>(), CACHE_LINE_SIZE);
/// Byte offset of the [`RingHeader`].
pub const HEADER_OFFSET: usize =
    COND_OFFSET + align_up(std::mem::size_of::<pthread_cond_t>(), CACHE_LINE_SIZE);
/// Byte offset of the first data word.
pub const DATA_OFFSET: usize = HEADER_OFFSET + std::mem::size_of::<RingHeader>();

/// Total segment size for a ring of `capacity_words`; `None` on overflow.
pub const fn segment_size(capacity_words: usize) -> Option<usize> {
    match capacity_words.checked_mul(WORD_SIZE) {
        Some(bytes) => bytes.checked_add(DATA_OFFSET),
        None => None,
    }
}

/// Inverse of [`segment_size`]; `None` if `size_bytes` is not a ring size.
pub const fn capacity_for_size(size_bytes: usize) -> Option<usize> {
    if size_bytes < DATA_OFFSET || (size_bytes - DATA_OFFSET) % WORD_SIZE != 0 {
        return None;
    }
    Some((size_bytes - DATA_OFFSET) / WORD_SIZE)
}

/// Control-plane header stored right after the synchronisation primitives.
///
/// Every field except `magic` is only touched with the segment mutex held.
#[repr(C, align(64))]
pub struct RingHeader {
    /// [`RING_MAGIC`] once the creator finished initialisation
    pub magic: AtomicU64,
    /// Data-region size in words, fixed at creation
    pub capacity_words: u64,
    /// Experiment number of the current run
    pub exp_number: u32,
    /// Run number
    pub run_number: u32,
    /// Sub-run number
    pub subrun_number: u32,
    /// Writers currently inside `write` (not waiting)
    pub writer_count: u32,
    /// Readers currently inside `read` (not waiting)
    pub reader_count: u32,
    /// Records written so far
    pub count_in: u32,
    /// Records read so far
    pub count_out: u32,
    _reserved: u32,
    /// Cumulative words written, length words included
    pub words_in: u64,
    /// Cumulative words read, length words included
    pub words_out: u64,
}

const_assert_eq!(std::mem::size_of::<RingHeader>(), 64);
const_assert_eq!(std::mem::align_of::<RingHeader>(), 64);
const_assert_eq!(HEADER_OFFSET % CACHE_LINE_SIZE, 0);
const_assert!(DATA_OFFSET <= CONTROL_PLANE_MAX_BYTES);

impl RingHeader {
    /// Zero run info and counters; keep magic and capacity.
    pub fn reset(&mut self) {
        self.exp_number = 0;
        self.run_number = 0;
        self.subrun_number = 0;
        self.writer_count = 0;
        self.reader_count = 0;
        self.count_in = 0;
        self.count_out = 0;
        self._reserved = 0;
        self.words_in = 0;
        self.words_out = 0;
    }

    /// Words committed but not yet consumed.
    pub fn buffered_words(&self) -> u64 {
        self.words_in - self.words_out
    }

    /// Copy of the header for diagnostics.
    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            capacity_words: self.capacity_words,
            run: RunInfo {
                exp_number: self.exp_number,
                run_number: self.run_number,
                subrun_number: self.subrun_number,
            },
            writer_count: self.writer_count,
            reader_count: self.reader_count,
            count_in: self.count_in,
            count_out: self.count_out,
            words_in: self.words_in,
            words_out: self.words_out,
        }
    }

    /// Record new run identification.
    pub fn set_run(&mut self, run: RunInfo) {
        self.exp_number = run.exp_number;
        self.run_number = run.run_number;
        self.subrun_number = run.subrun_number;
    }
}

/// Run identification carried in the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Experiment number
    pub exp_number: u32,
    /// Run number
    pub run_number: u32,
    /// Sub-run number
    pub subrun_number: u32,
}

/// Consistent copy of a [`RingHeader`] taken under the mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSnapshot {
    /// Data-region size in words
    pub capacity_words: u64,
    /// Run identification
    pub run: RunInfo,
    /// Writers inside `write`
    pub writer_count: u32,
    /// Readers inside `read`
    pub reader_count: u32,
    /// Records written
    pub count_in: u32,
    /// Records read
    pub count_out: u32,
    /// Cumulative words written
    pub words_in: u64,
    /// Cumulative words read
    pub words_out: u64,
}

impl HeaderSnapshot {
    /// Words committed but not yet consumed.
    pub fn buffered_words(&self) -> u64 {
        self.words_in - self.words_out
    }

    /// Words still free for writers.
    pub fn free_words(&self) -> u64 {
        self.capacity_words.saturating_sub(self.buffered_words())
    }

    /// Records committed but not yet consumed.
    pub fn pending_records(&self) -> u32 {
        self.count_in.wrapping_sub(self.count_out)
    }

    /// Fraction of the data region in use, `0.0..1.0`.
    pub fn occupancy(&self) -> f64 {
        if self.capacity_words == 0 {
            return 0.0;
        }
        self.buffered_words() as f64 / self.capacity_words as f64
    }

    /// Whether no data is buffered.
    pub fn is_empty(&self) -> bool {
        self.words_in == self.words_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_ordered_and_aligned() {
        assert_eq!(MUTEX_OFFSET, 0);
        assert!(COND_OFFSET >= std::mem::size_of::<pthread_mutex_t>());
        assert!(HEADER_OFFSET >= COND_OFFSET + std::mem::size_of::<pthread_cond_t>());
        assert_eq!(COND_OFFSET % CACHE_LINE_SIZE, 0);
        assert_eq!(DATA_OFFSET, HEADER_OFFSET + 64);
    }

    #[test]
    fn test_size_and_capacity_are_inverse() {
        for cap in [3usize, 5, 16, 1024, 4 * 1024 * 1024] {
            assert_eq!(capacity_for_size(segment_size(cap).unwrap()), Some(cap));
        }
        assert_eq!(segment_size(usize::MAX / 2), None);
        assert_eq!(segment_size(usize::MAX / WORD_SIZE), None);
        assert_eq!(capacity_for_size(DATA_OFFSET - 1), None);
        assert_eq!(capacity_for_size(DATA_OFFSET + 3), None);
    }

    #[test]
    fn test_snapshot_derived_values() {
        let snap = HeaderSnapshot {
            capacity_words: 16,
            words_in: 12,
            words_out: 4,
            count_in: 3,
            count_out: 1,
            ..Default::default()
        };
        assert_eq!(snap.buffered_words(), 8);
        assert_eq!(snap.free_words(), 8);
        assert_eq!(snap.pending_records(), 2);
        assert!((snap.occupancy() - 0.5).abs() < f64::EPSILON);
        assert!(!snap.is_empty());
    }

    #[test]
    fn test_magic_spells_name() {
        assert_eq!(&RING_MAGIC.to_le_bytes(), b"EVBUFRNG");
    }
}
