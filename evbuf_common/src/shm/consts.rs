//! SHM (Shared Memory) constants.
//!
//! These constants define the fundamental parameters for the evbuf shared
//! memory system. They are the single source of truth - all other crates
//! should import from here.

/// Size of one ring-buffer word in bytes (`u32`).
pub const WORD_SIZE: usize = 4;

/// Smallest usable ring capacity in words.
///
/// A record needs its length word, at least one payload word, and the ring
/// always keeps one word free, so three words is the floor.
pub const MIN_CAPACITY_WORDS: usize = 3;

/// Bytes reserved ahead of the data region for the mutex, condvar and header.
pub const CONTROL_PLANE_MAX_BYTES: usize = 4096;

/// Largest ring capacity in words that still fits in [`SHM_MAX_SIZE`].
pub const MAX_CAPACITY_WORDS: usize = (SHM_MAX_SIZE - CONTROL_PLANE_MAX_BYTES) / WORD_SIZE;

/// Default ring capacity in words (16 MiB of data).
pub const DEFAULT_CAPACITY_WORDS: usize = 4 * 1024 * 1024;

/// Maximum shared memory segment size in bytes.
///
/// Set to 1GB as a reasonable upper limit to prevent excessive memory usage.
pub const SHM_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// CPU cache line size in bytes.
///
/// Control-plane regions inside a segment start on cache-line boundaries.
pub const CACHE_LINE_SIZE: usize = 64;

/// Directory where Linux exposes POSIX shared-memory objects.
pub const SHM_DIR: &str = "/dev/shm";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_size_matches_u32() {
        assert_eq!(WORD_SIZE, std::mem::size_of::<u32>());
    }

    #[test]
    fn test_shm_max_size_is_1gb() {
        assert_eq!(SHM_MAX_SIZE, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_cache_line_size() {
        assert_eq!(CACHE_LINE_SIZE, 64);
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_capacity_constraints() {
        assert!(MIN_CAPACITY_WORDS < DEFAULT_CAPACITY_WORDS);
        assert!(DEFAULT_CAPACITY_WORDS * WORD_SIZE < SHM_MAX_SIZE);
        assert!(DEFAULT_CAPACITY_WORDS <= MAX_CAPACITY_WORDS);
        assert!(MAX_CAPACITY_WORDS * WORD_SIZE + CONTROL_PLANE_MAX_BYTES <= SHM_MAX_SIZE);
    }
}
