//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment name is empty or contains characters the OS rejects
    #[error("Invalid segment name: {name:?}")]
    InvalidName {
        /// Offending name
        name: String,
    },

    /// Ring capacity outside the supported range
    #[error("Invalid ring capacity: {capacity_words} words")]
    InvalidCapacity {
        /// Requested capacity in words
        capacity_words: usize,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Existing OS object has a different size than requested
    #[error("Segment {name} is {found} bytes, expected {expected}")]
    SizeMismatch {
        /// Segment name
        name: String,
        /// Size this process asked for
        expected: usize,
        /// Size found on the existing object
        found: usize,
    },

    /// Attaching process disagrees with the creator about the capacity
    #[error("Segment {name} has capacity {found} words, expected {expected}")]
    CapacityMismatch {
        /// Segment name
        name: String,
        /// Capacity this process asked for
        expected: usize,
        /// Capacity recorded in the segment header
        found: usize,
    },

    /// Creator never finished initialising the segment
    #[error("Segment {name} was not initialised in time")]
    NotInitialized {
        /// Segment name
        name: String,
    },

    /// Region requested before the segment was opened, or after close
    #[error("Segment {name} is not mapped")]
    NotMapped {
        /// Segment name
        name: String,
    },

    /// Region lies outside the segment
    #[error("Region {offset}+{len} exceeds segment size {size}")]
    OutOfBounds {
        /// Region offset in bytes
        offset: usize,
        /// Region length in bytes
        len: usize,
        /// Segment size in bytes
        size: usize,
    },

    /// Memory alignment error
    #[error("Memory alignment error: address {address:#x} not aligned to {alignment}")]
    AlignmentError {
        /// Memory address
        address: usize,
        /// Required alignment
        alignment: usize,
    },

    /// Zero-length records cannot be stored
    #[error("Record has no payload words")]
    EmptyRecord,

    /// Record can never fit in the ring
    #[error("Record of {words} words exceeds the maximum of {max} words")]
    RecordTooLarge {
        /// Payload words requested
        words: usize,
        /// Largest payload the ring accepts
        max: usize,
    },

    /// Caller buffer is shorter than the next record
    #[error("Record of {needed} words does not fit a {available}-word buffer")]
    BufferTooSmall {
        /// Payload words in the pending record
        needed: usize,
        /// Words available in the caller buffer
        available: usize,
    },

    /// Synchronisation primitive reported an unexpected error
    #[error("{op} failed: {source}")]
    Sync {
        /// Failed operation
        op: &'static str,
        /// Error code returned by the primitive
        source: nix::Error,
    },

    /// Robust mutex was left unrecoverable by a dead owner
    #[error("Mutex in segment {name} is not recoverable")]
    LockNotRecoverable {
        /// Segment name
        name: String,
    },

    /// Segment or id-mapping file not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Peer announced a frame larger than the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Peer closed the stream
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Client gave up connecting
    #[error("Could not connect to {addr} after {attempts} attempts")]
    ConnectFailed {
        /// Target address
        addr: String,
        /// Attempts made
        attempts: u32,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// Build a `Sync` error from a pthread-style return code.
    pub(crate) fn sync(op: &'static str, code: i32) -> Self {
        Self::Sync {
            op,
            source: nix::Error::from_raw(code),
        }
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
