//! Prelude module for common re-exports.
//!
//! ```rust
//! use evbuf_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    BufferSection, ConfigError, ConfigLoader, EvbufConfig, GuardedSection, LogLevel, SharedConfig,
    StreamSection,
};

// ─── Shared Memory ──────────────────────────────────────────────────
pub use crate::shm::consts::{
    DEFAULT_CAPACITY_WORDS, MAX_CAPACITY_WORDS, MIN_CAPACITY_WORDS, WORD_SIZE,
};
pub use crate::shm::naming::segment_name;
