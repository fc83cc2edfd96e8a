//! # evbuf Shared Memory Event Transport
//!
//! Multi-process transport for opaque event records. The centrepiece is a
//! fixed-capacity ring buffer living in a named POSIX shared-memory
//! segment, coordinated by a process-shared mutex and condition variable
//! stored in the same segment. Any number of writer and reader processes
//! attach by name; records come out in the order they were committed and
//! each record is delivered to exactly one reader.
//!
//! ## Features
//!
//! - **Blocking flow control**: writers wait for space, readers wait for data
//! - **Serial ordering**: concurrent writers can commit in a fixed order
//! - **Robust locking**: a writer or reader dying with the lock held does
//!   not wedge its peers
//! - **Wraparound records**: records may straddle the end of the data region
//! - **Companions**: a semaphore-guarded segment for monitoring data and a
//!   length-prefixed TCP transport carrying the same records between hosts
//!
//! ## Segment Layout
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬───────────────────────────────┐
//! │  mutex   │ condvar  │ RingHeader │ [len][payload…][len][payload…]│
//! └──────────┴──────────┴────────────┴───────────────────────────────┘
//!                            │ words_in / words_out / counts / run
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use evbuf_shared_memory::SharedEventBuffer;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Producer
//! let ring = SharedEventBuffer::open("evbuf_demo", 1 << 16, true)?;
//! ring.write(&[10, 20, 30], false, None)?;
//!
//! // Consumer, usually another process
//! let ring = SharedEventBuffer::open("evbuf_demo", 1 << 16, false)?;
//! let (record, info) = ring.read_record(false)?;
//! assert_eq!(record, vec![10, 20, 30]);
//! assert_eq!(info.count, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ShmError>`:
//!
//! ```rust,no_run
//! use evbuf_shared_memory::{SharedEventBuffer, ShmError};
//!
//! match SharedEventBuffer::open("evbuf_demo", 4096, false) {
//!     Ok(ring) => { /* use ring */ }
//!     Err(ShmError::CapacityMismatch { expected, found, .. }) => {
//!         eprintln!("Ring has {} words, this process expects {}", found, expected);
//!     }
//!     Err(e) => eprintln!("Unexpected error: {}", e),
//! }
//! ```
//!
//! ## Lifecycle
//!
//! Segments outlive the processes that use them. Dropping or closing a
//! handle only unmaps it; [`SharedEventBuffer::unlink`] removes the name and
//! is meant for administrative code paths.

#![deny(missing_docs)]
#![warn(clippy::all)]

mod circular;
pub mod discovery;
pub mod error;
pub mod guarded;
pub mod header;
pub mod platform;
pub mod relay;
pub mod ring;
pub mod segment;
pub mod stream;
pub mod sync;

pub use discovery::{SegmentInfo, find_segment, list_segments};
pub use error::{ShmError, ShmResult};
pub use guarded::{SegmentIds, SemaphoreSegment};
pub use header::{HeaderSnapshot, RunInfo};
pub use relay::{RelayStats, drain_to_stream, fill_from_stream};
pub use ring::{BufferGuard, BufferOptions, ReadInfo, SharedEventBuffer};
pub use segment::SharedMemory;
pub use stream::{RetryPolicy, StreamListener, StreamSocket};

/// Initialize tracing from `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
