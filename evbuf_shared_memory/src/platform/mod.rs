//! Platform-specific helpers

pub mod linux;

pub use linux::{get_current_pid, ignore_sigpipe, is_process_alive, shm_object_path};
