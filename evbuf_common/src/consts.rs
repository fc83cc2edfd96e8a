//! Workspace-wide defaults.
//!
//! Single source of truth for default names, ports and paths.
//! Imported by all crates; do not duplicate these values elsewhere.

/// Default prefix for named shared-memory segments.
pub const DEFAULT_PREFIX: &str = "evbuf";

/// Default TCP port for the event stream transport.
pub const DEFAULT_STREAM_PORT: u16 = 5101;

/// Default interval between client reconnect attempts, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

/// Default upper bound on a single stream frame (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Default time an attaching process waits for the creator to finish
/// initialising a segment, in milliseconds.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 1000;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/evbuf/evbuf.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        assert!(!DEFAULT_PREFIX.is_empty());
        assert!(!DEFAULT_PREFIX.contains('/'));
        assert!(DEFAULT_STREAM_PORT > 0);
        assert!(DEFAULT_RETRY_INTERVAL_MS > 0);
        assert!(DEFAULT_MAX_FRAME_BYTES >= 4);
    }
}
