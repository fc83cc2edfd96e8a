//! Linux-specific process and signal helpers

use evbuf::shm::consts::SHM_DIR;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::getpid;
use std::path::PathBuf;
use std::sync::Once;

static SIGPIPE_IGNORED: Once = Once::new();

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal tests for existence without delivering anything
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Ignore `SIGPIPE` for the whole process, once.
///
/// Writes to a socket whose peer went away then fail with `EPIPE` instead of
/// killing the process.
pub fn ignore_sigpipe() {
    SIGPIPE_IGNORED.call_once(|| {
        // SAFETY: installing SIG_IGN does not run any handler code.
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            tracing::warn!("Could not ignore SIGPIPE: {}", e);
        }
    });
}

/// Filesystem path backing a POSIX shm object on Linux.
pub fn shm_object_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let pid = get_current_pid();
        assert!(pid > 0);
        assert!(is_process_alive(pid));
    }

    #[test]
    fn test_ignore_sigpipe_is_idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
    }

    #[test]
    fn test_shm_path_is_under_dev_shm() {
        assert_eq!(
            shm_object_path("evbuf_x"),
            PathBuf::from("/dev/shm/evbuf_x")
        );
    }
}
