//! Names for host-global OS resources.
//!
//! POSIX shared-memory objects and System V id files live in a namespace
//! shared by every process on the host. Names are built as
//! `<prefix>_<user>_<node>` so unrelated users and applications on the
//! same machine do not collide.

use nix::sys::utsname::uname;
use nix::unistd::{User, getuid};

/// Name of the user owning the current process.
///
/// Falls back to the numeric uid when the passwd entry cannot be resolved.
pub fn current_user() -> String {
    let uid = getuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.as_raw().to_string(),
    }
}

/// Node (host) name of the machine, or `"localhost"` if it cannot be read.
pub fn node_name() -> String {
    uname()
        .map(|uts| uts.nodename().to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Build `<prefix>_<user>_<node>` for the current process.
pub fn segment_name(prefix: &str) -> String {
    segment_name_for(prefix, &current_user(), &node_name())
}

/// Build `<prefix>_<user>_<node>` from explicit parts.
///
/// Characters that are not valid inside a POSIX shm name (`/`, whitespace,
/// NUL) are replaced with `_`.
pub fn segment_name_for(prefix: &str, user: &str, node: &str) -> String {
    let raw = format!("{prefix}_{user}_{node}");
    sanitize(&raw)
}

/// Replace characters that would break a POSIX shm object name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '/' || c == '\0' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect()
}
