//! Shared memory subsystem.
//!
//! This module contains:
//! - `consts`: word size, layout alignment and segment size limits.
//! - `naming`: `<prefix>_<user>_<node>` names for host-global OS resources.

pub mod consts;
pub mod naming;
