//! evbuf Common Library
//!
//! This crate provides shared constants, OS-resource naming and
//! configuration loading utilities for all evbuf workspace crates.
//!
//! # Module Structure
//!
//! - [`shm`] - Shared memory constants and segment naming
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Workspace-wide defaults
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! evbuf = { package = "evbuf_common", path = "../evbuf_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use evbuf_common::shm::consts::*;
//! use evbuf_common::config::{ConfigLoader, EvbufConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod shm;
