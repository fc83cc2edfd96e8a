//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all evbuf applications.
//!
//! # Usage
//!
//! ```rust,no_run
//! use evbuf_common::config::{ConfigLoader, EvbufConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = EvbufConfig::load(Path::new("evbuf.toml"))?;
//!     config.validate()?;
//!     println!("Segment prefix: {}", config.buffer.prefix);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_ATTACH_TIMEOUT_MS, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PREFIX, DEFAULT_RETRY_INTERVAL_MS,
    DEFAULT_STREAM_PORT,
};
use crate::shm::consts::{DEFAULT_CAPACITY_WORDS, MAX_CAPACITY_WORDS, MIN_CAPACITY_WORDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// configuration files.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Represents the verbosity level of logging output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all evbuf applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "evbuf-ctl"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[buffer]` section: the shared-memory ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferSection {
    /// Segment name prefix; the full name is `<prefix>_<user>_<node>`.
    pub prefix: String,
    /// Data-region size in 32-bit words. Every attaching process must agree.
    pub capacity_words: usize,
    /// Discard any existing segment and create a fresh one on open.
    pub recreate: bool,
    /// Create the embedded mutex as a robust (owner-death aware) mutex.
    pub robust: bool,
    /// How long an attaching process waits for the creator to finish
    /// initialisation.
    pub attach_timeout_ms: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            capacity_words: DEFAULT_CAPACITY_WORDS,
            recreate: false,
            robust: true,
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
        }
    }
}

impl BufferSection {
    /// Attach timeout as a `Duration`.
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

/// `[stream]` section: the length-prefixed TCP transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSection {
    /// Peer host for client connections, bind address for servers.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Pause between reconnect attempts.
    pub retry_interval_ms: u64,
    /// Give up after this many failed attempts; `0` retries forever.
    pub max_retries: u32,
    /// Reject frames whose announced length exceeds this many bytes.
    pub max_frame_bytes: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_STREAM_PORT,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_retries: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl StreamSection {
    /// `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Retry interval as a `Duration`.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// `[guarded]` section: the semaphore-guarded monitoring segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardedSection {
    /// Directory holding the id-mapping files.
    pub id_dir: PathBuf,
    /// Segment size in bytes.
    pub size_bytes: usize,
}

impl Default for GuardedSection {
    fn default() -> Self {
        Self {
            id_dir: std::env::temp_dir(),
            size_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Complete configuration for an evbuf process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "evbuf-ctl"
///
/// [buffer]
/// capacity_words = 1048576
///
/// [stream]
/// port = 5101
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvbufConfig {
    /// Common settings.
    pub shared: SharedConfig,
    /// Ring buffer settings.
    #[serde(default)]
    pub buffer: BufferSection,
    /// Stream transport settings.
    #[serde(default)]
    pub stream: StreamSection,
    /// Guarded segment settings.
    #[serde(default)]
    pub guarded: GuardedSection,
}

impl EvbufConfig {
    /// Configuration with every section at its default.
    pub fn with_service_name(service_name: &str) -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::default(),
                service_name: service_name.to_string(),
            },
            buffer: BufferSection::default(),
            stream: StreamSection::default(),
            guarded: GuardedSection::default(),
        }
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.buffer.prefix.is_empty() || self.buffer.prefix.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "buffer.prefix must be non-empty and contain no '/': {:?}",
                self.buffer.prefix
            )));
        }
        if !(MIN_CAPACITY_WORDS..=MAX_CAPACITY_WORDS).contains(&self.buffer.capacity_words) {
            return Err(ConfigError::ValidationError(format!(
                "buffer.capacity_words must be in {MIN_CAPACITY_WORDS}..={MAX_CAPACITY_WORDS}, got {}",
                self.buffer.capacity_words
            )));
        }
        if self.stream.port == 0 {
            return Err(ConfigError::ValidationError(
                "stream.port cannot be 0".to_string(),
            ));
        }
        if self.stream.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "stream.max_frame_bytes cannot be 0".to_string(),
            ));
        }
        if self.guarded.size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "guarded.size_bytes cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
