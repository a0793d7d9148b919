//! Error types for keepsafe.
//!
//! Each component defines its own error enum next to the code that raises it.
//! [`MonitorError`] gathers them for callers that only need a single type,
//! such as the daemon startup path.
//!
//! Only startup failures (configuration, opening the registry, an empty
//! registry) are fatal. Errors raised while a pass is running are kept per
//! path in [`PassFailure`](crate::monitor::PassFailure) and logged.

use thiserror::Error;

use crate::archiver::ArchiveError;
use crate::config::ConfigError;
use crate::hasher::HashError;
use crate::registry::RegistryError;

/// Errors that can occur during keepsafe operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Registry access error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A path could not be fingerprinted.
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// A path could not be archived.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// The registry holds no paths to monitor.
    #[error("no paths registered; use `keepsafe add` to register paths")]
    EmptyRegistry,

    /// The background task running a pass panicked or was cancelled.
    #[error("pass task failed: {0}")]
    Task(String),
}

/// A specialized `Result` type for keepsafe operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
