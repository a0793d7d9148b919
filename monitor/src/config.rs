//! Configuration module for the keepsafe daemon.
//!
//! This module handles parsing configuration from environment variables.
//! Command-line flags on the binaries override the values read here.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEEPSAFE_INTERVAL_SECS` | No | 10 | Seconds between detection passes |
//! | `KEEPSAFE_ARCHIVE_DIR` | No | `~/.keepsafe/archive` | Archive destination directory |
//! | `KEEPSAFE_REGISTRY` | No | `~/.keepsafe/registry` | Registry directory |
//!
//! # Example
//!
//! ```no_run
//! use keepsafe_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Archiving into: {}", config.archive_dir.display());
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

/// Default seconds between passes.
const DEFAULT_INTERVAL_SECS: u64 = 10;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".keepsafe";

/// Default archive directory name inside the data directory.
const DEFAULT_ARCHIVE_DIR: &str = "archive";

/// Default registry directory name inside the data directory.
const DEFAULT_REGISTRY_DIR: &str = "registry";

/// Errors that can occur during configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable or flag has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,

    /// A configured location is unusable.
    #[error("invalid path {}: {message}", path.display())]
    InvalidPath { path: PathBuf, message: String },
}

/// Configuration for the keepsafe daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Time between the end of one pass and the start of the next.
    pub interval: Duration,

    /// Directory that receives archive artifacts.
    pub archive_dir: PathBuf,

    /// Directory holding the registry files.
    pub registry_dir: PathBuf,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `KEEPSAFE_INTERVAL_SECS` is set but is not a positive integer
    /// - The home directory cannot be determined and a default path is needed
    pub fn from_env() -> Result<Self, ConfigError> {
        let interval = match env::var("KEEPSAFE_INTERVAL_SECS") {
            Ok(val) => parse_interval("KEEPSAFE_INTERVAL_SECS", &val)?,
            Err(_) => Duration::from_secs(DEFAULT_INTERVAL_SECS),
        };

        let archive_dir = match env::var("KEEPSAFE_ARCHIVE_DIR") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_data_dir()?.join(DEFAULT_ARCHIVE_DIR),
        };

        let registry_dir = Self::registry_dir_from_env()?;

        Ok(Self {
            interval,
            archive_dir,
            registry_dir,
        })
    }

    /// Registry directory from `KEEPSAFE_REGISTRY`, or the default under home.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] if the variable is unset and
    /// the home directory cannot be determined.
    pub fn registry_dir_from_env() -> Result<PathBuf, ConfigError> {
        match env::var("KEEPSAFE_REGISTRY") {
            Ok(path) => Ok(PathBuf::from(path)),
            Err(_) => Ok(default_data_dir()?.join(DEFAULT_REGISTRY_DIR)),
        }
    }

    /// Validates locations and creates the archive directory if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] if the archive destination is not
    /// a directory or cannot be created, or if the registry location is an
    /// existing regular file.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        if self.archive_dir.exists() && !self.archive_dir.is_dir() {
            return Err(invalid_path(&self.archive_dir, "archive destination is not a directory"));
        }
        fs::create_dir_all(&self.archive_dir)
            .map_err(|e| invalid_path(&self.archive_dir, &format!("cannot create: {e}")))?;

        if self.registry_dir.is_file() {
            return Err(invalid_path(&self.registry_dir, "registry location is a file"));
        }

        Ok(())
    }
}

/// Parses an interval given in whole seconds; zero is rejected.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] naming `key` if `value` is not a
/// positive integer.
pub fn parse_interval(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs = value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{value}'"),
        })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "interval must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
    Ok(base_dirs.home_dir().join(DEFAULT_DATA_DIR))
}

fn invalid_path(path: &Path, message: &str) -> ConfigError {
    ConfigError::InvalidPath {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}
