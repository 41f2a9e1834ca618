//! Catalog configuration loaded from environment variables.
//!
//! Every value has a default, so an empty environment yields a working
//! configuration. A `.env` file in the working directory is honored.
//!
//! # Example
//!
//! ```rust,ignore
//! use catalog_core::config::CatalogConfig;
//!
//! let config = CatalogConfig::from_env()?;
//! println!("Staging uploads in {}", config.staging_dir.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::revision::PageLimits;
use crate::sync::DEFAULT_POOL_CAPACITY;
use crate::upload::UploadLimits;

/// Configuration error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The name of the environment variable.
        key: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// The values parse but contradict each other.
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Catalog configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Mutexes kept for reuse by the keyed lock. Zero disables pooling.
    pub lock_pool_capacity: usize,
    /// Snapshots per page when the caller does not ask for a size.
    pub snapshot_page_size: u32,
    /// Largest snapshot page a caller may ask for.
    pub snapshot_max_page_size: u32,
    /// Concurrently open upload sessions per owner.
    pub upload_max_sessions: usize,
    /// Idle time after which an upload session is reclaimed.
    pub upload_session_timeout: Duration,
    /// Period of the upload expiry sweep.
    pub upload_sweep_interval: Duration,
    /// Largest accepted size of one uploaded file, in bytes.
    pub max_file_bytes: u64,
    /// Directory receiving staged uploads.
    pub staging_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            lock_pool_capacity: DEFAULT_POOL_CAPACITY,
            snapshot_page_size: 20,
            snapshot_max_page_size: 100,
            upload_max_sessions: 4,
            upload_session_timeout: Duration::from_secs(3600),
            upload_sweep_interval: Duration::from_secs(60),
            max_file_bytes: 64 * 1024 * 1024,
            staging_dir: env::temp_dir().join("catalog-uploads"),
        }
    }
}

impl CatalogConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `CATALOG_LOCK_POOL_CAPACITY` (default: 64)
    /// - `CATALOG_SNAPSHOT_PAGE_SIZE` (default: 20)
    /// - `CATALOG_SNAPSHOT_MAX_PAGE_SIZE` (default: 100)
    /// - `CATALOG_UPLOAD_MAX_SESSIONS` (default: 4)
    /// - `CATALOG_UPLOAD_SESSION_TIMEOUT_SECS` (default: 3600)
    /// - `CATALOG_UPLOAD_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `CATALOG_UPLOAD_MAX_FILE_BYTES` (default: 64 MiB)
    /// - `CATALOG_UPLOAD_STAGING_DIR` (default: `catalog-uploads` in the temp directory)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable has an invalid value
    /// and `ConfigError::Inconsistent` if the values contradict each other.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            lock_pool_capacity: parsed(
                &lookup,
                "CATALOG_LOCK_POOL_CAPACITY",
                defaults.lock_pool_capacity,
            )?,
            snapshot_page_size: parsed(
                &lookup,
                "CATALOG_SNAPSHOT_PAGE_SIZE",
                defaults.snapshot_page_size,
            )?,
            snapshot_max_page_size: parsed(
                &lookup,
                "CATALOG_SNAPSHOT_MAX_PAGE_SIZE",
                defaults.snapshot_max_page_size,
            )?,
            upload_max_sessions: parsed(
                &lookup,
                "CATALOG_UPLOAD_MAX_SESSIONS",
                defaults.upload_max_sessions,
            )?,
            upload_session_timeout: Duration::from_secs(parsed(
                &lookup,
                "CATALOG_UPLOAD_SESSION_TIMEOUT_SECS",
                defaults.upload_session_timeout.as_secs(),
            )?),
            upload_sweep_interval: Duration::from_secs(parsed(
                &lookup,
                "CATALOG_UPLOAD_SWEEP_INTERVAL_SECS",
                defaults.upload_sweep_interval.as_secs(),
            )?),
            max_file_bytes: parsed(
                &lookup,
                "CATALOG_UPLOAD_MAX_FILE_BYTES",
                defaults.max_file_bytes,
            )?,
            staging_dir: lookup("CATALOG_UPLOAD_STAGING_DIR")
                .map_or(defaults.staging_dir, PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Inconsistent` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let violation = if self.snapshot_page_size == 0 {
            Some("snapshot page size must be greater than zero")
        } else if self.snapshot_page_size > self.snapshot_max_page_size {
            Some("default snapshot page size exceeds the maximum")
        } else if self.upload_max_sessions == 0 {
            Some("upload session quota must be greater than zero")
        } else if self.upload_session_timeout.is_zero() {
            Some("upload session timeout must be greater than zero")
        } else if self.upload_sweep_interval.is_zero() {
            Some("upload sweep interval must be greater than zero")
        } else {
            None
        };
        violation.map_or(Ok(()), |message| {
            Err(ConfigError::Inconsistent(message.to_string()))
        })
    }

    /// Snapshot page limits for the revision ledgers.
    #[must_use]
    pub const fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.snapshot_page_size,
            max_page_size: self.snapshot_max_page_size,
        }
    }

    /// Quotas and timings for the upload registry.
    #[must_use]
    pub const fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_sessions_per_owner: self.upload_max_sessions,
            session_timeout: self.upload_session_timeout,
            sweep_interval: self.upload_sweep_interval,
        }
    }
}

/// Looks up `key` and parses it, falling back to `default` when unset.
fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map_or(Ok(default), |value| {
        value
            .trim()
            .parse()
            .map_err(|error: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: error.to_string(),
            })
    })
}
