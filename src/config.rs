//! Configuration for token cache persistence
//!
//! Describes where the cache lives (marker/cache file, lock file, secure store
//! identifiers), which backend stores the secret, and how hard the lock and
//! file layers retry. Supports Windows, macOS, and Linux default locations.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::BackendKind;

/// Suffix appended to the cache path when no explicit lock path is configured
pub const LOCK_FILE_SUFFIX: &str = ".lockfile";

/// Errors produced while building, validating, loading or saving a config
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is empty or whitespace
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    /// A numeric setting is out of range
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// Reading or writing the config file failed
    #[error("Config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema
    #[error("Config file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Backoff used between attempts to take the cross-process lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRetryPolicy {
    /// Lower bound of the randomized delay, in milliseconds
    pub min_delay_ms: u64,
    /// Upper bound of the randomized delay, in milliseconds
    pub max_delay_ms: u64,
}

impl LockRetryPolicy {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 50,
        }
    }
}

/// Retry budget for file operations hitting sharing violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    pub delay_ms: u64,
}

impl FileRetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for FileRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay_ms: 50,
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    60_000
}

/// Persistence settings for one logical token cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Marker file path; for file-based backends this is also the cache file
    pub cache_path: PathBuf,
    /// Lock file path, derived from `cache_path` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<PathBuf>,
    /// Secure store service name (keychain service, credential target prefix)
    pub service_name: String,
    /// Secure store account name
    pub account_name: String,
    /// Which secure store backend holds the bytes
    #[serde(default)]
    pub backend: BackendKind,
    /// How long to wait for the cross-process lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub lock_retry: LockRetryPolicy,
    #[serde(default)]
    pub file_retry: FileRetryPolicy,
}

impl StorageConfig {
    /// Creates a config with default timeouts and platform backend selection
    pub fn new(
        cache_path: impl Into<PathBuf>,
        service_name: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            cache_path: cache_path.into(),
            lock_path: None,
            service_name: service_name.into(),
            account_name: account_name.into(),
            backend: BackendKind::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry: LockRetryPolicy::default(),
            file_retry: FileRetryPolicy::default(),
        }
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lock_retry(mut self, policy: LockRetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    pub fn with_file_retry(mut self, policy: FileRetryPolicy) -> Self {
        self.file_retry = policy;
        self
    }

    /// Returns the effective lock file path
    pub fn lock_path(&self) -> PathBuf {
        match &self.lock_path {
            Some(path) => path.clone(),
            None => {
                let mut raw = self.cache_path.clone().into_os_string();
                raw.push(LOCK_FILE_SUFFIX);
                PathBuf::from(raw)
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Checks every field a backend or the lock relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("cache_path"));
        }
        if let Some(lock_path) = &self.lock_path {
            if lock_path.as_os_str().is_empty() {
                return Err(ConfigError::Missing("lock_path"));
            }
            if lock_path == &self.cache_path {
                return Err(ConfigError::Invalid {
                    field: "lock_path",
                    reason: "must differ from cache_path".to_string(),
                });
            }
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Missing("service_name"));
        }
        if self.account_name.trim().is_empty() {
            return Err(ConfigError::Missing("account_name"));
        }
        if self.file_retry.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "file_retry.attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lock_retry.min_delay_ms > self.lock_retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "lock_retry",
                reason: format!(
                    "min_delay_ms ({}) exceeds max_delay_ms ({})",
                    self.lock_retry.min_delay_ms, self.lock_retry.max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Loads and validates a config from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the config as pretty-printed JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(io_err)
    }

    /// Gets the per-user directory token caches live in by default
    pub fn default_cache_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA")
                .ok()
                .map(|p| PathBuf::from(p).join(".IdentityService"))
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|p| PathBuf::from(p).join(".IdentityService"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CACHE_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|p| PathBuf::from(p).join(".cache")))
                .map(|p| p.join(".IdentityService"))
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
