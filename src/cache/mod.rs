//! Synchronized token cache persistence
//!
//! [`CacheStorage`] runs the read-merge-write cycle under the cross-process
//! lock, reloading whenever the marker moved. [`TokenCacheHelper`] sits on
//! top and keeps the cache usable in memory when persistence fails.

mod helper;
mod snapshot;
mod storage;

use std::error::Error as StdError;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::fileio::FileIoError;
use crate::lock::LockError;
use crate::storage::StorageError;

pub use helper::{PersistenceMode, TokenCacheHelper};
pub use snapshot::CacheSnapshot;
pub use storage::CacheStorage;

/// Boxed error returned by an update callback
pub type MutatorError = Box<dyn StdError + Send + Sync>;

/// Errors surfaced to the token acquisition layer
#[derive(Debug, Error)]
pub enum CacheError {
    /// The configuration is incomplete or inconsistent
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another holder kept the lock past the timeout
    #[error("Timed out after {waited:?} waiting for cache lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The lock file could not be opened or locked
    #[error(transparent)]
    Lock(LockError),

    /// A file stayed busy through the whole retry budget
    #[error("Cache file busy: {0}")]
    TransientIo(#[source] FileIoError),

    /// A file operation failed outright
    #[error(transparent)]
    Io(FileIoError),

    /// The secure store cannot be used on this host right now
    #[error(transparent)]
    StorageUnavailable(StorageError),

    /// The caller's update callback failed; nothing was written
    #[error("Cache update callback failed: {0}")]
    Mutator(#[source] MutatorError),

    /// The host failed the write/read-back probe
    #[error("Persistence validation failed: {0}")]
    PersistenceValidation(String),
}

impl CacheError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::TransientIo(_))
    }

    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, CacheError::StorageUnavailable(_))
    }
}

impl From<LockError> for CacheError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { path, waited } => CacheError::LockTimeout { path, waited },
            other => CacheError::Lock(other),
        }
    }
}

impl From<FileIoError> for CacheError {
    fn from(error: FileIoError) -> Self {
        if error.is_transient() {
            CacheError::TransientIo(error)
        } else {
            CacheError::Io(error)
        }
    }
}

impl From<StorageError> for CacheError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::File(e) => e.into(),
            unavailable => CacheError::StorageUnavailable(unavailable),
        }
    }
}
