//! Native secure store backend (Keychain, Credential Manager, Secret Service)
//!
//! On Linux the kernel keyring only caches entries; the Secret Service
//! collection behind it is what survives a reboot.
//!
//! Stores the cache blob in the platform credential store through the
//! `keyring` crate. A plaintext marker file next to the configured cache path
//! is touched after each write so other processes can see the change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyring::Entry;

use super::{
    suffixed, BackendKind, SecureStorageAccessor, StorageError, PROBE_NAME_SUFFIX,
    PROBE_PATH_SUFFIX,
};
use crate::fileio::RetryingFileOps;
use crate::observer::{StorageEvent, StorageObserver};

/// Cache accessor backed by the platform credential store
pub struct KeyringAccessor {
    kind: BackendKind,
    marker: PathBuf,
    service: String,
    account: String,
    entry: Entry,
    file_ops: RetryingFileOps,
    observer: Arc<dyn StorageObserver>,
}

impl KeyringAccessor {
    /// Binds `service`/`account` in the native store and `marker` on disk
    pub fn new(
        kind: BackendKind,
        marker: &Path,
        service: &str,
        account: &str,
        file_ops: RetryingFileOps,
        observer: Arc<dyn StorageObserver>,
    ) -> Result<Self, StorageError> {
        let entry = Entry::new(service, account).map_err(|e| StorageError::unavailable(kind, e))?;
        Ok(Self {
            kind,
            marker: marker.to_path_buf(),
            service: service.to_string(),
            account: account.to_string(),
            entry,
            file_ops,
            observer,
        })
    }

    /// Returns the service name used for this entry
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the account name used for this entry
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Same backend on suffixed marker, service and account
    fn validation_accessor(&self) -> Result<KeyringAccessor, StorageError> {
        KeyringAccessor::new(
            self.kind,
            &suffixed(&self.marker, PROBE_PATH_SUFFIX),
            &format!("{}{}", self.service, PROBE_NAME_SUFFIX),
            &format!("{}{}", self.account, PROBE_NAME_SUFFIX),
            self.file_ops.clone(),
            self.observer.clone(),
        )
    }

    fn store_error(&self, error: keyring::Error) -> StorageError {
        StorageError::unavailable(self.kind, error)
    }
}

impl SecureStorageAccessor for KeyringAccessor {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn marker_path(&self) -> &Path {
        &self.marker
    }

    fn read(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match self.entry.get_secret() {
            Ok(data) => {
                self.observer.on_event(&StorageEvent::CacheRead {
                    backend: self.kind.as_str(),
                    bytes: data.len(),
                });
                Ok(Some(data))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(self.store_error(e)),
        }
    }

    fn write(&self, data: &[u8]) -> Result<(), StorageError> {
        self.entry
            .set_secret(data)
            .map_err(|e| self.store_error(e))?;
        self.observer.on_event(&StorageEvent::CacheWritten {
            backend: self.kind.as_str(),
            bytes: data.len(),
        });

        // Marker last, so a fresh mtime never points at stale content
        self.file_ops.touch(&self.marker)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.file_ops.delete(&self.marker)?;
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(self.store_error(e)),
        }
        self.observer.on_event(&StorageEvent::CacheCleared {
            backend: self.kind.as_str(),
        });
        Ok(())
    }

    fn create_for_persistence_validation(
        &self,
    ) -> Result<Box<dyn SecureStorageAccessor>, StorageError> {
        Ok(Box::new(self.validation_accessor()?))
    }
}
