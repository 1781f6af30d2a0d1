//! Lock-protected read-merge-write of the persisted token cache
//!
//! One update cycle:
//!
//! 1. take the cross-process lock (bounded wait)
//! 2. stat the marker; if its mtime differs from the last one seen, reload
//! 3. hand the current bytes to the caller's mutator
//! 4. write the result and remember the new marker mtime
//! 5. release the lock, on every path
//!
//! Change detection is mtime-only. Two writes landing inside one timestamp
//! tick of a coarse filesystem are indistinguishable; that window is
//! accepted.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

use super::{CacheError, CacheSnapshot, MutatorError};
use crate::config::StorageConfig;
use crate::fileio::RetryingFileOps;
use crate::lock::CrossProcessLock;
use crate::observer::{StorageEvent, StorageObserver};
use crate::security::SecureBytes;
use crate::storage::{self, suffixed, SecureStorageAccessor, PROBE_PATH_SUFFIX};

/// Orchestrates lock, marker and secure store for one token cache
pub struct CacheStorage {
    config: StorageConfig,
    accessor: Box<dyn SecureStorageAccessor>,
    lock: CrossProcessLock,
    file_ops: RetryingFileOps,
    observer: Arc<dyn StorageObserver>,
    last_known: Mutex<CacheSnapshot>,
}

impl CacheStorage {
    /// Validates `config` and opens the backend it selects
    pub fn new(
        config: StorageConfig,
        observer: Arc<dyn StorageObserver>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let accessor = storage::create_accessor(&config, observer.clone())?;
        Self::with_accessor(config, accessor, observer)
    }

    /// Uses a caller-provided backend
    pub fn with_accessor(
        config: StorageConfig,
        accessor: Box<dyn SecureStorageAccessor>,
        observer: Arc<dyn StorageObserver>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let lock = CrossProcessLock::new(config.lock_path(), config.lock_retry, observer.clone());
        let file_ops = RetryingFileOps::new(config.file_retry, observer.clone());
        Ok(Self {
            config,
            accessor,
            lock,
            file_ops,
            observer,
            last_known: Mutex::new(CacheSnapshot::default()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn accessor(&self) -> &dyn SecureStorageAccessor {
        self.accessor.as_ref()
    }

    /// Marker path this storage watches
    pub fn marker_path(&self) -> PathBuf {
        self.accessor.marker_path().to_path_buf()
    }

    /// The snapshot from the last completed operation
    pub fn last_known(&self) -> CacheSnapshot {
        self.state().clone()
    }

    /// Reads the current cache, applies `mutator`, and persists the result
    ///
    /// The mutator sees the latest persisted bytes, including changes made
    /// by other processes. If it fails nothing is written. The lock is
    /// released before any error is returned.
    pub fn synchronized_update<F, E>(&self, mutator: F) -> Result<CacheSnapshot, CacheError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
        E: Into<MutatorError>,
    {
        // Lock first: the snapshot mutex is never held across an acquisition
        let _handle = self.lock.acquire(self.config.lock_timeout())?;
        let mut last_known = self.state();

        self.reconcile(&mut last_known)?;

        let updated = SecureBytes::new(
            mutator(last_known.data()).map_err(|e| CacheError::Mutator(e.into()))?,
        );

        self.accessor.write(updated.as_bytes())?;
        let version = self.file_ops.modified(self.accessor.marker_path())?;
        *last_known = CacheSnapshot::new(updated, version);

        Ok(last_known.clone())
    }

    /// Applies `mutator` to the in-memory snapshot without persisting it
    ///
    /// The snapshot keeps its version, so the next update builds on these
    /// bytes unless the marker moved in the meantime, in which case the
    /// persisted cache wins.
    pub fn apply_local<F, E>(&self, mutator: F) -> Result<CacheSnapshot, CacheError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
        E: Into<MutatorError>,
    {
        let mut last_known = self.state();
        let updated = mutator(last_known.data()).map_err(|e| CacheError::Mutator(e.into()))?;
        *last_known = CacheSnapshot::new(updated, last_known.version());
        Ok(last_known.clone())
    }

    /// Empties the in-memory snapshot without touching storage
    pub fn clear_local(&self) {
        let mut last_known = self.state();
        *last_known = CacheSnapshot::new(SecureBytes::default(), last_known.version());
    }

    /// Returns the current persisted cache, reloading if it changed
    pub fn read(&self) -> Result<CacheSnapshot, CacheError> {
        let _handle = self.lock.acquire(self.config.lock_timeout())?;
        let mut last_known = self.state();
        self.reconcile(&mut last_known)?;
        Ok(last_known.clone())
    }

    /// Deletes marker and secure store entry
    pub fn clear(&self) -> Result<(), CacheError> {
        let _handle = self.lock.acquire(self.config.lock_timeout())?;
        let mut last_known = self.state();
        self.accessor.clear()?;
        *last_known = CacheSnapshot::default();
        Ok(())
    }

    /// Returns true if the marker moved since the last operation
    ///
    /// Unlocked, so only a hint.
    pub fn has_external_change(&self) -> Result<bool, CacheError> {
        let version = self.file_ops.modified(self.accessor.marker_path())?;
        Ok(version != self.state().version())
    }

    /// Checks that this host can really write and read back the secure store
    ///
    /// Works on a probe entry and marker with suffixed identifiers, guarded
    /// by its own lock file, so the real cache is never touched.
    pub fn verify_persistence(&self) -> Result<(), CacheError> {
        let probe = self
            .accessor
            .create_for_persistence_validation()
            .map_err(|e| CacheError::PersistenceValidation(e.to_string()))?;
        let probe_lock = CrossProcessLock::new(
            suffixed(&self.config.lock_path(), PROBE_PATH_SUFFIX),
            self.config.lock_retry,
            self.observer.clone(),
        );
        let _handle = probe_lock.acquire(self.config.lock_timeout())?;

        let dummy = SecureBytes::new(rand::thread_rng().gen::<[u8; 32]>().to_vec());
        let outcome = probe
            .write(dummy.as_bytes())
            .and_then(|()| probe.read())
            .map_err(|e| e.to_string())
            .and_then(|read_back| match read_back {
                Some(bytes) if dummy == bytes.as_slice() => Ok(()),
                Some(_) => Err("read back different bytes than written".to_string()),
                None => Err("nothing read back after write".to_string()),
            });

        // Probe artifacts never outlive the check
        let cleanup = probe.clear();

        outcome.map_err(|reason| {
            self.observer
                .on_event(&StorageEvent::PersistenceDegraded { reason: &reason });
            CacheError::PersistenceValidation(reason)
        })?;
        cleanup.map_err(|e| CacheError::PersistenceValidation(e.to_string()))
    }

    fn reconcile(&self, last_known: &mut CacheSnapshot) -> Result<(), CacheError> {
        let marker = self.accessor.marker_path();
        let version = self.file_ops.modified(marker)?;
        if version != last_known.version() {
            self.observer
                .on_event(&StorageEvent::ExternalChange { marker });
            let data = self.accessor.read()?.unwrap_or_default();
            *last_known = CacheSnapshot::new(data, version);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, CacheSnapshot> {
        self.last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
