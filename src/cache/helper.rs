//! In-memory token cache backed by [`CacheStorage`]
//!
//! Persistence failures never cost the caller its tokens. A secure store
//! that turns out to be unusable switches the helper to session-only mode
//! for the rest of its life; a lock timeout or busy file only skips
//! persistence for the one call that hit it.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{CacheError, CacheStorage, MutatorError};
use crate::config::StorageConfig;
use crate::observer::{StorageEvent, StorageObserver};
use crate::security::SecureBytes;

/// Whether updates reach durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Updates go through the synchronized storage
    Enabled,
    /// Persistence was given up; the cache lives only in this process
    SessionOnly { reason: String },
}

impl PersistenceMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, PersistenceMode::Enabled)
    }
}

struct HelperState {
    /// Session-only copy; unused while persistence is enabled
    data: SecureBytes,
    mode: PersistenceMode,
}

/// Token cache with durable, cross-process synchronized backing
///
/// While persistence is enabled the in-memory copy is the storage's last
/// known snapshot, so updates that could not be persisted are still the base
/// of the next persisted one.
pub struct TokenCacheHelper {
    storage: CacheStorage,
    state: Mutex<HelperState>,
    observer: Arc<dyn StorageObserver>,
}

impl TokenCacheHelper {
    pub fn new(storage: CacheStorage, observer: Arc<dyn StorageObserver>) -> Self {
        Self {
            storage,
            state: Mutex::new(HelperState {
                data: SecureBytes::default(),
                mode: PersistenceMode::Enabled,
            }),
            observer,
        }
    }

    /// Opens the configured storage and loads the current cache
    pub fn create(
        config: StorageConfig,
        observer: Arc<dyn StorageObserver>,
    ) -> Result<Self, CacheError> {
        let storage = CacheStorage::new(config, observer.clone())?;
        let helper = Self::new(storage, observer);
        helper.load();
        Ok(helper)
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn mode(&self) -> PersistenceMode {
        self.state().mode.clone()
    }

    /// Current in-memory cache bytes
    pub fn data(&self) -> SecureBytes {
        let state = self.state();
        if state.mode.is_enabled() {
            SecureBytes::from_slice(self.storage.last_known().data())
        } else {
            state.data.clone()
        }
    }

    /// Refreshes the in-memory copy from storage when persistence is on
    pub fn load(&self) -> SecureBytes {
        if self.mode().is_enabled() {
            if let Err(e) = self.storage.read() {
                self.degrade(&e);
            }
        }
        self.data()
    }

    /// Applies `mutator` to the cache, persisting when possible
    ///
    /// Only mutator failures are returned as errors; storage failures fall
    /// back to updating the in-memory copy.
    pub fn update<F, E>(&self, mut mutator: F) -> Result<SecureBytes, CacheError>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, E>,
        E: Into<MutatorError>,
    {
        if self.mode().is_enabled() {
            match self.storage.synchronized_update(&mut mutator) {
                Ok(snapshot) => return Ok(SecureBytes::from_slice(snapshot.data())),
                Err(CacheError::Mutator(e)) => return Err(CacheError::Mutator(e)),
                Err(e) => self.degrade(&e),
            }
        }

        let mut state = self.state();
        if state.mode.is_enabled() {
            let snapshot = self.storage.apply_local(&mut mutator)?;
            return Ok(SecureBytes::from_slice(snapshot.data()));
        }

        let updated = mutator(state.data.as_bytes()).map_err(|e| CacheError::Mutator(e.into()))?;
        state.data = SecureBytes::new(updated);
        Ok(state.data.clone())
    }

    /// Empties the cache in memory and, when persistence is on, on disk
    ///
    /// If the on-disk clear is skipped the empty cache becomes the base of
    /// the next persisted update.
    pub fn clear(&self) {
        if self.mode().is_enabled() {
            match self.storage.clear() {
                Ok(()) => return,
                Err(e) => self.degrade(&e),
            }
        }

        let mut state = self.state();
        if state.mode.is_enabled() {
            self.storage.clear_local();
        } else {
            state.data = SecureBytes::default();
        }
    }

    /// Probes the secure store; on failure switches to session-only mode
    pub fn verify_persistence(&self) -> Result<(), CacheError> {
        let result = self.storage.verify_persistence();
        if let Err(e) = &result {
            self.disable(e.to_string());
        }
        result
    }

    fn degrade(&self, error: &CacheError) {
        let reason = error.to_string();
        self.observer
            .on_event(&StorageEvent::PersistenceDegraded { reason: &reason });
        if error.is_storage_unavailable() {
            self.disable(reason);
        }
    }

    /// Switches to session-only mode, carrying over the current cache
    fn disable(&self, reason: String) {
        let mut state = self.state();
        if state.mode.is_enabled() {
            state.data = SecureBytes::from_slice(self.storage.last_known().data());
            state.mode = PersistenceMode::SessionOnly { reason };
        }
    }

    fn state(&self) -> MutexGuard<'_, HelperState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
