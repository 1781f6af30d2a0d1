//! DPAPI-encrypted file backend (Windows)
//!
//! Windows Credential Manager caps blobs at a few kilobytes, which a token
//! cache outgrows quickly, so Windows keeps the cache in a file encrypted
//! for the current user. The encrypted file is also the marker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{suffixed, BackendKind, SecureStorageAccessor, StorageError, PROBE_PATH_SUFFIX};
use crate::fileio::RetryingFileOps;
use crate::observer::{StorageEvent, StorageObserver};
use crate::security::DpapiStore;

/// Cache accessor that keeps a DPAPI-protected blob on disk
pub struct DpapiFileAccessor {
    path: PathBuf,
    dpapi: DpapiStore,
    file_ops: RetryingFileOps,
    observer: Arc<dyn StorageObserver>,
}

impl DpapiFileAccessor {
    pub fn new(path: &Path, file_ops: RetryingFileOps, observer: Arc<dyn StorageObserver>) -> Self {
        Self {
            path: path.to_path_buf(),
            dpapi: DpapiStore::new(),
            file_ops,
            observer,
        }
    }
}

impl SecureStorageAccessor for DpapiFileAccessor {
    fn kind(&self) -> BackendKind {
        BackendKind::DpapiFile
    }

    fn marker_path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let encrypted = match self.file_ops.read(&self.path) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = self
            .dpapi
            .decrypt(&encrypted)
            .map_err(|e| StorageError::unavailable(BackendKind::DpapiFile, e))?;
        self.observer.on_event(&StorageEvent::CacheRead {
            backend: BackendKind::DpapiFile.as_str(),
            bytes: data.len(),
        });
        Ok(Some(data))
    }

    fn write(&self, data: &[u8]) -> Result<(), StorageError> {
        let encrypted = self
            .dpapi
            .encrypt(data)
            .map_err(|e| StorageError::unavailable(BackendKind::DpapiFile, e))?;
        self.file_ops.write(&self.path, &encrypted)?;
        self.file_ops.touch(&self.path)?;
        self.observer.on_event(&StorageEvent::CacheWritten {
            backend: BackendKind::DpapiFile.as_str(),
            bytes: data.len(),
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.file_ops.delete(&self.path)?;
        self.observer.on_event(&StorageEvent::CacheCleared {
            backend: BackendKind::DpapiFile.as_str(),
        });
        Ok(())
    }

    fn create_for_persistence_validation(
        &self,
    ) -> Result<Box<dyn SecureStorageAccessor>, StorageError> {
        Ok(Box::new(DpapiFileAccessor::new(
            &suffixed(&self.path, PROBE_PATH_SUFFIX),
            self.file_ops.clone(),
            self.observer.clone(),
        )))
    }
}
