//! Unprotected file backend
//!
//! Last resort for hosts without a usable secure store (headless Linux with
//! no keyring, containers). The cache file doubles as the marker. Only
//! selected when configured explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{suffixed, BackendKind, SecureStorageAccessor, StorageError, PROBE_PATH_SUFFIX};
use crate::fileio::RetryingFileOps;
use crate::observer::{StorageEvent, StorageObserver};

/// Cache accessor that keeps the blob in a plain file
pub struct PlaintextFileAccessor {
    path: PathBuf,
    file_ops: RetryingFileOps,
    observer: Arc<dyn StorageObserver>,
}

impl PlaintextFileAccessor {
    pub fn new(path: &Path, file_ops: RetryingFileOps, observer: Arc<dyn StorageObserver>) -> Self {
        Self {
            path: path.to_path_buf(),
            file_ops,
            observer,
        }
    }
}

impl SecureStorageAccessor for PlaintextFileAccessor {
    fn kind(&self) -> BackendKind {
        BackendKind::PlaintextFile
    }

    fn marker_path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match self.file_ops.read(&self.path) {
            Ok(data) => {
                self.observer.on_event(&StorageEvent::CacheRead {
                    backend: BackendKind::PlaintextFile.as_str(),
                    bytes: data.len(),
                });
                Ok(Some(data))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> Result<(), StorageError> {
        self.file_ops.write(&self.path, data)?;
        // Writing already moved the mtime; touch keeps it strictly increasing
        self.file_ops.touch(&self.path)?;
        self.observer.on_event(&StorageEvent::CacheWritten {
            backend: BackendKind::PlaintextFile.as_str(),
            bytes: data.len(),
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.file_ops.delete(&self.path)?;
        self.observer.on_event(&StorageEvent::CacheCleared {
            backend: BackendKind::PlaintextFile.as_str(),
        });
        Ok(())
    }

    fn create_for_persistence_validation(
        &self,
    ) -> Result<Box<dyn SecureStorageAccessor>, StorageError> {
        Ok(Box::new(PlaintextFileAccessor::new(
            &suffixed(&self.path, PROBE_PATH_SUFFIX),
            self.file_ops.clone(),
            self.observer.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileRetryPolicy;
    use crate::observer::NullObserver;
    use tempfile::TempDir;

    fn accessor(dir: &TempDir) -> PlaintextFileAccessor {
        PlaintextFileAccessor::new(
            &dir.path().join("cache.bin"),
            RetryingFileOps::new(FileRetryPolicy::default(), Arc::new(NullObserver)),
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(accessor(&dir).read().unwrap(), None);
    }

    #[test]
    fn test_write_read_clear() {
        let dir = TempDir::new().unwrap();
        let store = accessor(&dir);

        store.write(b"cache bytes").unwrap();
        assert_eq!(store.read().unwrap(), Some(b"cache bytes".to_vec()));

        store.clear().unwrap();
        assert_eq!(store.read().unwrap(), None);
        assert!(!store.marker_path().exists());
    }

    #[test]
    fn test_write_bumps_marker() {
        let dir = TempDir::new().unwrap();
        let store = accessor(&dir);

        store.write(b"one").unwrap();
        let first = std::fs::metadata(store.marker_path()).unwrap().modified().unwrap();
        store.write(b"two").unwrap();
        let second = std::fs::metadata(store.marker_path()).unwrap().modified().unwrap();

        assert!(second > first);
    }

    #[test]
    fn test_validation_accessor_does_not_touch_real_cache() {
        let dir = TempDir::new().unwrap();
        let store = accessor(&dir);
        store.write(b"real").unwrap();
        let before = std::fs::metadata(store.marker_path()).unwrap().modified().unwrap();

        let check = store.create_for_persistence_validation().unwrap();
        assert_eq!(check.marker_path(), dir.path().join("cache.bin.test"));
        check.write(b"dummy").unwrap();
        assert_eq!(check.read().unwrap(), Some(b"dummy".to_vec()));
        check.clear().unwrap();

        let after = std::fs::metadata(store.marker_path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(store.read().unwrap(), Some(b"real".to_vec()));
    }
}
