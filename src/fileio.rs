//! File operations with bounded retries
//!
//! Antivirus scanners, indexers and other processes touching the same marker
//! can make a file briefly unavailable. These wrappers retry only on those
//! sharing violations; permission and not-found errors surface immediately.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::config::FileRetryPolicy;
use crate::observer::{StorageEvent, StorageObserver};

/// Minimum step between two successive marker timestamps
const MARKER_STEP: Duration = Duration::from_millis(1);

// Windows ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
#[cfg(windows)]
const TRANSIENT_OS_ERRORS: &[i32] = &[32, 33];
// EBUSY / ETXTBSY
#[cfg(not(windows))]
const TRANSIENT_OS_ERRORS: &[i32] = &[16, 26];

/// The file operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
    Delete,
    Touch,
    Stat,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Delete => "delete",
            FileOp::Touch => "touch",
            FileOp::Stat => "stat",
        };
        f.write_str(name)
    }
}

/// Errors from retried file operations
#[derive(Debug, Error)]
pub enum FileIoError {
    /// Every attempt hit a sharing violation
    #[error("{op} {path} still busy after {attempts} attempts: {source}")]
    Transient {
        op: FileOp,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Non-retryable failure
    #[error("{op} {path} failed: {source}")]
    Io {
        op: FileOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileIoError {
    /// Returns true if the retry budget ran out on a sharing violation
    pub fn is_transient(&self) -> bool {
        matches!(self, FileIoError::Transient { .. })
    }

    /// Returns true if the file does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, FileIoError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
    }

    pub fn io_error(&self) -> &io::Error {
        match self {
            FileIoError::Transient { source, .. } | FileIoError::Io { source, .. } => source,
        }
    }
}

/// Returns true for errors worth another attempt
pub fn is_transient(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => false,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => true,
        _ => error
            .raw_os_error()
            .is_some_and(|code| TRANSIENT_OS_ERRORS.contains(&code)),
    }
}

/// Filesystem access with sharing-violation retries
#[derive(Clone)]
pub struct RetryingFileOps {
    policy: FileRetryPolicy,
    observer: Arc<dyn StorageObserver>,
}

impl RetryingFileOps {
    pub fn new(policy: FileRetryPolicy, observer: Arc<dyn StorageObserver>) -> Self {
        Self { policy, observer }
    }

    pub fn policy(&self) -> FileRetryPolicy {
        self.policy
    }

    /// Reads the whole file
    pub fn read(&self, path: &Path) -> Result<Vec<u8>, FileIoError> {
        self.retry(FileOp::Read, path, || fs::read(path))
    }

    /// Replaces the file's content, creating parent directories as needed
    pub fn write(&self, path: &Path, data: &[u8]) -> Result<(), FileIoError> {
        self.retry(FileOp::Write, path, || {
            ensure_parent(path)?;
            fs::write(path, data)
        })
    }

    /// Removes the file; a missing file counts as removed
    pub fn delete(&self, path: &Path) -> Result<(), FileIoError> {
        self.retry(FileOp::Delete, path, || match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        })
    }

    /// Bumps the modification time without touching content
    ///
    /// Creates an empty file if none exists. The new mtime is strictly later
    /// than the previous one whenever the filesystem stores sub-millisecond
    /// or millisecond precision.
    pub fn touch(&self, path: &Path) -> Result<SystemTime, FileIoError> {
        self.retry(FileOp::Touch, path, || {
            ensure_parent(path)?;
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)?;
            let previous = file.metadata()?.modified()?;
            let now = SystemTime::now();
            let next = if now > previous {
                now
            } else {
                previous + MARKER_STEP
            };
            file.set_modified(next)?;
            file.metadata()?.modified()
        })
    }

    /// Returns the file's modification time, or `None` if it doesn't exist
    pub fn modified(&self, path: &Path) -> Result<Option<SystemTime>, FileIoError> {
        self.retry(FileOp::Stat, path, || match fs::metadata(path) {
            Ok(meta) => meta.modified().map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
    }

    fn retry<T>(
        &self,
        op: FileOp,
        path: &Path,
        mut f: impl FnMut() -> io::Result<T>,
    ) -> Result<T, FileIoError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt >= attempts {
                        return Err(FileIoError::Transient {
                            op,
                            path: path.to_path_buf(),
                            attempts,
                            source: e,
                        });
                    }
                    self.observer.on_event(&StorageEvent::FileRetry {
                        op,
                        path,
                        attempt,
                        error: &e,
                    });
                    attempt += 1;
                    thread::sleep(self.policy.delay());
                }
                Err(e) => {
                    return Err(FileIoError::Io {
                        op,
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::observer::NullObserver;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn ops() -> RetryingFileOps {
        RetryingFileOps::new(
            FileRetryPolicy {
                attempts: 3,
                delay_ms: 1,
            },
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.bin");

        ops().write(&path, b"payload").unwrap();
        assert_eq!(ops().read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_read_missing_is_not_found_without_retry() {
        let dir = TempDir::new().unwrap();
        let err = ops().read(&dir.path().join("absent")).unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marker");
        ops().write(&path, b"x").unwrap();

        ops().delete(&path).unwrap();
        assert!(!path.exists());
        ops().delete(&path).unwrap();
    }

    #[test]
    fn test_touch_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("marker");

        let stamp = ops().touch(&path).unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap().len(), 0);
        assert_eq!(ops().modified(&path).unwrap(), Some(stamp));
    }

    #[test]
    fn test_touch_keeps_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marker");
        fs::write(&path, b"keep me").unwrap();

        ops().touch(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marker");
        let ops = ops();

        let mut last = ops.touch(&path).unwrap();
        for _ in 0..50 {
            let next = ops.touch(&path).unwrap();
            assert!(next > last, "{:?} should be after {:?}", next, last);
            last = next;
        }
    }

    #[test]
    fn test_modified_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(ops().modified(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(ErrorKind::NotFound)));
        assert!(!is_transient(&io::Error::from(ErrorKind::PermissionDenied)));
        assert!(is_transient(&io::Error::from_raw_os_error(
            TRANSIENT_OS_ERRORS[0]
        )));
    }

    #[test]
    fn test_retry_absorbs_transient_failures() {
        let observer = Arc::new(RecordingObserver::default());
        let ops = RetryingFileOps::new(
            FileRetryPolicy {
                attempts: 3,
                delay_ms: 1,
            },
            observer.clone(),
        );
        let calls = Cell::new(0);

        let value = ops
            .retry(FileOp::Write, Path::new("/x"), || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(io::Error::from(ErrorKind::WouldBlock))
                } else {
                    Ok(7)
                }
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
        assert_eq!(observer.count("FileRetry"), 2);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let calls = Cell::new(0);
        let err = ops()
            .retry(FileOp::Touch, Path::new("/x"), || -> io::Result<()> {
                calls.set(calls.get() + 1);
                Err(io::Error::from(ErrorKind::WouldBlock))
            })
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permission_denied_not_retried() {
        let calls = Cell::new(0);
        let err = ops()
            .retry(FileOp::Read, Path::new("/x"), || -> io::Result<()> {
                calls.set(calls.get() + 1);
                Err(io::Error::from(ErrorKind::PermissionDenied))
            })
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(calls.get(), 1);
        assert_eq!(err.io_error().kind(), ErrorKind::PermissionDenied);
    }
}
