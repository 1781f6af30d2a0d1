//! Exclusive lock file shared by every process using one token cache
//!
//! The grant is an OS advisory lock held on an open handle, so it disappears
//! with the handle: a holder that crashes never blocks later acquirers. The
//! lock file itself is created on first use and never deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use thiserror::Error;

use super::in_process::{self, InProcessGuard};
use crate::config::LockRetryPolicy;
use crate::observer::{StorageEvent, StorageObserver};

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not granted before the deadline
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    /// Opening, locking or unlocking the lock file failed
    #[error("Lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

/// Who holds a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub thread: ThreadId,
    pub process_name: String,
}

impl LockOwner {
    fn current() -> Self {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            pid: std::process::id(),
            thread: thread::current().id(),
            process_name,
        }
    }
}

/// Named lock over one lock file path
pub struct CrossProcessLock {
    path: PathBuf,
    retry: LockRetryPolicy,
    observer: Arc<dyn StorageObserver>,
}

impl CrossProcessLock {
    pub fn new(
        path: impl Into<PathBuf>,
        retry: LockRetryPolicy,
        observer: Arc<dyn StorageObserver>,
    ) -> Self {
        Self {
            path: path.into(),
            retry,
            observer,
        }
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the lock is granted or `timeout` elapses
    ///
    /// Threads of this process queue in memory first; only the front of that
    /// queue contends on the lock file. On timeout nothing stays held.
    pub fn acquire(&self, timeout: Duration) -> Result<LockHandle, LockError> {
        let start = Instant::now();
        let deadline = start + timeout;

        let in_process = in_process::claim(in_process::registry_key(&self.path), deadline)
            .ok_or_else(|| self.timed_out(start))?;

        let file = self.open_lock_file()?;
        let mut attempt = 0;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    attempt += 1;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timed_out(start));
                    }
                    self.observer.on_event(&StorageEvent::LockContended {
                        path: &self.path,
                        attempt,
                    });
                    thread::sleep(self.backoff().min(deadline - now));
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }

        let owner = LockOwner::current();
        // Content is informational only, so a failed write is not fatal
        let _ = write_owner(&file, &owner);

        let waited = start.elapsed();
        self.observer.on_event(&StorageEvent::LockAcquired {
            path: &self.path,
            waited,
        });

        Ok(LockHandle {
            file,
            path: self.path.clone(),
            owner,
            acquired_at: Utc::now(),
            acquired: Instant::now(),
            waited,
            released: false,
            observer: self.observer.clone(),
            _in_process: in_process,
            _not_send: PhantomData,
        })
    }

    fn open_lock_file(&self) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        // create(true) without truncation is atomic with respect to other creators
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)
    }

    fn backoff(&self) -> Duration {
        let min = self.retry.min_delay_ms;
        let max = self.retry.max_delay_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn timed_out(&self, start: Instant) -> LockError {
        let waited = start.elapsed();
        self.observer.on_event(&StorageEvent::LockTimedOut {
            path: &self.path,
            waited,
        });
        LockError::Timeout {
            path: self.path.clone(),
            waited,
        }
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_owner(mut file: &File, owner: &LockOwner) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{} {}", owner.pid, owner.process_name)?;
    file.flush()
}

/// A held lock grant
///
/// Released explicitly with [`LockHandle::release`] or implicitly on drop, so
/// every exit path gives the lock back. Bound to the acquiring thread.
pub struct LockHandle {
    file: File,
    path: PathBuf,
    owner: LockOwner,
    acquired_at: DateTime<Utc>,
    acquired: Instant,
    waited: Duration,
    released: bool,
    observer: Arc<dyn StorageObserver>,
    // Declared after `file` so the OS lock goes before the in-process slot
    _in_process: InProcessGuard,
    _not_send: PhantomData<*const ()>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// How long acquisition blocked
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Gives up the grant, reporting unlock failures
    ///
    /// Even on error the handle is closed, which drops the OS lock.
    pub fn release(mut self) -> Result<(), LockError> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        FileExt::unlock(&self.file).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.observer.on_event(&StorageEvent::LockReleased {
            path: &self.path,
            held: self.acquired.elapsed(),
        });
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::observer::NullObserver;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn lock_at(path: &Path) -> CrossProcessLock {
        CrossProcessLock::new(path, LockRetryPolicy::default(), Arc::new(NullObserver))
    }

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.lockfile");

        let handle = lock_at(&path).acquire(Duration::from_secs(1)).unwrap();

        assert!(path.exists());
        assert_eq!(handle.owner().pid, std::process::id());
        assert_eq!(handle.owner().thread, thread::current().id());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_lock_file_survives_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");

        lock_at(&path)
            .acquire(Duration::from_secs(1))
            .unwrap()
            .release()
            .unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_reacquire_immediately_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let lock = lock_at(&path);

        let handle = lock.acquire(Duration::from_secs(1)).unwrap();
        handle.release().unwrap();

        let start = Instant::now();
        let handle = lock.acquire(Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(handle.waited() < Duration::from_millis(500));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");

        {
            let _handle = lock_at(&path).acquire(Duration::from_secs(1)).unwrap();
        }

        let other = thread::spawn({
            let path = path.clone();
            move || lock_at(&path).acquire(Duration::ZERO).is_ok()
        });
        assert!(other.join().unwrap());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let _held = lock_at(&path).acquire(Duration::from_secs(1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = thread::spawn({
            let path = path.clone();
            move || {
                let result = lock_at(&path).acquire(Duration::from_millis(100));
                tx.send(matches!(result, Err(LockError::Timeout { .. })))
                    .unwrap();
            }
        });

        assert!(rx.recv().unwrap(), "second acquisition should time out");
        contender.join().unwrap();
    }

    #[test]
    fn test_timeout_leaves_nothing_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");

        // A foreign handle stands in for another process
        let foreign = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        FileExt::lock_exclusive(&foreign).unwrap();

        let err = lock_at(&path)
            .acquire(Duration::from_millis(80))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!in_process::is_held(&in_process::registry_key(&path)));

        FileExt::unlock(&foreign).unwrap();
        let start = Instant::now();
        let _handle = lock_at(&path).acquire(Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_abandoned_handle_does_not_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let retry = LockRetryPolicy {
            min_delay_ms: 5,
            max_delay_ms: 20,
        };

        let crashed = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        FileExt::lock_exclusive(&crashed).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn({
            let path = path.clone();
            move || {
                let lock = CrossProcessLock::new(&path, retry, Arc::new(NullObserver));
                let result = lock.acquire(Duration::from_secs(10));
                tx.send(Instant::now()).unwrap();
                result.is_ok()
            }
        });

        thread::sleep(Duration::from_millis(50));
        // Closing without unlocking is what the OS does for a dead process
        let dropped_at = Instant::now();
        drop(crashed);

        let acquired_at = rx.recv().unwrap();
        assert!(waiter.join().unwrap());
        assert!(acquired_at.duration_since(dropped_at) < Duration::from_secs(1));
    }

    #[test]
    fn test_threads_are_serialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let counter = dir.path().join("counter");
        fs::write(&counter, "0").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let lock = lock_at(&path);
                    for _ in 0..10 {
                        let _handle = lock.acquire(Duration::from_secs(30)).unwrap();
                        let value: u32 = fs::read_to_string(&counter).unwrap().parse().unwrap();
                        fs::write(&counter, (value + 1).to_string()).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fs::read_to_string(&counter).unwrap(), "80");
    }

    #[test]
    fn test_events_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let observer = Arc::new(RecordingObserver::default());
        let lock = CrossProcessLock::new(&path, LockRetryPolicy::default(), observer.clone());

        lock.acquire(Duration::from_secs(1))
            .unwrap()
            .release()
            .unwrap();

        assert_eq!(observer.count("LockAcquired"), 1);
        assert_eq!(observer.count("LockReleased"), 1);
    }

    #[test]
    fn test_release_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lockfile");
        let observer = Arc::new(RecordingObserver::default());
        let lock = CrossProcessLock::new(&path, LockRetryPolicy::default(), observer.clone());

        let mut handle = lock.acquire(Duration::from_secs(1)).unwrap();
        handle.unlock().unwrap();
        drop(handle);

        assert_eq!(observer.count("LockReleased"), 1);
    }
}
