//! Injected observer for storage diagnostics
//!
//! The lock, file and storage layers never log directly. They report
//! [`StorageEvent`]s to a [`StorageObserver`], which lets tests record events
//! and lets applications route them to their own sink. [`TracingObserver`]
//! is the default and forwards everything to `tracing`.

use std::path::Path;
use std::time::Duration;

use crate::fileio::FileOp;

/// Something observable happened in the persistence layer
///
/// Events never carry secret bytes, only sizes.
#[derive(Debug)]
pub enum StorageEvent<'a> {
    /// Another holder owns the lock; the caller is backing off
    LockContended { path: &'a Path, attempt: u32 },
    /// The exclusive grant was obtained
    LockAcquired { path: &'a Path, waited: Duration },
    /// The lock could not be obtained before the deadline
    LockTimedOut { path: &'a Path, waited: Duration },
    /// The exclusive grant was given up
    LockReleased { path: &'a Path, held: Duration },
    /// A file operation hit a sharing violation and will be retried
    FileRetry {
        op: FileOp,
        path: &'a Path,
        attempt: u32,
        error: &'a std::io::Error,
    },
    /// The marker moved since the last observed version
    ExternalChange { marker: &'a Path },
    /// Bytes were loaded from the secure store
    CacheRead { backend: &'a str, bytes: usize },
    /// Bytes were written to the secure store
    CacheWritten { backend: &'a str, bytes: usize },
    /// Marker and secure store entry were removed
    CacheCleared { backend: &'a str },
    /// Persistence is not usable; the cache keeps working in memory
    PersistenceDegraded { reason: &'a str },
}

/// Receives [`StorageEvent`]s
pub trait StorageObserver: Send + Sync {
    fn on_event(&self, event: &StorageEvent<'_>);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StorageObserver for TracingObserver {
    fn on_event(&self, event: &StorageEvent<'_>) {
        match event {
            StorageEvent::LockContended { path, attempt } => {
                tracing::debug!(path = %path.display(), attempt, "Lock held elsewhere, backing off");
            }
            StorageEvent::LockAcquired { path, waited } => {
                tracing::debug!(path = %path.display(), ?waited, "Lock acquired");
            }
            StorageEvent::LockTimedOut { path, waited } => {
                tracing::warn!(path = %path.display(), ?waited, "Timed out waiting for lock");
            }
            StorageEvent::LockReleased { path, held } => {
                tracing::debug!(path = %path.display(), ?held, "Lock released");
            }
            StorageEvent::FileRetry {
                op,
                path,
                attempt,
                error,
            } => {
                tracing::debug!(?op, path = %path.display(), attempt, %error, "Retrying file operation");
            }
            StorageEvent::ExternalChange { marker } => {
                tracing::info!(marker = %marker.display(), "Cache changed by another process, reloading");
            }
            StorageEvent::CacheRead { backend, bytes } => {
                tracing::debug!(backend, bytes, "Read cache from secure store");
            }
            StorageEvent::CacheWritten { backend, bytes } => {
                tracing::debug!(backend, bytes, "Wrote cache to secure store");
            }
            StorageEvent::CacheCleared { backend } => {
                tracing::info!(backend, "Cleared persisted cache");
            }
            StorageEvent::PersistenceDegraded { reason } => {
                tracing::warn!(reason, "Cache persistence unavailable, continuing in memory only");
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StorageObserver for NullObserver {
    fn on_event(&self, _event: &StorageEvent<'_>) {}
}
