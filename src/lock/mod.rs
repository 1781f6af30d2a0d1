//! Cross-process locking for the shared token cache
//!
//! A [`CrossProcessLock`] serializes read-modify-write cycles on the cache
//! between independent processes (exclusive OS lock on a lock file) and
//! between threads of one process (in-memory fast path checked first).

mod cross_process;
mod in_process;

pub use cross_process::{CrossProcessLock, LockError, LockHandle, LockOwner};
