//! token-cache-sync - Cross-process synchronized token cache persistence
//!
//! Lets several processes of one user share a single serialized token
//! cache stored in the operating system's secure storage, without lost
//! updates and without reading stale data.
//!
//! ## Features
//!
//! - Cross-process advisory lock with bounded, randomized backoff
//! - Change detection through a marker file's modification time
//! - Secure storage backends (macOS Keychain, Windows DPAPI file, Linux keyring)
//! - Write/read-back probe to validate persistence before relying on it
//! - Graceful in-memory fallback when persistence is unavailable
//!
//! ## Architecture
//!
//! - **Lock**: [`lock::CrossProcessLock`], one holder across threads and processes
//! - **File I/O**: [`fileio::RetryingFileOps`], sharing-violation retries
//! - **Storage**: [`storage::SecureStorageAccessor`] and its backends
//! - **Cache**: [`cache::CacheStorage`] orchestration and [`cache::TokenCacheHelper`]
//! - **Observer**: [`observer::StorageObserver`], diagnostics routed to `tracing`
//! - **Security**: zeroizing buffers and Windows DPAPI

pub mod cache;
pub mod config;
pub mod fileio;
pub mod lock;
pub mod observer;
pub mod security;
pub mod storage;

pub use cache::{CacheError, CacheSnapshot, CacheStorage, PersistenceMode, TokenCacheHelper};
pub use config::{ConfigError, StorageConfig};
pub use lock::{CrossProcessLock, LockError, LockHandle};
pub use observer::{NullObserver, StorageEvent, StorageObserver, TracingObserver};
pub use storage::{BackendKind, SecureStorageAccessor, StorageError};
