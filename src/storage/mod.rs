//! Secure storage backends for the token cache blob
//!
//! Every backend binds one cache identity to a secure store entry plus a
//! plaintext marker file whose mtime announces changes. The marker never
//! holds the secret (for the file-based backends the file content is the
//! ciphertext or, when explicitly opted in, the plaintext cache).
//!
//! Backends:
//! - macOS Keychain, Windows Credential Manager, Linux Secret Service (via `keyring`)
//! - DPAPI-encrypted file on Windows
//! - Unprotected file, for hosts with no usable secure store

mod keyring_store;
mod plaintext;

#[cfg(windows)]
mod dpapi_file;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StorageConfig;
use crate::fileio::{FileIoError, RetryingFileOps};
use crate::observer::StorageObserver;

pub use keyring_store::KeyringAccessor;
pub use plaintext::PlaintextFileAccessor;

#[cfg(windows)]
pub use dpapi_file::DpapiFileAccessor;

/// Suffix appended to the marker path of a persistence probe
pub const PROBE_PATH_SUFFIX: &str = ".test";
/// Suffix appended to service and account names of a persistence probe
pub const PROBE_NAME_SUFFIX: &str = "test";

/// Which secure store holds the cache bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Pick the native store for the current platform
    #[default]
    Auto,
    /// macOS Keychain
    Keychain,
    /// Windows Credential Manager
    CredentialManager,
    /// Linux Secret Service, fronted by the kernel keyring
    Keyring,
    /// DPAPI-encrypted file (Windows)
    DpapiFile,
    /// Unprotected file, opt-in only
    PlaintextFile,
}

impl BackendKind {
    /// Resolves `Auto` to the platform default
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => {
                if cfg!(target_os = "macos") {
                    BackendKind::Keychain
                } else if cfg!(windows) {
                    BackendKind::DpapiFile
                } else {
                    BackendKind::Keyring
                }
            }
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Keychain => "keychain",
            BackendKind::CredentialManager => "credential-manager",
            BackendKind::Keyring => "keyring",
            BackendKind::DpapiFile => "dpapi-file",
            BackendKind::PlaintextFile => "plaintext-file",
        }
    }

    /// Returns true if this backend exists on the current platform
    pub fn is_supported(self) -> bool {
        match self.resolve() {
            BackendKind::Keychain => cfg!(target_os = "macos"),
            BackendKind::CredentialManager | BackendKind::DpapiFile => cfg!(windows),
            BackendKind::Keyring => cfg!(target_os = "linux"),
            BackendKind::PlaintextFile | BackendKind::Auto => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "auto" => BackendKind::Auto,
            "keychain" => BackendKind::Keychain,
            "credential-manager" => BackendKind::CredentialManager,
            "keyring" => BackendKind::Keyring,
            "dpapi-file" => BackendKind::DpapiFile,
            "plaintext-file" => BackendKind::PlaintextFile,
            other => {
                return Err(StorageError::Unavailable {
                    backend: BackendKind::Auto,
                    reason: format!("unknown backend '{}'", other),
                })
            }
        };
        Ok(kind)
    }
}

/// Errors from secure storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    /// The native store is locked, denied access, or missing on this host
    #[error("Secure storage unavailable ({backend}): {reason}")]
    Unavailable {
        backend: BackendKind,
        reason: String,
    },

    /// Marker or cache file operation failed
    #[error(transparent)]
    File(#[from] FileIoError),
}

impl StorageError {
    pub(crate) fn unavailable(backend: BackendKind, reason: impl fmt::Display) -> Self {
        StorageError::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}

/// Stores and retrieves the opaque cache blob
///
/// Implementations write the secret before touching the marker and delete
/// the marker before the secret.
#[cfg_attr(test, mockall::automock)]
pub trait SecureStorageAccessor: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// The file whose mtime versions the cache
    fn marker_path(&self) -> &Path;

    /// Returns the stored blob, or `None` if nothing is stored
    fn read(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `data`, then bumps the marker
    fn write(&self, data: &[u8]) -> Result<(), StorageError>;

    /// Deletes the marker, then the stored blob
    fn clear(&self) -> Result<(), StorageError>;

    /// Builds an accessor on suffixed identifiers for a startup probe
    fn create_for_persistence_validation(
        &self,
    ) -> Result<Box<dyn SecureStorageAccessor>, StorageError>;
}

/// Builds the accessor selected by `config.backend`
pub fn create_accessor(
    config: &StorageConfig,
    observer: Arc<dyn StorageObserver>,
) -> Result<Box<dyn SecureStorageAccessor>, StorageError> {
    let backend = config.backend.resolve();
    if !backend.is_supported() {
        return Err(StorageError::unavailable(
            backend,
            "not supported on this platform",
        ));
    }

    let file_ops = RetryingFileOps::new(config.file_retry, observer.clone());
    let accessor: Box<dyn SecureStorageAccessor> = match backend {
        BackendKind::Keychain | BackendKind::CredentialManager | BackendKind::Keyring => {
            Box::new(KeyringAccessor::new(
                backend,
                &config.cache_path,
                &config.service_name,
                &config.account_name,
                file_ops,
                observer,
            )?)
        }
        BackendKind::PlaintextFile => Box::new(PlaintextFileAccessor::new(
            &config.cache_path,
            file_ops,
            observer,
        )),
        #[cfg(windows)]
        BackendKind::DpapiFile => Box::new(DpapiFileAccessor::new(
            &config.cache_path,
            file_ops,
            observer,
        )),
        other => {
            return Err(StorageError::unavailable(
                other,
                "not supported on this platform",
            ))
        }
    };
    Ok(accessor)
}

/// Appends `suffix` to a path without treating it as a new component
pub(crate) fn suffixed(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    raw.into()
}
