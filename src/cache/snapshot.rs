//! Cache payload plus the version marker it was read or written at

use std::time::SystemTime;

use crate::security::SecureBytes;

/// Opaque cache bytes tagged with the marker mtime they correspond to
///
/// `version` is `None` when no marker existed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    data: SecureBytes,
    version: Option<SystemTime>,
}

impl CacheSnapshot {
    pub fn new(data: impl Into<SecureBytes>, version: Option<SystemTime>) -> Self {
        Self {
            data: data.into(),
            version,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn version(&self) -> Option<SystemTime> {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true only if this snapshot's marker is strictly newer
    pub fn is_fresher_than(&self, other: &CacheSnapshot) -> bool {
        match (self.version, other.version) {
            (Some(mine), Some(theirs)) => mine > theirs,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}
