//! Byte buffers that wipe themselves on drop
//!
//! Token cache payloads hold refresh tokens, so every in-memory copy the
//! crate keeps lives in a [`SecureBytes`].

use std::fmt;
use std::ops::Deref;
use zeroize::Zeroize;

/// A byte vector that securely clears its memory when dropped
///
/// # Example
///
/// ```
/// use token_cache_sync::security::SecureBytes;
///
/// let payload = SecureBytes::new(b"refresh-token".to_vec());
/// assert_eq!(payload.as_bytes(), b"refresh-token");
/// // Debug output never shows the content
/// assert!(format!("{:?}", payload).contains("REDACTED"));
/// ```
#[derive(Clone, Default)]
pub struct SecureBytes {
    inner: Vec<u8>,
}

impl SecureBytes {
    /// Takes ownership of `bytes`; they are zeroed when this value drops
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { inner: bytes }
    }

    /// Copies `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            inner: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an unprotected copy
    ///
    /// # Warning
    ///
    /// The returned Vec is not zeroed on drop.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.clone()
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl Zeroize for SecureBytes {
    fn zeroize(&mut self) {
        self.inner.zeroize();
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

// No Display, and Debug is redacted, to keep payloads out of logs
impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBytes")
            .field("len", &self.inner.len())
            .field("content", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.inner, &other.inner)
    }
}

impl Eq for SecureBytes {}

impl PartialEq<[u8]> for SecureBytes {
    fn eq(&self, other: &[u8]) -> bool {
        constant_time_eq(&self.inner, other)
    }
}

impl PartialEq<&[u8]> for SecureBytes {
    fn eq(&self, other: &&[u8]) -> bool {
        constant_time_eq(&self.inner, other)
    }
}

/// Constant-time byte comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_bytes_new() {
        let bytes = SecureBytes::new(vec![1, 2, 3, 4]);
        assert_eq!(bytes.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(bytes.len(), 4);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn test_secure_bytes_from_slice() {
        let bytes = SecureBytes::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bytes.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_secure_bytes_debug_redacted() {
        let bytes = SecureBytes::from_slice(b"refresh-token-value");
        let debug_output = format!("{:?}", bytes);
        assert!(!debug_output.contains("refresh"));
        assert!(debug_output.contains("REDACTED"));
        assert!(debug_output.contains("19"));
    }

    #[test]
    fn test_secure_bytes_equality() {
        let a = SecureBytes::from_slice(b"same");
        let b = SecureBytes::from_slice(b"same");
        let c = SecureBytes::from_slice(b"different");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a == b"same"[..]);
    }

    #[test]
    fn test_secure_bytes_default_is_empty() {
        assert!(SecureBytes::default().is_empty());
    }

    #[test]
    fn test_secure_bytes_zeroize() {
        let mut bytes = SecureBytes::new(vec![1, 2, 3]);
        bytes.zeroize();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer string"));
    }
}
