//! Windows DPAPI (Data Protection API) integration
//!
//! Encrypts the token cache blob with a key tied to the current Windows user
//! account, so the file-backed Windows store is unreadable to other users.

use thiserror::Error;
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

// Import LocalFree from kernel32
#[link(name = "kernel32")]
extern "system" {
    fn LocalFree(hMem: *mut std::ffi::c_void) -> *mut std::ffi::c_void;
}

/// Errors that can occur during DPAPI operations
#[derive(Debug, Error)]
pub enum DpapiError {
    #[error("DPAPI encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("DPAPI decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Memory allocation error")]
    MemoryError,
}

/// DPAPI-based encryption for the current user
#[derive(Debug, Default, Clone, Copy)]
pub struct DpapiStore;

impl DpapiStore {
    pub fn new() -> Self {
        Self
    }

    /// Encrypts data using DPAPI
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, DpapiError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        unsafe {
            let mut blob_in = CRYPT_INTEGER_BLOB {
                cbData: data.len() as u32,
                pbData: data.as_ptr() as *mut u8,
            };
            let mut blob_out = CRYPT_INTEGER_BLOB::default();

            let result = CryptProtectData(
                &mut blob_in,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut blob_out,
            );

            if let Err(e) = result {
                return Err(DpapiError::EncryptionFailed(e.to_string()));
            }

            take_blob(blob_out)
        }
    }

    /// Decrypts data using DPAPI
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, DpapiError> {
        if encrypted.is_empty() {
            return Ok(Vec::new());
        }

        unsafe {
            let mut blob_in = CRYPT_INTEGER_BLOB {
                cbData: encrypted.len() as u32,
                pbData: encrypted.as_ptr() as *mut u8,
            };
            let mut blob_out = CRYPT_INTEGER_BLOB::default();

            let result = CryptUnprotectData(
                &mut blob_in,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut blob_out,
            );

            if let Err(e) = result {
                return Err(DpapiError::DecryptionFailed(e.to_string()));
            }

            take_blob(blob_out)
        }
    }
}

/// Copies a DPAPI-allocated blob and frees the original
unsafe fn take_blob(blob: CRYPT_INTEGER_BLOB) -> Result<Vec<u8>, DpapiError> {
    if blob.pbData.is_null() || blob.cbData == 0 {
        return Err(DpapiError::MemoryError);
    }

    let bytes = std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec();
    LocalFree(blob.pbData as *mut std::ffi::c_void);
    Ok(bytes)
}
