//! Security module - Secret memory handling and platform encryption
//!
//! This module provides security primitives for:
//! - Zeroize-on-drop buffers for cache payloads
//! - DPAPI-based encryption on Windows

mod secure_bytes;

pub use secure_bytes::SecureBytes;

#[cfg(windows)]
mod dpapi;
#[cfg(windows)]
pub use dpapi::{DpapiError, DpapiStore};
