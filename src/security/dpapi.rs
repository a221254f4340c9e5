//! Windows DPAPI (Data Protection API) integration
//!
//! Chromium wraps its cookie master key with DPAPI before writing it to
//! `Local State`. Only the Windows account that wrapped it can unwrap it, so
//! this module never prompts and never tries another account's credentials.

use thiserror::Error;
use zeroize::Zeroizing;

/// Prefix Chromium puts in front of a DPAPI-wrapped key in `Local State`
pub const DPAPI_KEY_PREFIX: &[u8] = b"DPAPI";

/// Errors that can occur during DPAPI operations
#[derive(Debug, Error)]
pub enum DpapiError {
    /// The blob is not in the shape Chromium writes
    #[error("Malformed protected blob: {0}")]
    Malformed(String),

    /// CryptUnprotectData refused the blob (wrong user, corrupted blob)
    #[error("DPAPI decryption failed: {0}")]
    DecryptionFailed(String),

    /// Memory allocation error
    #[error("Memory allocation error")]
    MemoryError,
}

/// DPAPI-based key unwrapping
///
/// Uses the Windows Data Protection API to decrypt data tied to the
/// current user account.
pub struct DpapiStore;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use windows::Win32::Security::Cryptography::{
        CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
    };

    // Import LocalFree from kernel32
    #[link(name = "kernel32")]
    extern "system" {
        fn LocalFree(hMem: *mut std::ffi::c_void) -> *mut std::ffi::c_void;
    }

    impl DpapiStore {
        /// Decrypts data using DPAPI
        pub fn decrypt(&self, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>, DpapiError> {
            if encrypted.is_empty() {
                return Err(DpapiError::Malformed("empty blob".into()));
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
                    return Err(DpapiError::DecryptionFailed(e.message().to_string()));
                }

                if blob_out.pbData.is_null() || blob_out.cbData == 0 {
                    return Err(DpapiError::MemoryError);
                }

                let decrypted = Zeroizing::new(
                    std::slice::from_raw_parts(blob_out.pbData, blob_out.cbData as usize)
                        .to_vec(),
                );

                // The output buffer holds key material; wipe it before handing it back
                std::ptr::write_bytes(blob_out.pbData, 0, blob_out.cbData as usize);
                LocalFree(blob_out.pbData as *mut std::ffi::c_void);

                Ok(decrypted)
            }
        }
    }
}

impl DpapiStore {
    /// Creates a new DpapiStore
    pub fn new() -> Self {
        Self
    }

    /// Unwraps a Chromium `os_crypt.encrypted_key` blob (already base64-decoded)
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, DpapiError> {
        let blob = strip_key_prefix(wrapped)?;
        self.decrypt(blob)
    }

    #[cfg(not(windows))]
    pub fn decrypt(&self, _encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>, DpapiError> {
        Err(DpapiError::DecryptionFailed(
            "DPAPI is only available on Windows".into(),
        ))
    }
}

impl Default for DpapiStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the `DPAPI` marker Chromium prepends to the wrapped key
pub fn strip_key_prefix(wrapped: &[u8]) -> Result<&[u8], DpapiError> {
    match wrapped.strip_prefix(DPAPI_KEY_PREFIX) {
        Some(rest) if !rest.is_empty() => Ok(rest),
        Some(_) => Err(DpapiError::Malformed("nothing after DPAPI prefix".into())),
        None => Err(DpapiError::Malformed("missing DPAPI prefix".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_key_prefix() {
        assert_eq!(strip_key_prefix(b"DPAPIabc").unwrap(), b"abc");
        assert!(matches!(
            strip_key_prefix(b"DPAPI"),
            Err(DpapiError::Malformed(_))
        ));
        assert!(matches!(
            strip_key_prefix(b"XXXXXabc"),
            Err(DpapiError::Malformed(_))
        ));
        assert!(matches!(strip_key_prefix(b""), Err(DpapiError::Malformed(_))));
    }

    #[test]
    fn test_unwrap_key_rejects_unprefixed_blob() {
        let store = DpapiStore::new();
        assert!(matches!(
            store.unwrap_key(b"not-a-key"),
            Err(DpapiError::Malformed(_))
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_dpapi_unavailable_off_windows() {
        let store = DpapiStore::new();
        assert!(matches!(
            store.decrypt(b"blob"),
            Err(DpapiError::DecryptionFailed(_))
        ));
    }

    #[cfg(windows)]
    #[test]
    fn test_dpapi_rejects_garbage() {
        let store = DpapiStore::new();
        assert!(store.decrypt(b"definitely not a dpapi blob").is_err());
    }
}
