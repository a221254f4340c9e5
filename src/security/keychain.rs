//! Read-only access to the browser's "Safe Storage" secret
//!
//! On macOS the secret lives in the login Keychain, on Linux in the Secret
//! Service. Both are reached through the keyring crate. The secret is never
//! written back or modified.

use keyring::Entry;
use thiserror::Error;
use zeroize::Zeroizing;

/// Password Chromium uses on Linux when no secret service is available
pub const BASIC_STORE_PASSWORD: &str = "peanuts";

/// Errors that can occur while reading the keystore
#[derive(Debug, Error)]
pub enum KeychainError {
    /// No entry for this service/account pair
    #[error("No keystore entry for {service}/{account}")]
    NotFound { service: String, account: String },

    /// The keystore exists but refused access (locked, denied prompt)
    #[error("Keystore access denied: {0}")]
    AccessDenied(String),

    /// Anything else the platform reported
    #[error("Keystore error: {0}")]
    Other(String),
}

/// A single keystore entry identified by service and account
///
/// # Example
///
/// ```no_run
/// use cookie_bot::security::KeychainEntry;
///
/// let entry = KeychainEntry::new("Chrome Safe Storage", "Chrome");
/// let password = entry.read_password().unwrap();
/// assert!(!password.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeychainEntry {
    service: String,
    account: String,
}

impl KeychainEntry {
    /// Creates a handle for the given service and account
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    /// Returns the service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the account name
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Reads the stored password
    pub fn read_password(&self) -> Result<Zeroizing<String>, KeychainError> {
        let entry = Entry::new(&self.service, &self.account).map_err(|e| self.classify(e))?;
        entry
            .get_password()
            .map(Zeroizing::new)
            .map_err(|e| self.classify(e))
    }

    fn classify(&self, err: keyring::Error) -> KeychainError {
        match err {
            keyring::Error::NoEntry => KeychainError::NotFound {
                service: self.service.clone(),
                account: self.account.clone(),
            },
            keyring::Error::NoStorageAccess(e) => KeychainError::AccessDenied(e.to_string()),
            keyring::Error::PlatformFailure(e) => KeychainError::AccessDenied(e.to_string()),
            other => KeychainError::Other(other.to_string()),
        }
    }
}
