//! Master key resolution for the browser's cookie encryption
//!
//! Chromium encrypts cookie values with a key that the OS protects:
//! - macOS/Linux: a "Safe Storage" password in the Keychain / Secret Service,
//!   stretched with PBKDF2 into an AES-128 key
//! - Windows: a random AES-256 key stored in `Local State`, wrapped with DPAPI
//!
//! Keys are resolved once per source and cached for the process lifetime.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use once_cell::sync::OnceCell;
use sha1::Sha1;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{BrowserSettings, Profile};
use crate::security::{DpapiError, DpapiStore, KeychainEntry, KeychainError, BASIC_STORE_PASSWORD};

/// Salt Chromium uses for PBKDF2 on macOS and Linux
const PBKDF2_SALT: &[u8] = b"saltysalt";

/// PBKDF2 rounds used by Chromium on macOS
pub const MACOS_ITERATIONS: u32 = 1003;

/// PBKDF2 rounds used by Chromium on Linux
pub const LINUX_ITERATIONS: u32 = 1;

/// Errors that can occur while resolving the master key
///
/// The two variants need different remediation and are never retried
/// within the same cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Key material does not exist where expected (configuration problem)
    #[error("Key unavailable: {0}")]
    Unavailable(String),

    /// Key material exists but the OS refused access (credential problem)
    #[error("Key access denied: {0}")]
    AccessDenied(String),
}

impl From<KeychainError> for KeyError {
    fn from(err: KeychainError) -> Self {
        match err {
            KeychainError::NotFound { .. } | KeychainError::Other(_) => {
                KeyError::Unavailable(err.to_string())
            }
            KeychainError::AccessDenied(_) => KeyError::AccessDenied(err.to_string()),
        }
    }
}

impl From<DpapiError> for KeyError {
    fn from(err: DpapiError) -> Self {
        match err {
            DpapiError::Malformed(_) => KeyError::Unavailable(err.to_string()),
            DpapiError::DecryptionFailed(_) | DpapiError::MemoryError => {
                KeyError::AccessDenied(err.to_string())
            }
        }
    }
}

/// The resolved cookie master key
///
/// Key bytes are wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub enum MasterKey {
    /// AES-128-CBC keys (macOS/Linux)
    ///
    /// `v10` values use the first key. On Linux that is the basic-store
    /// password and `v11` values use the keystore secret, when there is one.
    Cbc {
        v10: Zeroizing<[u8; 16]>,
        v11: Option<Zeroizing<[u8; 16]>>,
    },
    /// AES-256-GCM key (Windows)
    Aead(Zeroizing<[u8; 32]>),
}

fn pbkdf2_key(password: &[u8], iterations: u32) -> Zeroizing<[u8; 16]> {
    let mut key = Zeroizing::new([0u8; 16]);
    pbkdf2::pbkdf2_hmac::<Sha1>(password, PBKDF2_SALT, iterations, &mut key[..]);
    key
}

impl MasterKey {
    /// Derives the `v10` CBC key from a Safe Storage password
    pub fn derive_cbc(password: &[u8], iterations: u32) -> Self {
        MasterKey::Cbc {
            v10: pbkdf2_key(password, iterations),
            v11: None,
        }
    }

    /// Adds the `v11` key derived from a keystore secret (CBC keys only)
    pub fn with_v11(self, password: &[u8], iterations: u32) -> Self {
        match self {
            MasterKey::Cbc { v10, .. } => MasterKey::Cbc {
                v10,
                v11: Some(pbkdf2_key(password, iterations)),
            },
            aead => aead,
        }
    }

    /// Wraps raw AES-256 key bytes
    pub fn aead_from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            KeyError::Unavailable(format!("expected a 32-byte key, got {} bytes", bytes.len()))
        })?;
        Ok(MasterKey::Aead(Zeroizing::new(key)))
    }

    /// Returns the scheme this key decrypts
    pub fn scheme(&self) -> CipherScheme {
        match self {
            MasterKey::Cbc { .. } => CipherScheme::Cbc,
            MasterKey::Aead(_) => CipherScheme::Aead,
        }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKey::Cbc { v11, .. } => write!(
                f,
                "MasterKey::Cbc(<redacted>, v11: {})",
                if v11.is_some() { "<redacted>" } else { "none" }
            ),
            MasterKey::Aead(_) => f.write_str("MasterKey::Aead(<redacted>)"),
        }
    }
}

/// Which cipher `v10`/`v11` records use on this platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherScheme {
    /// AES-128-CBC with a derived key (macOS/Linux)
    Cbc,
    /// AES-256-GCM with a DPAPI-wrapped key (Windows)
    Aead,
}

impl CipherScheme {
    /// Scheme of the current build target
    pub fn native() -> Self {
        if cfg!(windows) {
            CipherScheme::Aead
        } else {
            CipherScheme::Cbc
        }
    }
}

/// Where a master key comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySource {
    /// Safe Storage password in the OS keystore
    Keychain {
        entry: KeychainEntry,
        iterations: u32,
        /// `v10` uses Chromium's basic-store password and the keystore backs `v11` (Linux)
        basic_v10: bool,
    },
    /// DPAPI-wrapped key in a `Local State` file
    LocalState { path: PathBuf },
}

impl KeySource {
    /// Key source for a profile on the current build target
    pub fn for_profile(profile: &Profile, settings: &BrowserSettings) -> Self {
        if cfg!(windows) {
            KeySource::LocalState {
                path: profile.user_data_dir().join("Local State"),
            }
        } else {
            KeySource::Keychain {
                entry: KeychainEntry::new(&settings.keychain_service, &settings.keychain_account),
                iterations: if cfg!(target_os = "macos") {
                    MACOS_ITERATIONS
                } else {
                    LINUX_ITERATIONS
                },
                basic_v10: cfg!(target_os = "linux"),
            }
        }
    }

    /// Reads the key material from the OS
    pub fn fetch(&self) -> Result<MasterKey, KeyError> {
        match self {
            KeySource::Keychain {
                entry,
                iterations,
                basic_v10,
            } => keychain_key(entry.read_password(), *iterations, *basic_v10),
            KeySource::LocalState { path } => {
                let wrapped = read_wrapped_key(path)?;
                let key = DpapiStore::new().unwrap_key(&wrapped)?;
                MasterKey::aead_from_slice(&key)
            }
        }
    }
}

/// Builds the CBC key from the outcome of a keystore lookup
///
/// With `basic_v10`, a missing secret only leaves `v11` undecryptable. A
/// denied or failing keystore is always an error.
pub fn keychain_key(
    password: Result<Zeroizing<String>, KeychainError>,
    iterations: u32,
    basic_v10: bool,
) -> Result<MasterKey, KeyError> {
    if !basic_v10 {
        let password = password?;
        return Ok(MasterKey::derive_cbc(password.as_bytes(), iterations));
    }

    let key = MasterKey::derive_cbc(BASIC_STORE_PASSWORD.as_bytes(), iterations);
    match password {
        Ok(password) => Ok(key.with_v11(password.as_bytes(), iterations)),
        Err(KeychainError::NotFound { service, .. }) => {
            tracing::debug!(service = %service, "No Safe Storage secret, only v10 values are readable");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Extracts and base64-decodes `os_crypt.encrypted_key` from `Local State`
pub fn read_wrapped_key(path: &Path) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            KeyError::AccessDenied(format!("{}: {}", path.display(), e))
        }
        _ => KeyError::Unavailable(format!("{}: {}", path.display(), e)),
    })?;

    let json: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| KeyError::Unavailable(format!("Local State is not JSON: {}", e)))?;

    let encoded = json
        .get("os_crypt")
        .and_then(|v| v.get("encrypted_key"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| KeyError::Unavailable("os_crypt.encrypted_key missing".into()))?;

    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(Zeroizing::new)
        .map_err(|e| KeyError::Unavailable(format!("encrypted_key is not base64: {}", e)))
}

/// Resolves the master key for a profile
#[cfg_attr(test, mockall::automock)]
pub trait KeyProvider: Send + Sync {
    fn resolve_key(&self, profile: &Profile) -> Result<Arc<MasterKey>, KeyError>;
}

type Fetcher = dyn Fn(&KeySource) -> Result<MasterKey, KeyError> + Send + Sync;

/// Key provider backed by the OS keystores, with a per-source cache
///
/// The cache slots are created up front for every configured profile, so a
/// resolved key is read without taking any lock.
pub struct PlatformKeyProvider {
    sources: HashMap<String, KeySource>,
    cache: HashMap<KeySource, OnceCell<Arc<MasterKey>>>,
    fetch: Box<Fetcher>,
}

impl PlatformKeyProvider {
    /// Creates a provider for the given profiles
    pub fn new(profiles: &[Profile], settings: &BrowserSettings) -> Self {
        Self::with_fetcher(profiles, settings, |source| source.fetch())
    }

    /// Creates a provider with a custom fetch function (used by tests)
    pub fn with_fetcher<F>(profiles: &[Profile], settings: &BrowserSettings, fetch: F) -> Self
    where
        F: Fn(&KeySource) -> Result<MasterKey, KeyError> + Send + Sync + 'static,
    {
        let sources: HashMap<String, KeySource> = profiles
            .iter()
            .map(|p| (p.id.clone(), KeySource::for_profile(p, settings)))
            .collect();
        let cache = sources
            .values()
            .map(|source| (source.clone(), OnceCell::new()))
            .collect();
        Self {
            sources,
            cache,
            fetch: Box::new(fetch),
        }
    }

    /// Number of distinct key sources the configured profiles use
    pub fn source_count(&self) -> usize {
        self.cache.len()
    }
}

impl KeyProvider for PlatformKeyProvider {
    fn resolve_key(&self, profile: &Profile) -> Result<Arc<MasterKey>, KeyError> {
        let Some(source) = self.sources.get(&profile.id) else {
            // Not configured at startup: resolve without caching
            return KeySource::for_profile(profile, &BrowserSettings::default())
                .fetch()
                .map(Arc::new);
        };
        let slot = self
            .cache
            .get(source)
            .ok_or_else(|| KeyError::Unavailable("key cache slot missing".into()))?;
        slot.get_or_try_init(|| {
            tracing::debug!(profile = %profile.id, "Resolving cookie master key");
            (self.fetch)(source).map(Arc::new)
        })
        .cloned()
    }
}

/// Key provider that always returns the same key
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: Arc<MasterKey>,
}

impl StaticKeyProvider {
    pub fn new(key: MasterKey) -> Self {
        Self { key: Arc::new(key) }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn resolve_key(&self, _profile: &Profile) -> Result<Arc<MasterKey>, KeyError> {
        Ok(Arc::clone(&self.key))
    }
}
