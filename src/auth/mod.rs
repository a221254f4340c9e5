//! Authentication module - Cookie store access and decryption
//!
//! Reads the browser's encrypted cookie database:
//! - Master key resolution (Keychain / Secret Service / DPAPI)
//! - Read-only store snapshots via rusqlite
//! - AES-CBC and AES-GCM cookie decryption

mod cookie_decryptor;
mod cookie_store;
mod key_provider;

pub use cookie_decryptor::{
    decode_plaintext, decrypt, DecryptError, EncryptionVersion, PlainCookie, RawCookieRecord, CBC_IV,
    DOMAIN_HASH_LEN,
};
pub use cookie_store::{
    opener_for, DirectOpener, SnapshotOpener, StoreError, StoreHandle, StoreOpener,
    DOMAIN_BOUND_SCHEMA_VERSION,
};
pub use key_provider::{
    CipherScheme, KeyError, KeyProvider, KeySource, MasterKey, PlatformKeyProvider,
    StaticKeyProvider, LINUX_ITERATIONS, MACOS_ITERATIONS,
};

#[cfg(test)]
pub use key_provider::MockKeyProvider;
