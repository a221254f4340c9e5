//! Cookie value decryption
//!
//! Chromium prefixes encrypted values with a version tag. The same `v10`
//! tag means AES-128-CBC on macOS/Linux and AES-256-GCM on Windows, so the
//! tag is interpreted together with the platform's [`CipherScheme`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use super::key_provider::{CipherScheme, MasterKey};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// IV Chromium uses for every CBC-encrypted value
pub const CBC_IV: [u8; 16] = [b' '; 16];

/// Length of the AES-GCM nonce that follows the version tag
pub const GCM_NONCE_LEN: usize = 12;

/// Length of the AES-GCM authentication tag
pub const GCM_TAG_LEN: usize = 16;

/// Length of the SHA-256 host hash on domain-bound values
pub const DOMAIN_HASH_LEN: usize = 32;

/// Errors that can occur while decrypting one cookie
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptError {
    /// Padding, tag, domain binding or UTF-8 check failed
    #[error("Cookie decryption failed: {0}")]
    DecryptionFailed(String),

    /// The record's version cannot be handled with this key
    #[error("Unsupported cookie encryption version: {0}")]
    UnsupportedVersion(String),
}

/// How a stored cookie value is protected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionVersion {
    /// Stored in the clear `value` column
    Plaintext,
    /// `v10` with AES-128-CBC and a fixed IV
    Legacy,
    /// `v11` with AES-128-CBC, keyed from the OS keystore (Linux)
    LegacyKeyring,
    /// `v10`/`v11` with AES-256-GCM, explicit nonce and tag
    Authenticated,
    /// Anything else (e.g. app-bound `v20`, bare DPAPI blobs)
    Unsupported(String),
}

impl EncryptionVersion {
    /// Classifies a stored value, returning the version and the payload after the tag
    pub fn classify<'a>(
        plain_value: &'a [u8],
        encrypted: &'a [u8],
        scheme: CipherScheme,
    ) -> (Self, &'a [u8]) {
        if encrypted.is_empty() {
            return (EncryptionVersion::Plaintext, plain_value);
        }
        match encrypted.get(..3) {
            Some(tag @ (b"v10" | b"v11")) => {
                let version = match (scheme, tag) {
                    (CipherScheme::Aead, _) => EncryptionVersion::Authenticated,
                    (CipherScheme::Cbc, b"v10") => EncryptionVersion::Legacy,
                    (CipherScheme::Cbc, _) => EncryptionVersion::LegacyKeyring,
                };
                (version, &encrypted[3..])
            }
            Some(tag) if tag[0] == b'v' && tag[1..].iter().all(u8::is_ascii_digit) => (
                EncryptionVersion::Unsupported(String::from_utf8_lossy(tag).into_owned()),
                encrypted,
            ),
            _ => (
                EncryptionVersion::Unsupported("untagged".to_string()),
                encrypted,
            ),
        }
    }
}

/// An encrypted cookie as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCookieRecord {
    pub name: String,
    pub host_key: String,
    pub version: EncryptionVersion,
    /// Bytes after the version tag
    pub payload: Vec<u8>,
    /// Plaintext is prefixed with SHA-256 of `host_key`
    pub domain_bound: bool,
}

/// A decrypted cookie
#[derive(Clone, PartialEq, Eq)]
pub struct PlainCookie {
    pub name: String,
    pub value: String,
}

impl std::fmt::Debug for PlainCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Decrypts a record with the given key
///
/// Pure: the same record and key always produce the same result.
pub fn decrypt(record: &RawCookieRecord, key: &MasterKey) -> Result<PlainCookie, DecryptError> {
    let plaintext: Zeroizing<Vec<u8>> = match (&record.version, key) {
        (EncryptionVersion::Plaintext, _) => return decode_plaintext(record),
        (EncryptionVersion::Legacy, MasterKey::Cbc { v10, .. }) => {
            decrypt_cbc(&v10[..], &record.payload)?
        }
        (EncryptionVersion::LegacyKeyring, MasterKey::Cbc { v11: Some(k), .. }) => {
            decrypt_cbc(&k[..], &record.payload)?
        }
        (EncryptionVersion::LegacyKeyring, MasterKey::Cbc { v11: None, .. }) => {
            return Err(DecryptError::UnsupportedVersion(
                "v11 record but no keystore secret".into(),
            ))
        }
        (EncryptionVersion::Authenticated, MasterKey::Aead(k)) => {
            decrypt_gcm(&k[..], &record.payload)?
        }
        (EncryptionVersion::Unsupported(tag), _) => {
            return Err(DecryptError::UnsupportedVersion(tag.clone()))
        }
        (version, key) => {
            return Err(DecryptError::UnsupportedVersion(format!(
                "{:?} record with {:?} key",
                version,
                key.scheme()
            )))
        }
    };

    let body = if record.domain_bound {
        strip_domain_hash(&plaintext, &record.host_key)?
    } else {
        &plaintext[..]
    };
    to_cookie(&record.name, body)
}

/// Decodes a record stored in the clear; no key is involved
pub fn decode_plaintext(record: &RawCookieRecord) -> Result<PlainCookie, DecryptError> {
    if record.version != EncryptionVersion::Plaintext {
        return Err(DecryptError::UnsupportedVersion(format!(
            "{:?} record needs a key",
            record.version
        )));
    }
    to_cookie(&record.name, &record.payload)
}

fn to_cookie(name: &str, body: &[u8]) -> Result<PlainCookie, DecryptError> {
    let value = std::str::from_utf8(body)
        .map_err(|e| DecryptError::DecryptionFailed(format!("UTF-8 error: {}", e)))?
        .to_string();

    Ok(PlainCookie {
        name: name.to_string(),
        value,
    })
}

fn decrypt_cbc(key: &[u8], payload: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    let cipher = Aes128CbcDec::new_from_slices(key, &CBC_IV)
        .map_err(|e| DecryptError::DecryptionFailed(format!("Invalid key: {}", e)))?;
    let mut buf = Zeroizing::new(payload.to_vec());
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| DecryptError::DecryptionFailed("bad padding or block length".into()))?
        .len();
    buf.truncate(len);
    Ok(buf)
}

fn decrypt_gcm(key: &[u8], payload: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    // Structure: nonce (12 bytes) + ciphertext + tag (16 bytes)
    if payload.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
        return Err(DecryptError::DecryptionFailed("Encrypted data too short".into()));
    }
    let (nonce, ciphertext) = payload.split_at(GCM_NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| DecryptError::DecryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| DecryptError::DecryptionFailed("authentication tag mismatch".into()))
}

fn strip_domain_hash<'a>(plaintext: &'a [u8], host_key: &str) -> Result<&'a [u8], DecryptError> {
    let expected = Sha256::digest(host_key.as_bytes());
    if plaintext.len() >= DOMAIN_HASH_LEN {
        let (hash, rest) = plaintext.split_at(DOMAIN_HASH_LEN);
        if hash == expected.as_slice() {
            return Ok(rest);
        }
    }
    Err(DecryptError::DecryptionFailed(format!(
        "value is not bound to host {}",
        host_key
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encrypt_cbc, encrypt_cbc_unpadded, encrypt_gcm, TEST_AEAD_KEY};

    fn cbc_key() -> MasterKey {
        MasterKey::derive_cbc(b"peanuts", 1)
    }

    fn aead_key() -> MasterKey {
        MasterKey::aead_from_slice(&TEST_AEAD_KEY).unwrap()
    }

    fn record(version: EncryptionVersion, payload: Vec<u8>) -> RawCookieRecord {
        RawCookieRecord {
            name: "dsid".into(),
            host_key: ".icloud.com".into(),
            version,
            payload,
            domain_bound: false,
        }
    }

    #[test]
    fn test_classify_versions() {
        let (v, p) = EncryptionVersion::classify(b"clear", b"", CipherScheme::Cbc);
        assert_eq!(v, EncryptionVersion::Plaintext);
        assert_eq!(p, b"clear");

        let (v, p) = EncryptionVersion::classify(b"", b"v10abc", CipherScheme::Cbc);
        assert_eq!(v, EncryptionVersion::Legacy);
        assert_eq!(p, b"abc");

        let (v, p) = EncryptionVersion::classify(b"", b"v11abc", CipherScheme::Cbc);
        assert_eq!(v, EncryptionVersion::LegacyKeyring);
        assert_eq!(p, b"abc");

        let (v, _) = EncryptionVersion::classify(b"", b"v11abc", CipherScheme::Aead);
        assert_eq!(v, EncryptionVersion::Authenticated);

        let (v, _) = EncryptionVersion::classify(b"", b"v20abc", CipherScheme::Aead);
        assert_eq!(v, EncryptionVersion::Unsupported("v20".into()));

        let (v, _) = EncryptionVersion::classify(b"", &[1, 0, 0, 0, 208], CipherScheme::Aead);
        assert_eq!(v, EncryptionVersion::Unsupported("untagged".into()));
    }

    #[test]
    fn test_decrypt_legacy() {
        let key = cbc_key();
        let payload = encrypt_cbc(&key, b"session-token-value");
        let cookie = decrypt(&record(EncryptionVersion::Legacy, payload), &key).unwrap();
        assert_eq!(cookie.name, "dsid");
        assert_eq!(cookie.value, "session-token-value");
    }

    #[test]
    fn test_decrypt_picks_key_by_tag() {
        let basic = cbc_key();
        let keystore = MasterKey::derive_cbc(b"secret", 1);
        let key = cbc_key().with_v11(b"secret", 1);

        let v10 = record(EncryptionVersion::Legacy, encrypt_cbc(&basic, b"from-v10"));
        let v11 = record(EncryptionVersion::LegacyKeyring, encrypt_cbc(&keystore, b"from-v11"));
        assert_eq!(decrypt(&v10, &key).unwrap().value, "from-v10");
        assert_eq!(decrypt(&v11, &key).unwrap().value, "from-v11");

        // A v11 value cannot be read with the basic key alone
        assert!(matches!(
            decrypt(&v11, &basic),
            Err(DecryptError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_decrypt_legacy_bad_padding() {
        let key = cbc_key();
        // Decrypts to a block ending in 0x00, which is never valid PKCS#7
        let payload = encrypt_cbc_unpadded(&key, &[0u8; 16]);
        let err = decrypt(&record(EncryptionVersion::Legacy, payload), &key).unwrap_err();
        assert!(matches!(err, DecryptError::DecryptionFailed(_)));

        let err = decrypt(&record(EncryptionVersion::Legacy, vec![1, 2, 3]), &key).unwrap_err();
        assert!(matches!(err, DecryptError::DecryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_authenticated() {
        let key = aead_key();
        let payload = encrypt_gcm(&key, &[9u8; 12], b"trust-token");
        let cookie = decrypt(&record(EncryptionVersion::Authenticated, payload), &key).unwrap();
        assert_eq!(cookie.value, "trust-token");
    }

    #[test]
    fn test_decrypt_authenticated_rejects_tampering() {
        let key = aead_key();
        let mut payload = encrypt_gcm(&key, &[9u8; 12], b"trust-token");
        payload[GCM_NONCE_LEN] ^= 0x01;
        let err = decrypt(&record(EncryptionVersion::Authenticated, payload), &key).unwrap_err();
        assert_eq!(
            err,
            DecryptError::DecryptionFailed("authentication tag mismatch".into())
        );

        let err = decrypt(
            &record(EncryptionVersion::Authenticated, vec![0u8; 20]),
            &key,
        )
        .unwrap_err();
        assert!(matches!(err, DecryptError::DecryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_wrong_key_scheme() {
        let payload = encrypt_cbc(&cbc_key(), b"value");
        let err = decrypt(&record(EncryptionVersion::Legacy, payload), &aead_key()).unwrap_err();
        assert!(matches!(err, DecryptError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_decrypt_unsupported_version() {
        let err = decrypt(
            &record(EncryptionVersion::Unsupported("v20".into()), vec![1, 2]),
            &cbc_key(),
        )
        .unwrap_err();
        assert_eq!(err, DecryptError::UnsupportedVersion("v20".into()));
    }

    #[test]
    fn test_decrypt_plaintext_ignores_key() {
        let cookie = decrypt(
            &record(EncryptionVersion::Plaintext, b"clear".to_vec()),
            &aead_key(),
        )
        .unwrap();
        assert_eq!(cookie.value, "clear");
    }

    #[test]
    fn test_domain_bound_values() {
        let key = cbc_key();
        let mut bound = Sha256::digest(b".icloud.com").to_vec();
        bound.extend_from_slice(b"bound-value");

        let mut rec = record(EncryptionVersion::Legacy, encrypt_cbc(&key, &bound));
        rec.domain_bound = true;
        assert_eq!(decrypt(&rec, &key).unwrap().value, "bound-value");

        rec.host_key = ".apple.com".into();
        assert!(matches!(
            decrypt(&rec, &key),
            Err(DecryptError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_decrypt_is_idempotent() {
        let key = aead_key();
        let good = record(
            EncryptionVersion::Authenticated,
            encrypt_gcm(&key, &[3u8; 12], b"same"),
        );
        assert_eq!(decrypt(&good, &key), decrypt(&good, &key));

        let bad = record(EncryptionVersion::Authenticated, vec![0u8; 40]);
        assert_eq!(decrypt(&bad, &key), decrypt(&bad, &key));
    }

    #[test]
    fn test_decode_plaintext_needs_no_key() {
        let cookie = decode_plaintext(&record(EncryptionVersion::Plaintext, b"clear".to_vec())).unwrap();
        assert_eq!(cookie.value, "clear");

        let err = decode_plaintext(&record(EncryptionVersion::Legacy, vec![0u8; 16])).unwrap_err();
        assert!(matches!(err, DecryptError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_plain_cookie_debug_is_redacted() {
        let cookie = PlainCookie {
            name: "dsid".into(),
            value: "secret".into(),
        };
        assert!(!format!("{:?}", cookie).contains("secret"));
    }
}
