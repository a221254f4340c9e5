//! Shared fixtures for unit tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, TimeZone, Utc};

use crate::auth::{MasterKey, CBC_IV};
use crate::config::{AppConfig, Profile};
use crate::generator::{Artifact, GenerationError, Generator};
use crate::session::SessionRecord;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

pub const TEST_AEAD_KEY: [u8; 32] = [
    0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77,
    0x81, 0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14,
    0xdf, 0xf4,
];

fn cbc_key(key: &MasterKey) -> &[u8] {
    match key {
        MasterKey::Cbc { v10, .. } => &v10[..],
        MasterKey::Aead(_) => panic!("expected a CBC key"),
    }
}

/// Encrypts like Chromium on macOS/Linux with the `v10` key (payload without the tag)
pub fn encrypt_cbc(key: &MasterKey, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new_from_slices(cbc_key(key), &CBC_IV)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Encrypts exactly one block without adding padding
pub fn encrypt_cbc_unpadded(key: &MasterKey, block: &[u8; 16]) -> Vec<u8> {
    Aes128CbcEnc::new_from_slices(cbc_key(key), &CBC_IV)
        .unwrap()
        .encrypt_padded_vec_mut::<NoPadding>(block)
}

/// Encrypts like Chromium on Windows: nonce || ciphertext || tag
pub fn encrypt_gcm(key: &MasterKey, nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    let MasterKey::Aead(k) = key else {
        panic!("expected an AEAD key");
    };
    let cipher = Aes256Gcm::new_from_slice(&k[..]).unwrap();
    let mut out = nonce.to_vec();
    out.extend(cipher.encrypt(Nonce::from_slice(nonce), plaintext).unwrap());
    out
}

enum FixtureValue {
    Plain(String),
    Encrypted(Vec<u8>),
}

struct FixtureRow {
    host_key: String,
    name: String,
    value: FixtureValue,
    expires_utc: i64,
}

/// Builds a Chromium-shaped cookie database on disk
pub struct CookieDbBuilder {
    path: PathBuf,
    schema_version: i64,
    rows: Vec<FixtureRow>,
}

impl CookieDbBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 21,
            rows: Vec::new(),
        }
    }

    pub fn schema_version(mut self, version: i64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn plaintext(self, host: &str, name: &str, value: &str) -> Self {
        self.plaintext_expiring(host, name, value, 13_400_000_000_000_000)
    }

    pub fn plaintext_expiring(mut self, host: &str, name: &str, value: &str, expires: i64) -> Self {
        self.rows.push(FixtureRow {
            host_key: host.into(),
            name: name.into(),
            value: FixtureValue::Plain(value.into()),
            expires_utc: expires,
        });
        self
    }

    pub fn encrypted(mut self, host: &str, name: &str, tag: &[u8], payload: &[u8]) -> Self {
        let mut blob = tag.to_vec();
        blob.extend_from_slice(payload);
        self.rows.push(FixtureRow {
            host_key: host.into(),
            name: name.into(),
            value: FixtureValue::Encrypted(blob),
            expires_utc: 13_400_000_000_000_000,
        });
        self
    }

    pub fn build(self) -> PathBuf {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let conn = rusqlite::Connection::open(&self.path).unwrap();
        conn.execute_batch(
            "CREATE TABLE meta (key LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY, value LONGVARCHAR);
             CREATE TABLE cookies (
                 creation_utc INTEGER NOT NULL,
                 host_key TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value TEXT NOT NULL,
                 encrypted_value BLOB NOT NULL DEFAULT '',
                 path TEXT NOT NULL DEFAULT '/',
                 expires_utc INTEGER NOT NULL,
                 is_secure INTEGER NOT NULL DEFAULT 1,
                 is_httponly INTEGER NOT NULL DEFAULT 1
             );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('version', ?1)",
            [self.schema_version.to_string()],
        )
        .unwrap();

        for (i, row) in self.rows.iter().enumerate() {
            let (value, encrypted): (&str, &[u8]) = match &row.value {
                FixtureValue::Plain(v) => (v.as_str(), &[]),
                FixtureValue::Encrypted(blob) => ("", blob.as_slice()),
            };
            conn.execute(
                "INSERT INTO cookies (creation_utc, host_key, name, value, encrypted_value, expires_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![i as i64, row.host_key, row.name, value, encrypted, row.expires_utc],
            )
            .unwrap();
        }
        self.path
    }
}

/// Writes a profile directory whose store holds `count` of the required
/// cookies, all `v10`-encrypted with `key`
pub fn profile_with_cookies(
    root: &Path,
    id: &str,
    key: &MasterKey,
    config: &AppConfig,
    count: usize,
) -> Profile {
    let dir = root.join(id);
    let mut builder = CookieDbBuilder::new(dir.join("Network").join("Cookies"));
    for name in config.required_cookies.iter().take(count) {
        let value = format!("{}-{}", id, name);
        builder = builder.encrypted(
            &format!(".{}", config.cookie_domain),
            name,
            b"v10",
            &encrypt_cbc(key, value.as_bytes()),
        );
    }
    builder.build();
    Profile::new(id, id, dir)
}

/// Config rooted in a temp dir with sensible test values
pub fn test_config(root: &Path, profiles: Vec<Profile>) -> AppConfig {
    AppConfig {
        profiles,
        email_limit_per_hour: 1,
        refresh_interval_minutes: 60,
        sessions_dir: root.join("sessions"),
        browser: crate::config::BrowserSettings {
            snapshot_store: false,
            ..Default::default()
        },
        generator: crate::config::GeneratorSettings {
            batch_gap_secs: 0,
            ..Default::default()
        },
        ..AppConfig::default()
    }
}

/// Fixed origin for time-driven tests
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn minutes(m: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(m)
}

/// Scripted generator recording every call
#[derive(Default)]
pub struct FakeGenerator {
    calls: AtomicU32,
    per_profile: Mutex<BTreeMap<String, u32>>,
    scripted: Mutex<BTreeMap<String, Vec<GenerationError>>>,
    failing_calls: Mutex<BTreeMap<(String, u32), GenerationError>>,
    delay: Option<Duration>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queues an error for the next call made for `profile_id`
    pub fn fail_next(&self, profile_id: &str, error: GenerationError) {
        self.scripted
            .lock()
            .unwrap()
            .entry(profile_id.to_string())
            .or_default()
            .push(error);
    }

    /// Makes the `call`-th call (1-based) for `profile_id` fail
    pub fn fail_call(&self, profile_id: &str, call: u32, error: GenerationError) {
        self.failing_calls
            .lock()
            .unwrap()
            .insert((profile_id.to_string(), call), error);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, profile_id: &str) -> u32 {
        self.per_profile
            .lock()
            .unwrap()
            .get(profile_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(
        &self,
        session: &SessionRecord,
        label: &str,
    ) -> Result<Artifact, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = {
            let mut counts = self.per_profile.lock().unwrap();
            let n = counts.entry(session.profile_id.clone()).or_default();
            *n += 1;
            *n
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&session.profile_id)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
        if let Some(error) = scripted {
            return Err(error);
        }
        let failing = self
            .failing_calls
            .lock()
            .unwrap()
            .remove(&(session.profile_id.clone(), n));
        if let Some(error) = failing {
            return Err(error);
        }
        Ok(Artifact {
            alias: format!("{}.{}@icloud.com", session.profile_id, n),
            label: label.to_string(),
        })
    }
}
