//! Read-only access to a profile's encrypted cookie database
//!
//! The browser keeps its cookie database open (and on Windows locked) while
//! running, so by default the database is copied into a private snapshot
//! first. The original file is never opened for writing.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{ErrorCode, OpenFlags, OptionalExtension};
use tempfile::TempDir;
use thiserror::Error;

use super::cookie_decryptor::{EncryptionVersion, RawCookieRecord};
use super::key_provider::CipherScheme;

/// Store schema version from which values carry a SHA-256 host prefix
pub const DOMAIN_BOUND_SCHEMA_VERSION: i64 = 24;

/// SQLite sidecar files copied along with the database
const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-journal"];

const COOKIE_QUERY: &str = "SELECT name, host_key, value, encrypted_value
     FROM cookies
     WHERE name = ?1 AND (host_key = ?2 OR host_key LIKE ?3)
     ORDER BY expires_utc DESC
     LIMIT 1";

/// Errors that can occur while opening or reading a cookie store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Cookie database does not exist
    #[error("Cookie database not found: {0}")]
    NotFound(PathBuf),

    /// Another process holds the database or refused the copy
    #[error("Cookie database is locked: {0}")]
    Locked(String),

    /// Not a database, damaged, or not the schema we know
    #[error("Cookie database is corrupt or has an unknown schema: {0}")]
    Corrupt(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Locked(err.to_string())
            }
            Some(ErrorCode::CannotOpen) => StoreError::Io(io::Error::other(err.to_string())),
            _ => StoreError::Corrupt(err.to_string()),
        }
    }
}

/// Opens cookie stores
///
/// Platforms without a locking concern can open in place; everything else
/// reads from a snapshot.
pub trait StoreOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<StoreHandle, StoreError>;
}

/// Opens the database in place, read-only
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectOpener;

impl StoreOpener for DirectOpener {
    fn open(&self, path: &Path) -> Result<StoreHandle, StoreError> {
        ensure_exists(path)?;
        StoreHandle::connect(path, path, None)
    }
}

/// Copies the database into a private temp directory and reads the copy
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotOpener;

impl StoreOpener for SnapshotOpener {
    fn open(&self, path: &Path) -> Result<StoreHandle, StoreError> {
        ensure_exists(path)?;

        let dir = tempfile::Builder::new().prefix("cookie-bot-").tempdir()?;
        let snapshot = dir.path().join("Cookies");
        copy_locked(path, &snapshot)?;

        for suffix in SIDECAR_SUFFIXES {
            let sidecar = sidecar_path(path, suffix);
            if sidecar.exists() {
                copy_locked(&sidecar, &sidecar_path(&snapshot, suffix))?;
            }
        }

        tracing::debug!(source = %path.display(), "Reading cookie store snapshot");
        StoreHandle::connect(&snapshot, path, Some(dir))
    }
}

/// Returns the opener for the configured strategy
pub fn opener_for(snapshot: bool) -> Box<dyn StoreOpener> {
    if snapshot {
        Box::new(SnapshotOpener)
    } else {
        Box::new(DirectOpener)
    }
}

fn ensure_exists(path: &Path) -> Result<(), StoreError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StoreError::NotFound(path.to_path_buf()))
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn copy_locked(from: &Path, to: &Path) -> Result<(), StoreError> {
    fs::copy(from, to).map(|_| ()).map_err(|e| {
        // 32 / 33: ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on Windows
        let sharing_violation = cfg!(windows) && matches!(e.raw_os_error(), Some(32 | 33));
        match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(from.to_path_buf()),
            io::ErrorKind::PermissionDenied => StoreError::Locked(e.to_string()),
            _ if sharing_violation => StoreError::Locked(e.to_string()),
            _ => StoreError::Io(e),
        }
    })
}

/// An open, read-only cookie store
///
/// Dropping the handle closes the connection and then deletes the snapshot,
/// on every exit path.
pub struct StoreHandle {
    // Field order matters: the connection must close before the snapshot goes
    conn: rusqlite::Connection,
    source: PathBuf,
    domain_bound: bool,
    _snapshot: Option<TempDir>,
}

impl StoreHandle {
    fn connect(db: &Path, source: &Path, snapshot: Option<TempDir>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_with_flags(
            db,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // Fails on non-databases and on schema changes (renamed columns)
        conn.prepare("SELECT name, host_key, value, encrypted_value, expires_utc FROM cookies LIMIT 0")?;

        let schema_version: i64 = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .unwrap_or(None)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            conn,
            source: source.to_path_buf(),
            domain_bound: schema_version >= DOMAIN_BOUND_SCHEMA_VERSION,
            _snapshot: snapshot,
        })
    }

    /// Path of the original database this handle reads
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Whether values in this store are prefixed with a host hash
    pub fn is_domain_bound(&self) -> bool {
        self.domain_bound
    }

    /// Lazily yields the records for `names` on hosts under `domain`
    ///
    /// Names that are not present are simply absent from the output.
    pub fn read_cookies<'a>(
        &'a self,
        names: &'a BTreeSet<String>,
        domain: &'a str,
        scheme: CipherScheme,
    ) -> impl Iterator<Item = Result<RawCookieRecord, StoreError>> + 'a {
        let bare = domain.trim_start_matches('.');
        let suffix = format!("%.{}", bare);
        names
            .iter()
            .filter_map(move |name| self.read_one(name, bare, &suffix, scheme).transpose())
    }

    fn read_one(
        &self,
        name: &str,
        domain: &str,
        suffix: &str,
        scheme: CipherScheme,
    ) -> Result<Option<RawCookieRecord>, StoreError> {
        let mut stmt = self.conn.prepare_cached(COOKIE_QUERY)?;
        let row = stmt
            .query_row([name, domain, suffix], |row| {
                Ok((
                    row.get::<_, String>(0)?,          // name
                    row.get::<_, String>(1)?,          // host_key
                    row.get::<_, Option<String>>(2)?,  // value
                    row.get::<_, Option<Vec<u8>>>(3)?, // encrypted_value
                ))
            })
            .optional()?;

        Ok(row.map(|(name, host_key, value, encrypted)| {
            let value = value.unwrap_or_default();
            let encrypted = encrypted.unwrap_or_default();
            let (version, payload) =
                EncryptionVersion::classify(value.as_bytes(), &encrypted, scheme);
            RawCookieRecord {
                name,
                host_key,
                payload: payload.to_vec(),
                domain_bound: self.domain_bound && version != EncryptionVersion::Plaintext,
                version,
            }
        }))
    }

    /// Closes the store and removes its snapshot
    pub fn close(self) {
        drop(self);
    }
}
