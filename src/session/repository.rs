//! Per-profile session files
//!
//! Each profile's record lives in `<dir>/<profile_id>.json`. Writes go to a
//! temp file in the same directory which is fsynced and renamed over the
//! target, so a reader sees either the old record or the new one.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use super::lock::{FileLock, LOCKS_DIR};
use super::record::SessionRecord;
use crate::security::{Sanitizer, SanitizerError};

pub(crate) const TEMP_PREFIX: &str = ".session-";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Temp files younger than this may belong to a writer in another process
pub(crate) const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Errors that can occur while reading or writing session records
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No record for this profile yet
    #[error("No session stored for profile {0}")]
    NotFound(String),

    /// The record on disk cannot be parsed
    #[error("Session file for profile {profile_id} is corrupt: {reason}")]
    Corrupt { profile_id: String, reason: String },

    /// Sessions directory cannot be created or written
    #[error("Sessions directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Profile id cannot be used as a file name
    #[error("Invalid profile id: {0}")]
    InvalidProfileId(#[from] SanitizerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One mutex per key, created on first use
#[derive(Debug, Default)]
pub(crate) struct ProfileLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProfileLocks {
    pub(crate) fn for_profile(&self, profile_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(profile_id.to_string()).or_default())
    }
}

/// Stores session records as JSON files
#[derive(Debug)]
pub struct SessionRepository {
    dir: PathBuf,
    write_locks: ProfileLocks,
}

impl SessionRepository {
    /// Opens the repository, creating the directory if needed
    ///
    /// Temp files left by an interrupted write are removed once they are
    /// older than [`STALE_TEMP_AGE`], and the directory is checked for
    /// writability.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        let not_writable = |source| RepositoryError::NotWritable {
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(not_writable)?;

        let removed =
            remove_stale_temp_files(&dir, SystemTime::now()).map_err(not_writable)?;
        if removed > 0 {
            tracing::info!(count = removed, "Removed stale session temp files");
        }

        let mut check = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&dir)
            .map_err(not_writable)?;
        check.write_all(b"check").map_err(not_writable)?;
        drop(check);

        Ok(Self {
            dir,
            write_locks: ProfileLocks::default(),
        })
    }

    /// Directory holding the session files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, profile_id: &str) -> Result<PathBuf, RepositoryError> {
        Sanitizer::validate_profile_id(profile_id)?;
        Ok(self.dir.join(format!("{}.json", profile_id)))
    }

    /// Loads the record of a profile
    pub fn load(&self, profile_id: &str) -> Result<SessionRecord, RepositoryError> {
        let path = self.path_for(profile_id)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(profile_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let record: SessionRecord =
            serde_json::from_slice(&content).map_err(|e| RepositoryError::Corrupt {
                profile_id: profile_id.to_string(),
                reason: e.to_string(),
            })?;
        if record.profile_id != profile_id {
            return Err(RepositoryError::Corrupt {
                profile_id: profile_id.to_string(),
                reason: format!("file belongs to profile {}", record.profile_id),
            });
        }
        Ok(record)
    }

    /// Loads a record, treating a missing one as `None`
    pub fn try_load(&self, profile_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        match self.load(profile_id) {
            Ok(record) => Ok(Some(record)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically replaces the record of `record.profile_id`
    pub fn save(&self, record: &SessionRecord) -> Result<(), RepositoryError> {
        let path = self.path_for(&record.profile_id)?;
        let lock = self.write_locks.for_profile(&record.profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_atomic(&path, record)
    }

    /// Takes the cross-process lock of one profile's work, if it is free
    pub fn try_lock_profile(&self, profile_id: &str) -> Result<Option<FileLock>, RepositoryError> {
        Sanitizer::validate_profile_id(profile_id)?;
        let path = self.dir.join(LOCKS_DIR).join(format!("profile-{}.lock", profile_id));
        Ok(FileLock::try_acquire(&path)?)
    }

    /// Takes the lock that marks this sessions dir as served by a daemon
    pub fn try_lock_daemon(&self) -> Result<Option<FileLock>, RepositoryError> {
        Ok(FileLock::try_acquire(&self.dir.join(LOCKS_DIR).join("daemon.lock"))?)
    }

    /// Marks a profile's session invalid, keeping its cookie values
    ///
    /// Returns `false` when there was no record to invalidate.
    pub fn invalidate(&self, profile_id: &str) -> Result<bool, RepositoryError> {
        let path = self.path_for(profile_id)?;
        let lock = self.write_locks.for_profile(profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some(mut record) = self.try_load(profile_id)? else {
            return Ok(false);
        };
        if record.valid {
            record.valid = false;
            self.write_atomic(&path, &record)?;
        }
        Ok(true)
    }

    fn write_atomic(&self, path: &Path, record: &SessionRecord) -> Result<(), RepositoryError> {
        let content = serde_json::to_vec_pretty(record).map_err(io::Error::from)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        tracing::debug!(
            profile = %record.profile_id,
            cookies = record.cookies.len(),
            valid = record.valid,
            "Session record saved"
        );
        Ok(())
    }
}

fn remove_stale_temp_files(dir: &Path, now: SystemTime) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if !metadata.is_file() || age < STALE_TEMP_AGE {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            // Renamed or cleaned up by its writer in the meantime
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::t0;
    use std::collections::BTreeMap;

    fn backdate(path: &Path, age: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    fn record(profile_id: &str, value: &str) -> SessionRecord {
        let mut cookies = BTreeMap::new();
        cookies.insert("dsid".to_string(), value.to_string());
        SessionRecord::complete(profile_id, cookies, t0())
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("nested").join("sessions");
        let repo = SessionRepository::open(&sessions).unwrap();
        assert!(sessions.is_dir());
        assert_eq!(repo.dir(), sessions.as_path());
        // Probe leaves nothing behind
        assert_eq!(fs::read_dir(&sessions).unwrap().count(), 0);
    }

    #[test]
    fn test_open_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sessions");
        fs::write(&file, b"not a dir").unwrap();
        assert!(matches!(
            SessionRepository::open(&file),
            Err(RepositoryError::NotWritable { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SessionRepository::open(dir.path()).unwrap();

        assert!(matches!(
            repo.load("default"),
            Err(RepositoryError::NotFound(_))
        ));
        assert!(repo.try_load("default").unwrap().is_none());

        let saved = record("default", "first");
        repo.save(&saved).unwrap();
        assert_eq!(repo.load("default").unwrap(), saved);

        let replaced = record("default", "second");
        repo.save(&replaced).unwrap();
        assert_eq!(repo.load("default").unwrap().cookies["dsid"], "second");
    }

    #[test]
    fn test_invalidate_keeps_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SessionRepository::open(dir.path()).unwrap();
        assert!(!repo.invalidate("default").unwrap());

        repo.save(&record("default", "value")).unwrap();
        assert!(repo.invalidate("default").unwrap());

        let loaded = repo.load("default").unwrap();
        assert!(!loaded.valid);
        assert_eq!(loaded.cookies["dsid"], "value");
    }

    #[test]
    fn test_rejects_path_like_profile_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SessionRepository::open(dir.path()).unwrap();
        assert!(matches!(
            repo.load("../escape"),
            Err(RepositoryError::InvalidProfileId(_))
        ));
        assert!(matches!(
            repo.save(&record("a/b", "x")),
            Err(RepositoryError::InvalidProfileId(_))
        ));
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SessionRepository::open(dir.path()).unwrap();
        fs::write(dir.path().join("default.json"), b"{\"profile_id\": \"def").unwrap();
        assert!(matches!(
            repo.load("default"),
            Err(RepositoryError::Corrupt { .. })
        ));

        let other = serde_json::to_vec(&record("other", "x")).unwrap();
        fs::write(dir.path().join("default.json"), other).unwrap();
        assert!(matches!(
            repo.load("default"),
            Err(RepositoryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_interrupted_write_never_exposes_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SessionRepository::open(dir.path()).unwrap();
        let original = record("default", "committed");
        repo.save(&original).unwrap();

        // A crash after the temp file was written but before the rename
        let torn = dir.path().join(format!("{}crash{}", TEMP_PREFIX, TEMP_SUFFIX));
        let full = serde_json::to_vec(&record("default", "uncommitted")).unwrap();
        fs::write(&torn, &full[..full.len() / 2]).unwrap();
        backdate(&torn, STALE_TEMP_AGE + Duration::from_secs(60));

        assert_eq!(repo.load("default").unwrap(), original);

        // Restart cleans the leftover up and still sees the committed record
        let reopened = SessionRepository::open(dir.path()).unwrap();
        assert!(!torn.exists());
        assert_eq!(reopened.load("default").unwrap(), original);
    }

    #[test]
    fn test_open_keeps_temp_files_of_a_live_writer() {
        let dir = tempfile::tempdir().unwrap();
        let _daemon = SessionRepository::open(dir.path()).unwrap();

        // Another process is between writing its temp file and the rename
        let pending = dir.path().join(format!("{}inflight{}", TEMP_PREFIX, TEMP_SUFFIX));
        fs::write(&pending, b"{}").unwrap();
        backdate(&pending, Duration::from_secs(30));

        SessionRepository::open(dir.path()).unwrap();
        assert!(pending.exists());
    }

    #[test]
    fn test_profile_locks_span_repository_instances() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = SessionRepository::open(dir.path()).unwrap();
        let cli = SessionRepository::open(dir.path()).unwrap();

        let held = daemon.try_lock_profile("default").unwrap().unwrap();
        assert!(cli.try_lock_profile("default").unwrap().is_none());
        assert!(cli.try_lock_profile("work").unwrap().is_some());
        drop(held);
        assert!(cli.try_lock_profile("default").unwrap().is_some());

        assert!(matches!(
            cli.try_lock_profile("../daemon"),
            Err(RepositoryError::InvalidProfileId(_))
        ));
        let _daemon_lock = daemon.try_lock_daemon().unwrap().unwrap();
        assert!(cli.try_lock_daemon().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_saves_leave_a_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(SessionRepository::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || repo.save(&record("default", &format!("v{}", i))))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let loaded = repo.load("default").unwrap();
        assert!(loaded.cookies["dsid"].starts_with('v'));
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(TEMP_SUFFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
