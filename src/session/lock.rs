//! Advisory file locks shared between cookie-bot processes
//!
//! A work unit holds `<dir>/locks/profile-<id>.lock` for as long as it
//! runs, and the daemon holds `<dir>/locks/daemon.lock` for its lifetime.
//! The OS drops the lock when the file is closed, including on a crash.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Subdirectory of the sessions dir holding lock files
pub const LOCKS_DIR: &str = "locks";

/// An exclusive lock, released on drop
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock at `path` without blocking
    ///
    /// Returns `Ok(None)` when another handle holds it, in this process or
    /// any other.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                tracing::warn!(path = %path.display(), "Failed to restrict lock file permissions: {}", e);
            }
        }

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
