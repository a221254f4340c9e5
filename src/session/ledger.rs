//! Append-only record of generated aliases
//!
//! One JSON line per artifact in `<dir>/<profile_id>.jsonl`. The ledger is
//! what survives a restart: it seeds the rate windows and lets an operator
//! see what was produced.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::repository::{ProfileLocks, RepositoryError};
use crate::security::Sanitizer;

/// One generated alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub profile_id: String,
    pub artifact: String,
    pub label: String,
    pub generated_at: DateTime<Utc>,
}

/// Per-profile JSONL files of generated artifacts
#[derive(Debug)]
pub struct ArtifactLedger {
    dir: PathBuf,
    locks: ProfileLocks,
}

impl ArtifactLedger {
    /// Opens the ledger directory, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RepositoryError::NotWritable {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            locks: ProfileLocks::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, profile_id: &str) -> Result<PathBuf, RepositoryError> {
        Sanitizer::validate_profile_id(profile_id)?;
        Ok(self.dir.join(format!("{}.jsonl", profile_id)))
    }

    /// Appends an entry and syncs it to disk
    pub fn append(&self, entry: &ArtifactEntry) -> Result<(), RepositoryError> {
        let path = self.path_for(&entry.profile_id)?;
        let lock = self.locks.for_profile(&entry.profile_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut line = serde_json::to_vec(entry).map_err(io::Error::from)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        // Terminate a line torn by an earlier crash so it stays isolated
        if ends_without_newline(&mut file)? {
            line.insert(0, b'\n');
        }
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// All readable entries of a profile, oldest first
    ///
    /// Lines that do not parse (a torn write) are skipped.
    pub fn list(&self, profile_id: &str) -> Result<Vec<ArtifactEntry>, RepositoryError> {
        let path = self.path_for(profile_id)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArtifactEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(profile = %profile_id, line = index + 1, "Skipping unreadable ledger line: {}", e);
                }
            }
        }
        Ok(entries)
    }

    /// Generation times strictly after `since`
    pub fn generated_since(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, RepositoryError> {
        let mut times: Vec<_> = self
            .list(profile_id)?
            .into_iter()
            .map(|e| e.generated_at)
            .filter(|t| *t > since)
            .collect();
        times.sort();
        Ok(times)
    }
}

fn ends_without_newline(file: &mut fs::File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
