//! Configuration management for cookie-bot
//!
//! Loads, validates and saves the JSON configuration file, and discovers
//! browser profiles on disk. Supports Windows, macOS, and Linux.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::security::{Sanitizer, SanitizerError};

/// Cookies the generator needs from an authenticated iCloud session
pub const DEFAULT_REQUIRED_COOKIES: [&str; 6] = [
    "X-APPLE-WEBAUTH-HSA-TRUST",
    "X-APPLE-ID-SESSION-ID",
    "X-APPLE-WEBAUTH-USER",
    "dsid",
    "scnt",
    "X-APPLE-ID-TOKEN",
];

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("Configuration file not found: {0} (run `cookie-bot configure` to create one)")]
    NotFound(PathBuf),

    /// IO error
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected schema
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// No profiles configured
    #[error("No profiles configured")]
    NoProfiles,

    /// Two profiles share an id
    #[error("Duplicate profile id: {0}")]
    DuplicateProfile(String),

    /// A profile id cannot be used as a file name
    #[error("Invalid profile id: {0}")]
    InvalidProfileId(#[from] SanitizerError),

    /// A numeric or list setting is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// No platform default location could be determined
    #[error("Could not determine default {0} directory")]
    NoDefaultLocation(&'static str),
}

/// One browser profile with its own encrypted cookie store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Stable identifier, also used as the session file name
    pub id: String,
    /// Display name
    pub name: String,
    /// Profile directory, or the cookie database file itself
    pub path: PathBuf,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
        }
    }

    /// Location of the encrypted cookie database
    ///
    /// Newer Chromium builds keep it under `Network/`, older ones directly in
    /// the profile directory.
    pub fn store_path(&self) -> PathBuf {
        if self.path.is_file() {
            return self.path.clone();
        }
        let network = self.path.join("Network").join("Cookies");
        if network.exists() {
            network
        } else {
            self.path.join("Cookies")
        }
    }

    /// The browser's user data directory (where `Local State` lives)
    pub fn user_data_dir(&self) -> PathBuf {
        let mut profile_dir = if self.path.is_file() {
            self.path.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            self.path.clone()
        };
        if profile_dir.file_name().is_some_and(|n| n == "Network") {
            profile_dir.pop();
        }
        profile_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(profile_dir)
    }
}

/// Browser-side settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserSettings {
    /// Copy the cookie database before reading (the browser may hold a lock)
    pub snapshot_store: bool,
    /// Keystore service holding the Safe Storage password (macOS/Linux)
    pub keychain_service: String,
    /// Keystore account holding the Safe Storage password (macOS/Linux)
    pub keychain_account: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            snapshot_store: true,
            keychain_service: "Chrome Safe Storage".to_string(),
            keychain_account: "Chrome".to_string(),
        }
    }
}

/// How to invoke the external alias generator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorSettings {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the generator process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Upper bound for one generator call
    pub timeout_secs: u64,
    /// Prefix of the label attached to each generated alias
    pub label_prefix: String,
    /// Pause between consecutive generations within one cycle
    pub batch_gap_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["main.py".to_string()],
            working_dir: Some(PathBuf::from("hidemyemail-generator")),
            timeout_secs: 120,
            label_prefix: "Auto_".to_string(),
            batch_gap_secs: 2,
        }
    }
}

impl GeneratorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn batch_gap(&self) -> Duration {
        Duration::from_secs(self.batch_gap_secs)
    }
}

/// Tick cadence and worker pool size
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_seconds: u64,
    pub max_concurrent_profiles: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            max_concurrent_profiles: 4,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Browser profiles to extract from
    pub profiles: Vec<Profile>,
    /// Generations admitted per profile in any trailing hour
    pub email_limit_per_hour: u32,
    /// Minutes between scheduled runs of a profile
    pub refresh_interval_minutes: u32,
    /// Where session records and the artifact ledger live
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// Cookies are read from hosts ending in this domain
    #[serde(default = "default_cookie_domain")]
    pub cookie_domain: String,
    /// Cookie names a session needs to be complete
    #[serde(default = "default_required_cookies")]
    pub required_cookies: Vec<String>,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_cookie_domain() -> String {
    "apple.com".to_string()
}

fn default_required_cookies() -> Vec<String> {
    DEFAULT_REQUIRED_COOKIES.iter().map(|s| s.to_string()).collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            email_limit_per_hour: 5,
            refresh_interval_minutes: 60,
            sessions_dir: default_sessions_dir(),
            cookie_domain: default_cookie_domain(),
            required_cookies: default_required_cookies(),
            browser: BrowserSettings::default(),
            generator: GeneratorSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl AppConfig {
    /// Default config file location (cross-platform)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("cookie-bot").join("config.json"))
            .ok_or(ConfigError::NoDefaultLocation("config"))
    }

    /// Loads and validates configuration from disk
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads an existing config, or starts from defaults if there is none
    ///
    /// Used by `configure`, which must work before any profile exists.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Checks every invariant the rest of the crate relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            Sanitizer::validate_profile_id(&profile.id)?;
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.id.clone()));
            }
        }
        if self.email_limit_per_hour == 0 {
            return Err(invalid("email_limit_per_hour", "must be greater than 0"));
        }
        if self.refresh_interval_minutes == 0 {
            return Err(invalid("refresh_interval_minutes", "must be greater than 0"));
        }
        if self.required_cookies.is_empty() {
            return Err(invalid("required_cookies", "must name at least one cookie"));
        }
        if self.cookie_domain.trim().is_empty() {
            return Err(invalid("cookie_domain", "must not be empty"));
        }
        if self.generator.program.trim().is_empty() {
            return Err(invalid("generator.program", "must not be empty"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(invalid("generator.timeout_secs", "must be greater than 0"));
        }
        if self.scheduler.tick_seconds == 0 {
            return Err(invalid("scheduler.tick_seconds", "must be greater than 0"));
        }
        if self.scheduler.max_concurrent_profiles == 0 {
            return Err(invalid(
                "scheduler.max_concurrent_profiles",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Saves configuration to disk, replacing the previous file atomically
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;

        let content = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&content).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Refresh interval as a chrono duration
    pub fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.refresh_interval_minutes))
    }

    /// Gets a profile by id
    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Adds profiles whose id is not configured yet; returns how many were added
    pub fn merge_profiles(&mut self, discovered: Vec<Profile>) -> usize {
        let mut added = 0;
        for profile in discovered {
            if self.profile(&profile.id).is_none() {
                self.profiles.push(profile);
                added += 1;
            }
        }
        added
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Default Chrome user data directory for this platform
pub fn default_user_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir().map(|p| p.join("Google").join("Chrome").join("User Data"))
    }

    #[cfg(target_os = "macos")]
    {
        dirs::data_dir().map(|p| p.join("Google").join("Chrome"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        dirs::config_dir().map(|p| p.join("google-chrome"))
    }
}

/// Finds `Default` and `Profile N` directories that hold a cookie store
///
/// Ids are derived from the directory name (`Profile 2` → `profile_2`).
pub fn discover_profiles(user_data_dir: &Path) -> std::io::Result<Vec<Profile>> {
    let mut profiles = Vec::new();
    if !user_data_dir.is_dir() {
        return Ok(profiles);
    }

    for entry in fs::read_dir(user_data_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_dir() || !(name == "Default" || name.starts_with("Profile ")) {
            continue;
        }
        let has_store =
            path.join("Cookies").is_file() || path.join("Network").join("Cookies").is_file();
        if has_store {
            let id = name.to_lowercase().replace(' ', "_");
            profiles.push(Profile::new(id, name, path));
        }
    }

    profiles.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            profiles: vec![Profile::new("default", "Default", "/tmp/Default")],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.email_limit_per_hour, 5);
        assert_eq!(config.refresh_interval_minutes, 60);
        assert_eq!(config.required_cookies.len(), 6);
        assert_eq!(config.cookie_domain, "apple.com");
        assert!(config.browser.snapshot_store);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "profiles": [{"id": "default", "name": "Default", "path": "/x/Default"}],
            "email_limit_per_hour": 2,
            "refresh_interval_minutes": 30
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.email_limit_per_hour, 2);
        assert_eq!(config.refresh_interval(), chrono::Duration::minutes(30));
        assert_eq!(config.sessions_dir, PathBuf::from("sessions"));
        assert_eq!(config.generator.timeout(), Duration::from_secs(120));
        assert_eq!(config.generator.batch_gap(), Duration::from_secs(2));
        assert_eq!(config.scheduler.tick_seconds, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid_config();
        config.profiles.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoProfiles)));

        let mut config = valid_config();
        config.email_limit_per_hour = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "email_limit_per_hour", .. })
        ));

        let mut config = valid_config();
        config.refresh_interval_minutes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "refresh_interval_minutes", .. })
        ));

        let mut config = valid_config();
        config
            .profiles
            .push(Profile::new("default", "Again", "/tmp/Other"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateProfile(id)) if id == "default"
        ));

        let mut config = valid_config();
        config.profiles[0].id = "../escape".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProfileId(_))
        ));
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::NotFound(_))
        ));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = valid_config();
        config.email_limit_per_hour = 3;

        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("none.json")).unwrap();
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_merge_profiles_keeps_existing() {
        let mut config = valid_config();
        let added = config.merge_profiles(vec![
            Profile::new("default", "Renamed", "/elsewhere"),
            Profile::new("profile_1", "Profile 1", "/tmp/Profile 1"),
        ]);
        assert_eq!(added, 1);
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profile("default").unwrap().name, "Default");
    }

    #[test]
    fn test_store_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("Default");
        fs::create_dir_all(&legacy).unwrap();
        let profile = Profile::new("default", "Default", &legacy);
        assert_eq!(profile.store_path(), legacy.join("Cookies"));

        fs::create_dir_all(legacy.join("Network")).unwrap();
        fs::write(legacy.join("Network").join("Cookies"), b"").unwrap();
        assert_eq!(profile.store_path(), legacy.join("Network").join("Cookies"));

        let file_profile = Profile::new("f", "F", legacy.join("Network").join("Cookies"));
        assert_eq!(
            file_profile.store_path(),
            legacy.join("Network").join("Cookies")
        );
        assert_eq!(file_profile.user_data_dir(), dir.path());
        assert_eq!(profile.user_data_dir(), dir.path());
    }

    #[test]
    fn test_discover_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Default")).unwrap();
        fs::write(root.join("Default").join("Cookies"), b"").unwrap();
        fs::create_dir_all(root.join("Profile 2").join("Network")).unwrap();
        fs::write(root.join("Profile 2").join("Network").join("Cookies"), b"").unwrap();
        fs::create_dir_all(root.join("Profile 3")).unwrap();
        fs::create_dir_all(root.join("System Profile")).unwrap();
        fs::write(root.join("System Profile").join("Cookies"), b"").unwrap();

        let profiles = discover_profiles(root).unwrap();
        let ids: Vec<_> = profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["default", "profile_2"]);
        assert_eq!(profiles[1].name, "Profile 2");
    }

    #[test]
    fn test_discover_profiles_missing_dir() {
        let profiles = discover_profiles(Path::new("/definitely/not/here")).unwrap();
        assert!(profiles.is_empty());
    }
}
