//! Extraction pipeline - store → decrypt → session record
//!
//! Refreshes one profile's session from its cookie store. Everything here
//! is blocking (SQLite, file IO, PBKDF2) and is run by the scheduler under
//! `spawn_blocking`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::auth::{
    decode_plaintext, decrypt, opener_for, CipherScheme, EncryptionVersion, KeyError,
    KeyProvider, MasterKey, StoreError, StoreOpener,
};
use crate::config::{AppConfig, Profile};
use crate::security::Sanitizer;
use crate::session::{RepositoryError, SessionRecord, SessionRepository};

/// Errors that can occur while refreshing a session
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Some required cookies could not be extracted; the partial record was persisted
    #[error("Partial extraction, missing: {}", .missing.join(", "))]
    PartialExtraction {
        record: SessionRecord,
        missing: Vec<String>,
    },

    /// Cookie store could not be opened or read
    #[error("Cookie store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Master key could not be resolved
    #[error("Master key unavailable: {0}")]
    KeyUnavailable(#[from] KeyError),

    /// The store holds none of the required cookies
    #[error("No required cookies found in the store")]
    NoCookies,

    /// Session record could not be written
    #[error("Failed to persist session: {0}")]
    Persist(#[from] RepositoryError),
}

/// Turns a profile's encrypted cookie store into a persisted session record
pub struct ExtractionPipeline {
    repository: Arc<SessionRepository>,
    keys: Arc<dyn KeyProvider>,
    opener: Box<dyn StoreOpener>,
    domain: String,
    required: BTreeSet<String>,
    scheme: CipherScheme,
}

impl ExtractionPipeline {
    pub fn new(
        repository: Arc<SessionRepository>,
        keys: Arc<dyn KeyProvider>,
        opener: Box<dyn StoreOpener>,
        domain: impl Into<String>,
        required: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            repository,
            keys,
            opener,
            domain: domain.into(),
            required: required.into_iter().collect(),
            scheme: CipherScheme::native(),
        }
    }

    /// Builds a pipeline from configuration
    pub fn from_config(
        config: &AppConfig,
        repository: Arc<SessionRepository>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self::new(
            repository,
            keys,
            opener_for(config.browser.snapshot_store),
            config.cookie_domain.clone(),
            config.required_cookies.clone(),
        )
    }

    /// Overrides how `v10`/`v11` records are interpreted
    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repository
    }

    /// Extracts, decrypts and persists the session of one profile
    ///
    /// A complete record is saved as valid. A partial one, including one
    /// where every stored cookie failed to decrypt, is saved as invalid with
    /// its `missing` names and returned inside
    /// [`ExtractionError::PartialExtraction`]. Only a store without any
    /// required cookie leaves the stored record untouched.
    pub fn refresh(
        &self,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, ExtractionError> {
        let Extracted { cookies, found } = self.extract(profile)?;
        if found == 0 {
            tracing::warn!(profile = %profile.id, "No required cookies in store");
            return Err(ExtractionError::NoCookies);
        }

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| !cookies.contains_key(*name))
            .cloned()
            .collect();

        if missing.is_empty() {
            let record = SessionRecord::complete(&profile.id, cookies, now);
            self.repository.save(&record)?;
            tracing::info!(
                profile = %profile.id,
                cookies = record.cookies.len(),
                "Session extracted"
            );
            Ok(record)
        } else {
            let record = SessionRecord::partial(&profile.id, cookies, missing.clone(), now);
            self.repository.save(&record)?;
            tracing::warn!(
                profile = %profile.id,
                extracted = record.cookies.len(),
                missing = ?missing,
                "Partial session extracted"
            );
            Err(ExtractionError::PartialExtraction { record, missing })
        }
    }

    /// Refreshes every profile; one failure never affects the others
    pub fn refresh_all(
        &self,
        profiles: &[Profile],
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<SessionRecord, ExtractionError>)> {
        profiles
            .iter()
            .map(|profile| (profile.id.clone(), self.refresh(profile, now)))
            .collect()
    }

    fn extract(&self, profile: &Profile) -> Result<Extracted, ExtractionError> {
        let store_path = profile.store_path();
        let handle = self.opener.open(&store_path).map_err(|e| {
            tracing::warn!(profile = %profile.id, path = %store_path.display(), "Cannot open cookie store: {}", e);
            e
        })?;

        let mut key: Option<Arc<MasterKey>> = None;
        let mut cookies = BTreeMap::new();
        let mut found = 0;

        for record in handle.read_cookies(&self.required, &self.domain, self.scheme) {
            let record = record?;
            found += 1;
            let result = if record.version == EncryptionVersion::Plaintext {
                decode_plaintext(&record)
            } else {
                let resolved = match key.clone() {
                    Some(resolved) => resolved,
                    None => {
                        let resolved = self.keys.resolve_key(profile).map_err(|e| {
                            tracing::error!(profile = %profile.id, "Key resolution failed: {}", e);
                            e
                        })?;
                        key = Some(Arc::clone(&resolved));
                        resolved
                    }
                };
                decrypt(&record, &resolved)
            };

            match result {
                Ok(cookie) => {
                    tracing::debug!(
                        profile = %profile.id,
                        cookie = %cookie.name,
                        value = %Sanitizer::mask_secret(&cookie.value),
                        "Cookie decrypted"
                    );
                    cookies.insert(cookie.name, cookie.value);
                }
                Err(e) => {
                    tracing::warn!(
                        profile = %profile.id,
                        cookie = %record.name,
                        host = %record.host_key,
                        "Cookie skipped: {}",
                        e
                    );
                }
            }
        }

        handle.close();
        Ok(Extracted { cookies, found })
    }
}

/// Decrypted cookies plus how many required records the store held
struct Extracted {
    cookies: BTreeMap<String, String>,
    found: usize,
}
