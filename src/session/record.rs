//! Session record type

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::security::Sanitizer;

/// Decrypted authentication cookies of one profile
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub profile_id: String,
    pub cookies: BTreeMap<String, String>,
    pub extracted_at: DateTime<Utc>,
    pub valid: bool,
    /// Required cookies that could not be extracted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl SessionRecord {
    /// Creates a record holding every required cookie
    pub fn complete(
        profile_id: impl Into<String>,
        cookies: BTreeMap<String, String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            cookies,
            extracted_at,
            valid: true,
            missing: Vec::new(),
        }
    }

    /// Creates a record that lacks some required cookies
    ///
    /// Such a record is never valid.
    pub fn partial(
        profile_id: impl Into<String>,
        cookies: BTreeMap<String, String>,
        missing: Vec<String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            cookies,
            extracted_at,
            valid: false,
            missing,
        }
    }

    /// True when no required cookie is missing
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// True when the record may be handed to the generator
    pub fn is_usable(&self) -> bool {
        self.valid && self.is_complete()
    }

    /// When this record should next be re-extracted
    pub fn refresh_due_at(&self, interval: Duration) -> DateTime<Utc> {
        self.extracted_at + interval
    }

    /// True when the record is unusable or older than `interval`
    pub fn needs_refresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        !self.is_usable() || self.refresh_due_at(interval) <= now
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookies: BTreeMap<&str, String> = self
            .cookies
            .iter()
            .map(|(k, v)| (k.as_str(), Sanitizer::mask_secret(v)))
            .collect();
        f.debug_struct("SessionRecord")
            .field("profile_id", &self.profile_id)
            .field("cookies", &cookies)
            .field("extracted_at", &self.extracted_at)
            .field("valid", &self.valid)
            .field("missing", &self.missing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{minutes, t0};

    fn cookies() -> BTreeMap<String, String> {
        [("dsid", "1234567890"), ("scnt", "abcdefghijkl")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_complete_record_is_usable() {
        let record = SessionRecord::complete("default", cookies(), t0());
        assert!(record.valid);
        assert!(record.is_complete());
        assert!(record.is_usable());
    }

    #[test]
    fn test_partial_record_is_never_valid() {
        let record = SessionRecord::partial("default", cookies(), vec!["dsid".into()], t0());
        assert!(!record.valid);
        assert!(!record.is_complete());
        assert!(!record.is_usable());
    }

    #[test]
    fn test_needs_refresh() {
        let interval = Duration::minutes(60);
        let mut record = SessionRecord::complete("default", cookies(), t0());
        assert!(!record.needs_refresh(minutes(59), interval));
        assert!(record.needs_refresh(minutes(60), interval));

        record.valid = false;
        assert!(record.needs_refresh(minutes(1), interval));
    }

    #[test]
    fn test_missing_is_omitted_when_empty() {
        let record = SessionRecord::complete("default", cookies(), t0());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("missing").is_none());
        assert_eq!(json["cookies"]["dsid"], "1234567890");

        let partial = SessionRecord::partial("default", cookies(), vec!["X-APPLE-ID-TOKEN".into()], t0());
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["missing"][0], "X-APPLE-ID-TOKEN");
        assert_eq!(json["valid"], false);
    }

    #[test]
    fn test_debug_masks_cookie_values() {
        let record = SessionRecord::complete("default", cookies(), t0());
        let printed = format!("{:?}", record);
        assert!(!printed.contains("1234567890"));
        assert!(printed.contains("***7890"));
    }
}
