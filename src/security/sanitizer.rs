//! Redaction and identifier validation
//!
//! Cookie values and generated aliases must never reach the logs in full,
//! and profile ids end up as file names, so both pass through here.

use thiserror::Error;

/// Longest profile id accepted
pub const MAX_PROFILE_ID_LEN: usize = 64;

/// Errors that can occur during identifier validation
#[derive(Debug, Error, PartialEq)]
pub enum SanitizerError {
    /// Identifier is empty
    #[error("Identifier cannot be empty")]
    EmptyInput,

    /// Identifier contains something other than `[A-Za-z0-9_.-]`
    #[error("Identifier '{0}' may only contain letters, digits, '_', '-' and '.'")]
    InvalidInput(String),

    /// Identifier exceeds maximum allowed length
    #[error("Identifier exceeds maximum length of {0}")]
    TooLong(usize),
}

/// Sanitizer for sensitive data
pub struct Sanitizer;

impl Sanitizer {
    /// Masks an e-mail alias for logging
    ///
    /// Keeps the first two characters of the local part and the full domain.
    ///
    /// # Examples
    ///
    /// ```
    /// use cookie_bot::security::Sanitizer;
    ///
    /// assert_eq!(Sanitizer::mask_alias("quiet.fox.42@icloud.com"), "qu***@icloud.com");
    /// assert_eq!(Sanitizer::mask_alias("ab@icloud.com"), "***@icloud.com");
    /// assert_eq!(Sanitizer::mask_alias("not-an-address"), "***");
    /// ```
    pub fn mask_alias(alias: &str) -> String {
        match alias.split_once('@') {
            Some((local, domain)) if local.chars().count() > 2 => {
                let head: String = local.chars().take(2).collect();
                format!("{head}***@{domain}")
            }
            Some((_, domain)) => format!("***@{domain}"),
            None => "***".to_string(),
        }
    }

    /// Masks a cookie value, keeping only its length and last 4 characters
    ///
    /// # Examples
    ///
    /// ```
    /// use cookie_bot::security::Sanitizer;
    ///
    /// assert_eq!(Sanitizer::mask_secret("AQEAAAabcdefgh1234"), "***1234 (18 chars)");
    /// assert_eq!(Sanitizer::mask_secret("abc"), "**** (3 chars)");
    /// ```
    pub fn mask_secret(value: &str) -> String {
        let len = value.chars().count();
        if len > 8 {
            let tail: String = value.chars().skip(len - 4).collect();
            format!("***{tail} ({len} chars)")
        } else {
            format!("**** ({len} chars)")
        }
    }

    /// Validates a profile id before it is used as a file name
    ///
    /// # Examples
    ///
    /// ```
    /// use cookie_bot::security::Sanitizer;
    ///
    /// assert!(Sanitizer::validate_profile_id("profile_1").is_ok());
    /// assert!(Sanitizer::validate_profile_id("../etc").is_err());
    /// ```
    pub fn validate_profile_id(id: &str) -> Result<(), SanitizerError> {
        if id.is_empty() {
            return Err(SanitizerError::EmptyInput);
        }
        if id.len() > MAX_PROFILE_ID_LEN {
            return Err(SanitizerError::TooLong(MAX_PROFILE_ID_LEN));
        }
        // "." and ".." are valid characters but not valid file names
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
        if !id.chars().all(allowed) || id.chars().all(|c| c == '.') {
            return Err(SanitizerError::InvalidInput(id.to_string()));
        }
        Ok(())
    }
}
