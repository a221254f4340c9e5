//! Security module - Platform key sources and log redaction
//!
//! This module provides security primitives for:
//! - Sanitizing cookie values and aliases for logs
//! - Reading the browser's Safe Storage secret from the OS keystore
//! - DPAPI-based key unwrapping on Windows

mod dpapi;
mod keychain;
mod sanitizer;

pub use dpapi::{strip_key_prefix, DpapiError, DpapiStore};
pub use keychain::{KeychainEntry, KeychainError, BASIC_STORE_PASSWORD};
pub use sanitizer::{Sanitizer, SanitizerError};
