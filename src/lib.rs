//! cookie-bot - Browser session extraction and rate-limited alias generation
//!
//! Reads the authentication cookies of several Chromium profiles from their
//! encrypted cookie stores, keeps them as per-profile session records, and
//! periodically hands valid sessions to an external alias generator.
//!
//! ## Architecture
//!
//! - **Auth**: master key resolution, read-only store snapshots, cookie decryption
//! - **Session**: atomically written session records and the artifact ledger
//! - **Pipeline**: store → decrypt → session record, per profile
//! - **Generator**: the external generation step behind a trait
//! - **Scheduler**: tick loop, bounded worker pool, sliding-window rate limits
//! - **Control**: loopback channel through which one-off commands reach the daemon
//! - **Security**: platform key stores (Keychain, Secret Service, DPAPI) and log redaction

pub mod auth;
pub mod config;
pub mod control;
pub mod generator;
pub mod pipeline;
pub mod scheduler;
pub mod security;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::EnvFilter;

use crate::auth::KeyError;
use crate::config::ConfigError;
use crate::session::RepositoryError;

/// Process exit codes of the binary
pub mod exit_code {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const CONFIG: u8 = 2;
    pub const KEY_PREFLIGHT: u8 = 3;
    pub const SESSIONS_DIR: u8 = 4;
}

/// Initializes logging once for the process
///
/// `RUST_LOG` overrides the default of `info,cookie_bot=debug`.
pub fn init_tracing(ansi: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cookie_bot=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .try_init();
}

/// Maps a top-level error onto the exit code it should produce
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        exit_code::CONFIG
    } else if err.downcast_ref::<KeyError>().is_some() {
        exit_code::KEY_PREFLIGHT
    } else if matches!(
        err.downcast_ref::<RepositoryError>(),
        Some(RepositoryError::NotWritable { .. })
    ) {
        exit_code::SESSIONS_DIR
    } else {
        exit_code::FAILURE
    }
}
