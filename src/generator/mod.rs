//! Generator module - Turning a session into an e-mail alias
//!
//! The generation step itself is an external tool. The scheduler only sees
//! the [`Generator`] trait, so tests and alternative backends plug in here.

mod command;

pub use command::{classify_failure, parse_alias, CommandGenerator};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::SessionRecord;

/// Errors reported by a generator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The remote side rejected the session cookies
    #[error("Session rejected by the remote service")]
    AuthRejected,

    /// The remote side is throttling this account
    #[error("Rate limited by the remote service")]
    RateLimited,

    /// The generator did not finish in time
    #[error("Generator timed out after {0}s")]
    Timeout(u64),

    /// Anything else
    #[error("Generator failed: {0}")]
    Unknown(String),
}

/// A generated alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub alias: String,
    pub label: String,
}

/// Produces one alias from a valid session
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        session: &SessionRecord,
        label: &str,
    ) -> Result<Artifact, GenerationError>;
}

/// Label of the `index`-th alias of a cycle, e.g. `Auto_20240501120000_default_0`
pub fn label_for(prefix: &str, profile_id: &str, now: DateTime<Utc>, index: usize) -> String {
    format!(
        "{}{}_{}_{}",
        prefix,
        now.format("%Y%m%d%H%M%S"),
        profile_id,
        index
    )
}
