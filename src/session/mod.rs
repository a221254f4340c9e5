//! Session module - Persisted session records and generated artifacts

mod ledger;
mod lock;
mod record;
mod repository;

pub use ledger::{ArtifactEntry, ArtifactLedger};
pub use lock::{FileLock, LOCKS_DIR};
pub use record::SessionRecord;
pub use repository::{RepositoryError, SessionRepository};
