//! Scheduler types
//!
//! Errors, per-profile work outcomes and the status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the scheduler
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// No configured profile has this id
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

/// Lifecycle state of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

impl SchedulerState {
    /// Returns true if the tick loop is active
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerState::Running)
    }
}

/// Result of one work unit for one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkOutcome {
    /// At least one alias was generated and recorded before the batch ended
    Generated { artifacts: Vec<String> },
    /// The profile's rolling window was full before the first generation
    RateLimited,
    /// The session lacks required cookies
    IncompleteSession { missing: Vec<String> },
    /// The session could not be extracted
    ExtractionFailed { error: String },
    /// The generator rejected the session; it was invalidated
    AuthRejected,
    /// The generator failed (timeout, remote throttling, anything else)
    GenerationFailed { error: String },
    /// A previous unit for this profile was still running, here or in another process
    SkippedInFlight,
    /// The scheduler stopped before the unit could start
    Cancelled,
}

impl WorkOutcome {
    /// True for outcomes that deserve operator attention
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            WorkOutcome::IncompleteSession { .. }
                | WorkOutcome::ExtractionFailed { .. }
                | WorkOutcome::AuthRejected
                | WorkOutcome::GenerationFailed { .. }
        )
    }
}

/// Snapshot of one profile's schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStatus {
    pub profile_id: String,
    pub name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub in_flight: bool,
    pub last_outcome: Option<WorkOutcome>,
    /// `None` when no session has been stored yet
    pub session_valid: Option<bool>,
    pub session_extracted_at: Option<DateTime<Utc>>,
    pub extractions: u64,
    pub generations: u64,
    /// Admissions within the trailing hour
    pub window_usage: u32,
}

/// Snapshot of the whole scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub email_limit_per_hour: u32,
    pub refresh_interval_minutes: i64,
    pub profiles: Vec<ProfileStatus>,
}

impl SchedulerStatus {
    /// Gets the status of one profile
    pub fn profile(&self, profile_id: &str) -> Option<&ProfileStatus> {
        self.profiles.iter().find(|p| p.profile_id == profile_id)
    }
}
