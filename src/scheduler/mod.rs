//! Scheduler module - Periodic session refresh and alias generation
//!
//! Provides:
//! - A fixed-tick job scheduler with a bounded worker pool
//! - Per-profile sliding-window rate limiting
//! - Cooperative shutdown that waits for in-flight work

mod base;
mod context;
mod job_scheduler;
mod rate_limiter;

pub use base::{ProfileStatus, SchedulerError, SchedulerState, SchedulerStatus, WorkOutcome};
pub use context::{SchedulerContext, ARTIFACTS_DIR};
pub use job_scheduler::{JobScheduler, Tick};
pub use rate_limiter::RateLimiter;
