//! Per-profile sliding-window rate limiter
//!
//! A profile may be admitted at most `limit` times in any trailing window.
//! Entries are pruned lazily on each check; there are no wall-clock buckets.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

type Window = Arc<Mutex<VecDeque<DateTime<Utc>>>>;

/// Sliding-window admission control, one window per profile
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    span: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Limiter admitting `limit` per trailing hour
    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::minutes(60))
    }

    pub fn new(limit: u32, span: Duration) -> Self {
        Self {
            limit,
            span,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Length of the trailing window
    pub fn span(&self) -> Duration {
        self.span
    }

    fn window(&self, profile_id: &str) -> Window {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(windows.entry(profile_id.to_string()).or_default())
    }

    /// Admits `profile_id` at `now` if its window has room, recording the admission
    ///
    /// A rejection leaves the window unchanged apart from expired entries.
    pub fn try_admit(&self, profile_id: &str, now: DateTime<Utc>) -> bool {
        let window = self.window(profile_id);
        let mut entries = window.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|t| now - *t < self.span);

        if entries.len() < self.limit as usize {
            let at = entries.partition_point(|t| *t <= now);
            entries.insert(at, now);
            true
        } else {
            false
        }
    }

    /// Merges recorded admissions (e.g. from the artifact ledger) into a window
    ///
    /// A timestamp already in the window is only added again as often as it
    /// is recorded more times than it is held, so re-reading the same record
    /// is a no-op. Only the newest `limit` entries are kept.
    pub fn seed(&self, profile_id: &str, timestamps: Vec<DateTime<Utc>>) {
        let mut recorded: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
        for t in timestamps {
            *recorded.entry(t).or_default() += 1;
        }

        let window = self.window(profile_id);
        let mut entries = window.lock().unwrap_or_else(|e| e.into_inner());
        for (t, count) in recorded {
            let held = entries.iter().filter(|e| **e == t).count();
            for _ in held..count {
                let at = entries.partition_point(|e| *e <= t);
                entries.insert(at, t);
            }
        }
        while entries.len() > self.limit as usize {
            entries.pop_front();
        }
    }

    /// Admissions within the window ending at `now`
    pub fn usage(&self, profile_id: &str, now: DateTime<Utc>) -> u32 {
        let window = self.window(profile_id);
        let entries = window.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|t| now - **t < self.span).count() as u32
    }

    /// Earliest time the profile can be admitted again, if it is full now
    pub fn next_slot_at(&self, profile_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = self.window(profile_id);
        let entries = window.lock().unwrap_or_else(|e| e.into_inner());
        let live: Vec<_> = entries.iter().filter(|t| now - **t < self.span).collect();
        if live.len() < self.limit as usize {
            return None;
        }
        live.first().map(|oldest| **oldest + self.span)
    }
}
