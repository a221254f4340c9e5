//! Job scheduler - Fixed-tick loop over due profiles
//!
//! Each tick dispatches a work unit for every profile whose `next_run_at`
//! has passed. Units run concurrently on a bounded pool, but never more
//! than one per profile: a profile still in flight is skipped, not queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::base::{ProfileStatus, SchedulerError, SchedulerState, SchedulerStatus, WorkOutcome};
use super::context::{SchedulerContext, UnitReport};
use crate::config::Profile;

#[derive(Debug, Clone)]
struct Schedule {
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    last_outcome: Option<WorkOutcome>,
    extractions: u64,
    generations: u64,
}

struct ProfileSlot {
    profile: Profile,
    in_flight: AtomicBool,
    schedule: Mutex<Schedule>,
}

impl ProfileSlot {
    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, report: &UnitReport) {
        let mut schedule = self.schedule();
        if report.extracted {
            schedule.extractions += 1;
        }
        schedule.generations += report.generated;
        schedule.last_outcome = Some(report.outcome.clone());
    }
}

/// Clears the in-flight flag when the work unit ends, however it ends
struct InFlightGuard(Arc<ProfileSlot>);

impl InFlightGuard {
    fn acquire(slot: &Arc<ProfileSlot>) -> Option<Self> {
        slot.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(slot)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Work units dispatched by one tick or run-now call
pub struct Tick {
    units: Vec<(String, JoinHandle<WorkOutcome>)>,
    skipped: Vec<String>,
}

impl Tick {
    /// Profiles that got a work unit
    pub fn dispatched(&self) -> Vec<&str> {
        self.units.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Profiles skipped because a unit was still in flight
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Waits for every dispatched unit and returns all outcomes
    pub async fn join(self) -> Vec<(String, WorkOutcome)> {
        let mut outcomes: Vec<(String, WorkOutcome)> = self
            .skipped
            .into_iter()
            .map(|id| (id, WorkOutcome::SkippedInFlight))
            .collect();
        for (id, handle) in self.units {
            let outcome = handle.await.unwrap_or_else(|e| WorkOutcome::GenerationFailed {
                error: format!("work unit failed: {}", e),
            });
            outcomes.push((id, outcome));
        }
        outcomes
    }
}

struct Inner {
    ctx: Arc<SchedulerContext>,
    slots: Vec<Arc<ProfileSlot>>,
    index: HashMap<String, usize>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    tick_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Periodic scheduler of per-profile refresh and generation
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Creates a stopped scheduler, restoring schedules and rate windows from disk
    pub fn new(ctx: Arc<SchedulerContext>, now: DateTime<Utc>) -> Self {
        let slots: Vec<Arc<ProfileSlot>> = ctx
            .profiles
            .iter()
            .map(|profile| {
                Arc::new(ProfileSlot {
                    profile: profile.clone(),
                    in_flight: AtomicBool::new(false),
                    schedule: Mutex::new(Schedule {
                        last_run_at: None,
                        next_run_at: now,
                        last_outcome: None,
                        extractions: 0,
                        generations: 0,
                    }),
                })
            })
            .collect();
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.profile.id.clone(), i))
            .collect();

        let scheduler = Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(ctx.max_concurrent.max(1))),
                ctx,
                slots,
                index,
                tracker: TaskTracker::new(),
                cancel: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
                tick_loop: tokio::sync::Mutex::new(None),
            }),
        };
        scheduler.restore(now);
        scheduler
    }

    /// Recomputes `next_run_at` from stored sessions and seeds rate windows from the ledger
    fn restore(&self, now: DateTime<Utc>) {
        let ctx = &self.inner.ctx;
        let window_start = now - ctx.limiter.span();

        for slot in &self.inner.slots {
            let id = &slot.profile.id;
            let next_run_at = match ctx.repository.try_load(id) {
                Ok(Some(record)) if record.is_usable() => {
                    record.refresh_due_at(ctx.refresh_interval)
                }
                Ok(_) => now,
                Err(e) => {
                    tracing::warn!(profile = %id, "Stored session unreadable: {}", e);
                    now
                }
            };
            slot.schedule().next_run_at = next_run_at;

            match ctx.ledger.generated_since(id, window_start) {
                Ok(times) if !times.is_empty() => {
                    tracing::debug!(profile = %id, count = times.len(), "Seeding rate window from ledger");
                    ctx.limiter.seed(id, times);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(profile = %id, "Artifact ledger unreadable: {}", e),
            }
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.inner.ctx
    }

    pub fn state(&self) -> SchedulerState {
        if self.inner.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    /// Starts the tick loop in the background
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut tick_loop = self.inner.tick_loop.lock().await;
        if tick_loop.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = self.inner.cancel_token();
        let inner = Arc::clone(&self.inner);
        let period = inner.ctx.tick;
        self.inner.running.store(true, Ordering::Release);

        *tick_loop = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Tick loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let tick = inner.tick_at(Utc::now());
                        if !tick.units.is_empty() {
                            tracing::debug!(dispatched = tick.units.len(), skipped = tick.skipped.len(), "Tick");
                        }
                    }
                }
            }
        }));

        tracing::info!(
            profiles = self.inner.slots.len(),
            tick_seconds = period.as_secs(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops the tick loop and waits for in-flight units to finish
    ///
    /// Units still waiting for a worker end as [`WorkOutcome::Cancelled`].
    /// Stopping a stopped scheduler is a no-op.
    pub async fn stop(&self) {
        let mut tick_loop = self.inner.tick_loop.lock().await;
        let Some(handle) = tick_loop.take() else {
            return;
        };

        self.inner.cancel_token().cancel();
        if let Err(e) = handle.await {
            tracing::error!("Tick loop ended abnormally: {}", e);
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();

        *self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.inner.running.store(false, Ordering::Release);
        tracing::info!("Scheduler stopped");
    }

    /// Dispatches work for every profile due at `now`
    pub fn tick_at(&self, now: DateTime<Utc>) -> Tick {
        self.inner.tick_at(now)
    }

    /// Runs one profile (or all) immediately, in either state
    ///
    /// The regular cadence is left untouched: `next_run_at` does not move.
    pub fn run_now(
        &self,
        profile_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Tick, SchedulerError> {
        let slots: Vec<Arc<ProfileSlot>> = match profile_id {
            Some(id) => {
                let i = self
                    .inner
                    .index
                    .get(id)
                    .ok_or_else(|| SchedulerError::UnknownProfile(id.to_string()))?;
                vec![Arc::clone(&self.inner.slots[*i])]
            }
            None => self.inner.slots.clone(),
        };

        let mut tick = Tick {
            units: Vec::new(),
            skipped: Vec::new(),
        };
        for slot in slots {
            match InFlightGuard::acquire(&slot) {
                Some(guard) => {
                    slot.schedule().last_run_at = Some(now);
                    tick.units
                        .push((slot.profile.id.clone(), self.inner.dispatch(guard, now)));
                }
                None => {
                    tracing::info!(profile = %slot.profile.id, "Run-now skipped, profile busy");
                    tick.skipped.push(slot.profile.id.clone());
                }
            }
        }
        Ok(tick)
    }

    /// Serializable snapshot of every profile
    pub fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let ctx = &self.inner.ctx;
        let profiles = self
            .inner
            .slots
            .iter()
            .map(|slot| {
                let schedule = slot.schedule().clone();
                let session = ctx.repository.try_load(&slot.profile.id).ok().flatten();
                ProfileStatus {
                    profile_id: slot.profile.id.clone(),
                    name: slot.profile.name.clone(),
                    last_run_at: schedule.last_run_at,
                    next_run_at: schedule.next_run_at,
                    in_flight: slot.in_flight.load(Ordering::Acquire),
                    last_outcome: schedule.last_outcome,
                    session_valid: session.as_ref().map(|s| s.is_usable()),
                    session_extracted_at: session.as_ref().map(|s| s.extracted_at),
                    extractions: schedule.extractions,
                    generations: schedule.generations,
                    window_usage: ctx.limiter.usage(&slot.profile.id, now),
                }
            })
            .collect();

        SchedulerStatus {
            state: self.state(),
            email_limit_per_hour: ctx.limiter.limit(),
            refresh_interval_minutes: ctx.refresh_interval.num_minutes(),
            profiles,
        }
    }
}

impl Inner {
    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn tick_at(&self, now: DateTime<Utc>) -> Tick {
        let mut tick = Tick {
            units: Vec::new(),
            skipped: Vec::new(),
        };

        for slot in &self.slots {
            let mut schedule = slot.schedule();
            if now < schedule.next_run_at {
                continue;
            }
            let Some(guard) = InFlightGuard::acquire(slot) else {
                tracing::debug!(profile = %slot.profile.id, "Still in flight, skipping this cycle");
                tick.skipped.push(slot.profile.id.clone());
                continue;
            };
            schedule.last_run_at = Some(now);
            schedule.next_run_at = now + self.ctx.refresh_interval;
            drop(schedule);

            tick.units.push((slot.profile.id.clone(), self.dispatch(guard, now)));
        }
        tick
    }

    /// Spawns the work unit owning `guard` onto the tracked pool
    fn dispatch(&self, guard: InFlightGuard, now: DateTime<Utc>) -> JoinHandle<WorkOutcome> {
        let ctx = Arc::clone(&self.ctx);
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel_token();

        self.tracker.spawn(async move {
            let slot = Arc::clone(&guard.0);
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = workers.acquire_owned() => permit.ok(),
            };

            let report = match permit {
                Some(_permit) => ctx.run_unit(slot.profile.clone(), now, cancel).await,
                None => UnitReport::idle(WorkOutcome::Cancelled),
            };
            slot.record(&report);
            drop(guard);
            report.outcome
        })
    }
}
