//! Everything a work unit needs, owned in one place

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::base::WorkOutcome;
use super::rate_limiter::RateLimiter;
use crate::auth::KeyProvider;
use crate::config::{AppConfig, Profile};
use crate::generator::{label_for, Artifact, GenerationError, Generator};
use crate::pipeline::{ExtractionError, ExtractionPipeline};
use crate::security::Sanitizer;
use crate::session::{
    ArtifactEntry, ArtifactLedger, FileLock, RepositoryError, SessionRecord, SessionRepository,
};

/// Subdirectory of the sessions dir holding the artifact ledger
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Result of a work unit plus what it changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnitReport {
    pub outcome: WorkOutcome,
    /// A fresh, complete session was extracted
    pub extracted: bool,
    /// Aliases generated and recorded
    pub generated: u64,
}

impl UnitReport {
    pub(crate) fn idle(outcome: WorkOutcome) -> Self {
        Self {
            outcome,
            extracted: false,
            generated: 0,
        }
    }
}

/// What the blocking half of a work unit leaves for generation
enum Prepared {
    /// Another process is working on the profile
    Busy,
    /// No usable session; nothing to generate with
    Unusable { extracted: bool, outcome: WorkOutcome },
    /// Session ready, profile locked and rate window in sync with the ledger
    Ready {
        lock: FileLock,
        extracted: bool,
        session: SessionRecord,
    },
}

/// Why a generation batch ended
#[derive(Debug)]
enum BatchEnd {
    WindowFull,
    Failed(GenerationError),
    Cancelled,
}

/// Shared collaborators and settings of the scheduler
pub struct SchedulerContext {
    pub(crate) profiles: Vec<Profile>,
    pub(crate) repository: Arc<SessionRepository>,
    pub(crate) ledger: Arc<ArtifactLedger>,
    pub(crate) pipeline: Arc<ExtractionPipeline>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) refresh_interval: chrono::Duration,
    pub(crate) generator_timeout: Duration,
    pub(crate) batch_gap: Duration,
    pub(crate) label_prefix: String,
    pub(crate) tick: Duration,
    pub(crate) max_concurrent: usize,
}

impl SchedulerContext {
    /// Opens the session store under `config.sessions_dir` and wires everything up
    pub fn new(
        config: &AppConfig,
        keys: Arc<dyn KeyProvider>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, RepositoryError> {
        let repository = Arc::new(SessionRepository::open(&config.sessions_dir)?);
        let pipeline = ExtractionPipeline::from_config(config, Arc::clone(&repository), keys);
        Self::from_parts(config, repository, pipeline, generator)
    }

    /// Wires a context around an existing repository and pipeline
    pub fn from_parts(
        config: &AppConfig,
        repository: Arc<SessionRepository>,
        pipeline: ExtractionPipeline,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, RepositoryError> {
        let ledger = Arc::new(ArtifactLedger::open(repository.dir().join(ARTIFACTS_DIR))?);
        Ok(Self {
            profiles: config.profiles.clone(),
            repository,
            ledger,
            pipeline: Arc::new(pipeline),
            limiter: Arc::new(RateLimiter::per_hour(config.email_limit_per_hour)),
            generator,
            refresh_interval: config.refresh_interval(),
            generator_timeout: config.generator.timeout(),
            batch_gap: config.generator.batch_gap(),
            label_prefix: config.generator.label_prefix.clone(),
            tick: Duration::from_secs(config.scheduler.tick_seconds),
            max_concurrent: config.scheduler.max_concurrent_profiles,
        })
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repository
    }

    pub fn ledger(&self) -> &Arc<ArtifactLedger> {
        &self.ledger
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Loads the stored session, re-extracting it when unusable or stale
    ///
    /// Blocking; returns whether a fresh, complete extraction happened.
    fn prepare_session(
        &self,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> (bool, Result<SessionRecord, WorkOutcome>) {
        let stored = self.repository.try_load(&profile.id).unwrap_or_else(|e| {
            tracing::warn!(profile = %profile.id, "Ignoring stored session: {}", e);
            None
        });
        if let Some(record) = stored {
            if !record.needs_refresh(now, self.refresh_interval) {
                return (false, Ok(record));
            }
        }

        match self.pipeline.refresh(profile, now) {
            Ok(record) => (true, Ok(record)),
            Err(ExtractionError::PartialExtraction { missing, .. }) => {
                (false, Err(WorkOutcome::IncompleteSession { missing }))
            }
            Err(e) => (
                false,
                Err(WorkOutcome::ExtractionFailed {
                    error: e.to_string(),
                }),
            ),
        }
    }

    /// Adds admissions other processes recorded in the ledger to the rate window
    fn sync_window(&self, profile_id: &str, now: DateTime<Utc>) {
        match self.ledger.generated_since(profile_id, now - self.limiter.span()) {
            Ok(times) => self.limiter.seed(profile_id, times),
            Err(e) => tracing::warn!(profile = %profile_id, "Artifact ledger unreadable: {}", e),
        }
    }

    /// Blocking half of a work unit: lock, refresh, sync the rate window
    fn prepare(&self, profile: &Profile, now: DateTime<Utc>) -> Prepared {
        let lock = match self.repository.try_lock_profile(&profile.id) {
            Ok(Some(lock)) => lock,
            Ok(None) => return Prepared::Busy,
            Err(e) => {
                return Prepared::Unusable {
                    extracted: false,
                    outcome: WorkOutcome::ExtractionFailed {
                        error: format!("profile lock: {}", e),
                    },
                }
            }
        };

        match self.prepare_session(profile, now) {
            (extracted, Ok(session)) => {
                self.sync_window(&profile.id, now);
                Prepared::Ready {
                    lock,
                    extracted,
                    session,
                }
            }
            (extracted, Err(outcome)) => Prepared::Unusable { extracted, outcome },
        }
    }

    /// Runs one profile's work unit: refresh, then generate until the window is full
    ///
    /// The profile's lock file is held throughout, so at most one unit per
    /// profile runs across every process sharing the sessions dir.
    pub(crate) async fn run_unit(
        self: Arc<Self>,
        profile: Profile,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> UnitReport {
        let ctx = Arc::clone(&self);
        let blocking_profile = profile.clone();
        let prepared = tokio::task::spawn_blocking(move || ctx.prepare(&blocking_profile, now))
            .await
            .unwrap_or_else(|e| Prepared::Unusable {
                extracted: false,
                outcome: WorkOutcome::ExtractionFailed {
                    error: format!("extraction task failed: {}", e),
                },
            });

        let (_lock, extracted, session) = match prepared {
            Prepared::Busy => {
                tracing::info!(profile = %profile.id, "Profile busy in another process, skipping");
                return UnitReport::idle(WorkOutcome::SkippedInFlight);
            }
            Prepared::Unusable { extracted, outcome } => {
                tracing::warn!(profile = %profile.id, outcome = ?outcome, "Session not usable");
                return UnitReport {
                    outcome,
                    extracted,
                    generated: 0,
                };
            }
            Prepared::Ready {
                lock,
                extracted,
                session,
            } => (lock, extracted, session),
        };

        let (artifacts, end) = self.generate_batch(&profile, &session, now, &cancel).await;
        let generated = artifacts.len() as u64;
        let outcome = match end {
            BatchEnd::Failed(GenerationError::AuthRejected) => {
                tracing::warn!(profile = %profile.id, "Session rejected, invalidating");
                self.invalidate(&profile.id).await;
                WorkOutcome::AuthRejected
            }
            _ if !artifacts.is_empty() => WorkOutcome::Generated { artifacts },
            BatchEnd::WindowFull => WorkOutcome::RateLimited,
            BatchEnd::Cancelled => WorkOutcome::Cancelled,
            BatchEnd::Failed(e) => WorkOutcome::GenerationFailed {
                error: e.to_string(),
            },
        };
        UnitReport {
            outcome,
            extracted,
            generated,
        }
    }

    /// Generates aliases until the window is full, a call fails or the scheduler stops
    async fn generate_batch(
        &self,
        profile: &Profile,
        session: &SessionRecord,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Vec<String>, BatchEnd) {
        let mut artifacts = Vec::new();
        loop {
            if !artifacts.is_empty() {
                if self.limiter.usage(&profile.id, now) >= self.limiter.limit() {
                    tracing::info!(profile = %profile.id, generated = artifacts.len(), "Rate window filled");
                    return (artifacts, BatchEnd::WindowFull);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.batch_gap) => {}
                }
            }
            if cancel.is_cancelled() {
                tracing::info!(profile = %profile.id, generated = artifacts.len(), "Batch cut short by shutdown");
                return (artifacts, BatchEnd::Cancelled);
            }

            if !self.limiter.try_admit(&profile.id, now) {
                tracing::info!(
                    profile = %profile.id,
                    next_slot = ?self.limiter.next_slot_at(&profile.id, now),
                    "Rate limit reached, skipping generation"
                );
                return (artifacts, BatchEnd::WindowFull);
            }

            let label = label_for(&self.label_prefix, &profile.id, now, artifacts.len());
            let result = tokio::time::timeout(
                self.generator_timeout,
                self.generator.generate(session, &label),
            )
            .await
            .unwrap_or(Err(GenerationError::Timeout(self.generator_timeout.as_secs())));

            match result {
                Ok(artifact) => artifacts.push(self.record_artifact(&profile.id, artifact, now).await),
                Err(e) => {
                    tracing::warn!(profile = %profile.id, generated = artifacts.len(), "Generation failed: {}", e);
                    return (artifacts, BatchEnd::Failed(e));
                }
            }
        }
    }

    /// Appends an artifact to the ledger and returns its alias
    ///
    /// A ledger failure is logged; the alias exists either way.
    async fn record_artifact(&self, profile_id: &str, artifact: Artifact, now: DateTime<Utc>) -> String {
        let entry = ArtifactEntry {
            profile_id: profile_id.to_string(),
            artifact: artifact.alias.clone(),
            label: artifact.label,
            generated_at: now,
        };
        let ledger = Arc::clone(&self.ledger);
        match tokio::task::spawn_blocking(move || ledger.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(profile = %profile_id, "Failed to record artifact: {}", e),
            Err(e) => tracing::error!(profile = %profile_id, "Ledger task failed: {}", e),
        }
        tracing::info!(
            profile = %profile_id,
            alias = %Sanitizer::mask_alias(&artifact.alias),
            "Alias generated"
        );
        artifact.alias
    }

    async fn invalidate(&self, profile_id: &str) {
        let repository = Arc::clone(&self.repository);
        let id = profile_id.to_string();
        match tokio::task::spawn_blocking(move || repository.invalidate(&id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(profile = %profile_id, "Failed to invalidate session: {}", e),
            Err(e) => tracing::error!(profile = %profile_id, "Invalidate task failed: {}", e),
        }
    }
}
