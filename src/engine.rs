//! Orchestration driver.
//!
//! [`Orchestrator::run`] drives every requested group through
//! list → plan → fetch → record, and is the only writer of the manifest.
//!
//! # Overview
//!
//! 1. Load the root's manifest (missing or corrupt ⇒ empty)
//! 2. List and reconcile each group in turn; listing failures mark the group
//!    `Unavailable` without affecting siblings, authentication failures abort
//! 3. Fetch planned items through the shared [`FetchScheduler`], with up to
//!    `max_concurrent_groups` groups in flight
//! 4. Apply each group's outcomes to the manifest and save it once per group
//!
//! On interrupt, admission stops, in-flight fetches get a grace period, and
//! the manifest is flushed before returning.

mod summary;

pub use summary::{GroupReport, GroupState, RunSummary};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::download::constants::CANCEL_GRACE_PERIOD;
use crate::download::{
    DEFAULT_GLOBAL_CONCURRENCY, DEFAULT_PER_GROUP_CONCURRENCY, FetchScheduler, RateLimiter,
    RetryPolicy, RunProgress, SchedulerConfig, SchedulerError,
};
use crate::manifest::{
    DEFAULT_RETENTION_DAYS, EntryStatus, Manifest, ManifestEntry, ManifestError, ManifestStore,
};
use crate::model::{
    ContentUnit, ExpectedArtifact, FetchOutcome, GroupRef, OutcomeStatus, RemoteListing, WorkItem,
    WorkReason,
};
use crate::reconcile::{ReconcilePlan, ReconcilePolicy, plan};
use crate::source::{RemoteSource, SourceError};
use crate::validate::Validator;

/// Default number of groups fetched at the same time.
pub const DEFAULT_MAX_CONCURRENT_GROUPS: usize = 2;

/// Error type for orchestrated runs.
///
/// Per-unit failures never surface here; they are reported in [`RunSummary`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The manifest could not be persisted.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// The remote rejected the session while listing.
    #[error("{0}")]
    Auth(SourceError),

    /// Invalid concurrency settings.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A file-validation pass was cancelled by runtime shutdown.
    #[error("validation task did not finish: {0}")]
    Validation(#[source] tokio::task::JoinError),
}

/// Engine policy, read-only for the run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_global_concurrency: usize,
    pub max_per_group_concurrency: usize,
    pub force_overwrite: bool,
    pub check_local: bool,
    /// Manifest entries older than this are pruned on save; 0 disables.
    pub retention_days: u32,
    pub whole_group_refresh: bool,
    pub max_concurrent_groups: usize,
    pub retry_policy: RetryPolicy,
    /// How long in-flight fetches may finish after an interrupt.
    pub grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_global_concurrency: DEFAULT_GLOBAL_CONCURRENCY,
            max_per_group_concurrency: DEFAULT_PER_GROUP_CONCURRENCY,
            force_overwrite: false,
            check_local: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            whole_group_refresh: true,
            max_concurrent_groups: DEFAULT_MAX_CONCURRENT_GROUPS,
            retry_policy: RetryPolicy::default(),
            grace_period: CANCEL_GRACE_PERIOD,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            force_overwrite: self.force_overwrite,
            check_local: self.check_local,
            whole_group_refresh: self.whole_group_refresh,
        }
    }

    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the concurrency caps are out of range.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, SchedulerError> {
        Ok(
            SchedulerConfig::new(self.max_global_concurrency, self.max_per_group_concurrency)?
                .with_retry_policy(self.retry_policy.clone())
                .with_grace_period(self.grace_period),
        )
    }
}

/// One group's listing and plan, ready to fetch.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group: GroupRef,
    pub listing: RemoteListing,
    pub plan: ReconcilePlan,
}

/// Drives groups of one root through planning, fetching and recording.
pub struct Orchestrator {
    config: EngineConfig,
    source: Arc<dyn RemoteSource>,
    store: ManifestStore,
    scheduler: FetchScheduler,
    validator: Validator,
    root_dir: PathBuf,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .field("root_dir", &self.root_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates a driver writing pages under `root_dir`.
    ///
    /// The store's retention is taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Scheduler`] for out-of-range concurrency caps.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn RemoteSource>,
        store: ManifestStore,
        root_dir: impl Into<PathBuf>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, EngineError> {
        let scheduler =
            FetchScheduler::new(config.scheduler_config()?, Arc::clone(&source), rate_limiter);
        Ok(Self {
            store: store.with_retention_days(config.retention_days),
            config,
            source,
            scheduler,
            validator: Validator::new(),
            root_dir: root_dir.into(),
        })
    }

    /// Replaces the validator (e.g. with [`Validator::strict`]).
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    #[must_use]
    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Live counters for progress display.
    #[must_use]
    pub fn progress(&self) -> Arc<RunProgress> {
        self.scheduler.progress()
    }

    /// Lists and reconciles `groups` without fetching anything.
    ///
    /// Groups that cannot be listed are left out, except that an
    /// authentication failure aborts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Auth`] if the remote rejects the session.
    #[instrument(skip(self, groups), fields(groups = groups.len()))]
    pub async fn plan_groups(
        &self,
        root_id: &str,
        groups: &[GroupRef],
    ) -> Result<Vec<GroupPlan>, EngineError> {
        let manifest = self.store.load(root_id).await;
        let mut plans = Vec::with_capacity(groups.len());
        for group in groups {
            match self.source.list_group(root_id, &group.id).await {
                Ok(listing) => {
                    let plan = self.plan_listing(&listing, &manifest).await?;
                    plans.push(GroupPlan {
                        group: group.clone(),
                        listing,
                        plan,
                    });
                }
                Err(error) if error.is_auth() => return Err(EngineError::Auth(error)),
                Err(error) => {
                    warn!(group_id = %group.id, error = %error, "group unavailable");
                }
            }
        }
        Ok(plans)
    }

    /// Reconciles one listing on the blocking pool; validation reads files.
    async fn plan_listing(
        &self,
        listing: &RemoteListing,
        manifest: &Manifest,
    ) -> Result<ReconcilePlan, EngineError> {
        let listing = listing.clone();
        let manifest = manifest.clone();
        let root_dir = self.root_dir.clone();
        let validator = self.validator;
        let policy = self.config.reconcile_policy();
        off_runtime(move || plan(&listing, &manifest, &root_dir, &validator, &policy)).await
    }

    /// Ids of successfully fetched units whose file fails validation.
    async fn rejected_after_fetch(
        &self,
        job: &GroupPlan,
        outcomes: &[FetchOutcome],
    ) -> Result<HashSet<String>, EngineError> {
        let fetched: HashSet<&str> = outcomes
            .iter()
            .filter(|outcome| outcome.status == OutcomeStatus::Success)
            .map(|outcome| outcome.unit_id.as_str())
            .collect();
        let checks: Vec<(String, PathBuf, ExpectedArtifact)> = job
            .listing
            .units
            .iter()
            .filter(|unit| fetched.contains(unit.id.as_str()))
            .map(|unit| {
                (
                    unit.id.clone(),
                    self.root_dir.join(&unit.relative_path),
                    unit.expected.clone(),
                )
            })
            .collect();
        if checks.is_empty() {
            return Ok(HashSet::new());
        }
        let validator = self.validator;
        off_runtime(move || {
            checks
                .into_iter()
                .filter(|(_, path, expected)| !validator.is_valid(path, Some(expected)))
                .map(|(unit_id, _, _)| unit_id)
                .collect()
        })
        .await
    }

    /// Runs every group in `groups` to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Manifest`] if the manifest cannot be saved and
    /// [`EngineError::Auth`] if the remote rejects the session while listing.
    /// The manifest is flushed before either is returned where possible.
    #[instrument(skip(self, groups, interrupted), fields(groups = groups.len(), root_dir = %self.root_dir.display()))]
    pub async fn run(
        &self,
        root_id: &str,
        groups: &[GroupRef],
        interrupted: &Arc<AtomicBool>,
    ) -> Result<RunSummary, EngineError> {
        let mut manifest = self.store.load(root_id).await;
        let mut summary = RunSummary::new(root_id);
        let mut reports: HashMap<String, GroupReport> = HashMap::new();
        let mut jobs: Vec<GroupPlan> = Vec::new();

        info!(root_id, "starting run");

        // Listing phase: sequential, stops early on interrupt.
        for group in groups {
            let mut report = GroupReport::new(&group.id, &group.label);
            if interrupted.load(Ordering::SeqCst) {
                summary.interrupted = true;
                reports.insert(group.id.clone(), report);
                continue;
            }
            report.transition(GroupState::Planning);

            let listing = match self.source.list_group(root_id, &group.id).await {
                Ok(listing) => listing,
                Err(error) if error.is_auth() => {
                    warn!(group_id = %group.id, error = %error, "authentication rejected, aborting run");
                    self.store.save(&mut manifest).await?;
                    return Err(EngineError::Auth(error));
                }
                Err(error) => {
                    warn!(group_id = %group.id, error = %error, "group unavailable");
                    report.error = Some(error.to_string());
                    report.transition(GroupState::Unavailable);
                    reports.insert(group.id.clone(), report);
                    continue;
                }
            };

            let plan = match self.plan_listing(&listing, &manifest).await {
                Ok(plan) => plan,
                Err(error) => {
                    self.store.save(&mut manifest).await?;
                    return Err(error);
                }
            };
            report.skipped_valid = plan.keep.len();
            debug!(
                group_id = %group.id,
                keep = plan.keep.len(),
                refetch = plan.refetch.len(),
                reasons = ?plan.reasons(),
                "planned group"
            );

            if plan.is_empty() {
                if listing.is_empty() {
                    warn!(group_id = %group.id, "group has no units");
                } else {
                    manifest.set_group_complete(&listing.group.id, true);
                }
                report.transition(GroupState::Complete);
                reports.insert(group.id.clone(), report);
                continue;
            }

            record_plan(&mut manifest, &listing.group.id, &plan);
            reports.insert(group.id.clone(), report);
            jobs.push(GroupPlan {
                group: group.clone(),
                listing,
                plan,
            });
        }

        // Persist the demotions before any fetch can be interrupted.
        self.store.save(&mut manifest).await?;

        // Fetch phase: groups overlap up to the configured limit; outcomes are
        // applied here, on the driver, one group at a time.
        let max_groups = self.config.max_concurrent_groups.max(1);
        let mut fetches = futures_util::stream::iter(jobs)
            .map(|job| async move {
                if interrupted.load(Ordering::SeqCst) {
                    return (job, None);
                }
                let items: Vec<WorkItem> = job.plan.refetch.clone();
                let outcomes = self.scheduler.run(items, interrupted).await;
                (job, Some(outcomes))
            })
            .buffer_unordered(max_groups);

        while let Some((job, outcomes)) = fetches.next().await {
            let Some(report) = reports.get_mut(&job.group.id) else {
                continue;
            };
            let Some(outcomes) = outcomes else {
                // never started
                report.cancelled = job.plan.refetch.len();
                summary.interrupted = true;
                continue;
            };

            report.transition(GroupState::Fetching);
            let rejected = self.rejected_after_fetch(&job, &outcomes).await?;
            self.apply_outcomes(&mut manifest, &job, &outcomes, &rejected, report);
            report.transition(GroupState::Reconciled);

            let complete = report.failed() == 0 && report.cancelled == 0;
            manifest.set_group_complete(&job.listing.group.id, complete);
            report.transition(if complete {
                GroupState::Complete
            } else {
                GroupState::PartiallyFailed
            });

            info!(
                group_id = %job.group.id,
                state = %report.state,
                downloaded = report.downloaded,
                skipped = report.skipped_valid,
                failed = report.failed(),
                cancelled = report.cancelled,
                "group finished"
            );
            self.store.save(&mut manifest).await?;
        }
        drop(fetches);

        if interrupted.load(Ordering::SeqCst) {
            summary.interrupted = true;
            self.store.save(&mut manifest).await?;
            info!("run interrupted, manifest flushed");
        }

        summary.groups = groups
            .iter()
            .filter_map(|group| reports.remove(&group.id))
            .collect();

        info!(
            downloaded = summary.downloaded(),
            skipped = summary.skipped_valid(),
            failed = summary.failed(),
            retried = summary.retried(),
            interrupted = summary.interrupted,
            "run complete"
        );
        Ok(summary)
    }

    /// Records each outcome in the manifest and the group's report.
    fn apply_outcomes(
        &self,
        manifest: &mut Manifest,
        job: &GroupPlan,
        outcomes: &[FetchOutcome],
        rejected: &HashSet<String>,
        report: &mut GroupReport,
    ) {
        let units: HashMap<&str, &ContentUnit> = job
            .listing
            .units
            .iter()
            .map(|unit| (unit.id.as_str(), unit))
            .collect();
        let now = Utc::now();

        for outcome in outcomes {
            let Some(unit) = units.get(outcome.unit_id.as_str()) else {
                warn!(unit_id = %outcome.unit_id, "outcome for unknown unit");
                continue;
            };

            let previous = manifest.entry(&unit.id).cloned();
            let mut outcome = outcome.clone();

            // The writer checked length; the signature check catches error pages.
            if outcome.status == OutcomeStatus::Success && rejected.contains(&unit.id) {
                warn!(unit_id = %unit.id, "fetched page failed validation");
                outcome.status = OutcomeStatus::RetryableFailure;
                outcome.error = Some("fetched file failed validation".to_string());
            }

            let status = match outcome.status {
                OutcomeStatus::Success => EntryStatus::Downloaded,
                OutcomeStatus::RetryableFailure | OutcomeStatus::FatalFailure => {
                    EntryStatus::Failed
                }
                OutcomeStatus::Cancelled => {
                    report.record(&outcome);
                    if previous.is_none() {
                        manifest.upsert(pending_entry(unit, now));
                    }
                    continue;
                }
            };

            let remote_version = if status == EntryStatus::Downloaded {
                unit.version.clone()
            } else {
                previous
                    .as_ref()
                    .map(|entry| entry.remote_version.clone())
                    .unwrap_or_default()
            };
            manifest.upsert(ManifestEntry {
                unit_id: unit.id.clone(),
                group_id: unit.group_id.clone(),
                local_path: unit.relative_path.clone(),
                downloaded_at: now,
                remote_version,
                status,
                retries: outcome.retries(),
            });
            report.record(&outcome);
        }
    }
}

/// Runs synchronous filesystem work on the blocking pool.
///
/// Panics are re-raised on the caller.
async fn off_runtime<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(value) => Ok(value),
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(error) => Err(EngineError::Validation(error)),
    }
}

/// Applies a fresh plan to the manifest before fetching.
///
/// Entries the reconciler rejected stop claiming `downloaded`, and a group
/// with anything left to fetch is no longer complete. Cancelled or never
/// started fetches then leave the manifest consistent with the disk.
fn record_plan(manifest: &mut Manifest, group_id: &str, plan: &ReconcilePlan) {
    let mut demoted = 0_usize;
    for item in &plan.refetch {
        if matches!(item.reason, WorkReason::Invalid | WorkReason::Outdated)
            && manifest.mark_invalid(&item.unit.id)
        {
            demoted += 1;
        }
    }
    if demoted > 0 {
        debug!(group_id, demoted, "marked rejected entries invalid");
    }
    if !plan.is_empty() {
        manifest.set_group_complete(group_id, false);
    }
}

fn pending_entry(unit: &ContentUnit, now: chrono::DateTime<Utc>) -> ManifestEntry {
    ManifestEntry {
        unit_id: unit.id.clone(),
        group_id: unit.group_id.clone(),
        local_path: unit.relative_path.clone(),
        downloaded_at: now,
        remote_version: String::new(),
        status: EntryStatus::Pending,
        retries: 0,
    }
}
