//! Bounded-concurrency fetch scheduler.
//!
//! [`FetchScheduler::run`] executes a batch of [`WorkItem`]s and returns
//! exactly one [`FetchOutcome`] per item, in completion order.
//!
//! # Concurrency Model
//!
//! - Each item runs in its own Tokio task
//! - A task first takes a permit from its group's semaphore, then one from
//!   the global semaphore, so an item queued behind its group never holds a
//!   global slot
//! - Items are interleaved round-robin across groups before spawning, and
//!   Tokio semaphores are FIFO, so admission alternates between groups
//! - Permits are released when the task finishes (RAII)
//!
//! # Cancellation
//!
//! Once the interrupt flag is set no further item is admitted; queued items
//! resolve to [`OutcomeStatus::Cancelled`]. In-flight fetches get a grace
//! period and are then aborted. Aborting drops the writer's guard, which
//! removes the `.part` file.

mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use super::constants::{CANCEL_GRACE_PERIOD, INTERRUPT_POLL_INTERVAL};
use super::{RateLimiter, RetryPolicy};
use crate::model::{FetchOutcome, OutcomeStatus, WorkItem};
use crate::source::RemoteSource;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default global in-flight cap.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 10;

/// Default in-flight cap per group.
pub const DEFAULT_PER_GROUP_CONCURRENCY: usize = 5;

/// Error type for scheduler construction.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A concurrency cap is out of range.
    #[error(
        "invalid concurrency (global {global}, per group {per_group}): global must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, per group between {MIN_CONCURRENCY} and global"
    )]
    InvalidConcurrency { global: usize, per_group: usize },
}

/// Limits and policies for a [`FetchScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    max_global: usize,
    max_per_group: usize,
    retry_policy: RetryPolicy,
    grace_period: Duration,
}

impl SchedulerConfig {
    /// Validates the caps: `1 <= max_global <= 100` and `1 <= max_per_group <= max_global`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConcurrency`] when either cap is out of range.
    pub fn new(max_global: usize, max_per_group: usize) -> Result<Self, SchedulerError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&max_global)
            || !(MIN_CONCURRENCY..=max_global).contains(&max_per_group)
        {
            return Err(SchedulerError::InvalidConcurrency {
                global: max_global,
                per_group: max_per_group,
            });
        }
        Ok(Self {
            max_global,
            max_per_group,
            retry_policy: RetryPolicy::default(),
            grace_period: CANCEL_GRACE_PERIOD,
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// How long in-flight fetches may continue after an interrupt.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[must_use]
    pub fn max_global(&self) -> usize {
        self.max_global
    }

    #[must_use]
    pub fn max_per_group(&self) -> usize {
        self.max_per_group
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_global: DEFAULT_GLOBAL_CONCURRENCY,
            max_per_group: DEFAULT_PER_GROUP_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            grace_period: CANCEL_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupGauge {
    current: usize,
    peak: usize,
}

/// Live counters for a scheduler, shared with progress displays.
///
/// Counters accumulate across every [`FetchScheduler::run`] call on the same
/// scheduler.
#[derive(Debug, Default)]
pub struct RunProgress {
    planned: AtomicUsize,
    finished: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    retried: AtomicUsize,
    bytes: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    groups: DashMap<String, GroupGauge>,
}

impl RunProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn planned(&self) -> usize {
        self.planned.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Retry attempts made (not counting first attempts).
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight fetches observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight fetches observed for one group.
    #[must_use]
    pub fn peak_group_in_flight(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map_or(0, |gauge| gauge.peak)
    }

    fn add_planned(&self, count: usize) {
        self.planned.fetch_add(count, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, outcome: &FetchOutcome) {
        match outcome.status {
            OutcomeStatus::Success => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                self.bytes.fetch_add(outcome.bytes, Ordering::SeqCst);
            }
            OutcomeStatus::RetryableFailure | OutcomeStatus::FatalFailure => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            OutcomeStatus::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn enter(&self, group_id: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut gauge = self.groups.entry(group_id.to_string()).or_default();
        gauge.current += 1;
        gauge.peak = gauge.peak.max(gauge.current);
    }

    fn leave(&self, group_id: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut gauge) = self.groups.get_mut(group_id) {
            gauge.current = gauge.current.saturating_sub(1);
        }
    }
}

/// Executes work items under global and per-group caps with retry.
pub struct FetchScheduler {
    config: SchedulerConfig,
    source: Arc<dyn RemoteSource>,
    rate_limiter: Arc<RateLimiter>,
    global: Arc<Semaphore>,
    groups: DashMap<String, Arc<Semaphore>>,
    progress: Arc<RunProgress>,
}

impl std::fmt::Debug for FetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchScheduler")
            .field("config", &self.config)
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl FetchScheduler {
    #[must_use]
    #[instrument(level = "debug", skip_all, fields(max_global = config.max_global, max_per_group = config.max_per_group))]
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn RemoteSource>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        debug!(
            max_retries = config.retry_policy.max_attempts(),
            rate_limit_ms = rate_limiter.default_delay().as_millis(),
            "creating fetch scheduler"
        );
        Self {
            global: Arc::new(Semaphore::new(config.max_global)),
            config,
            source,
            rate_limiter,
            groups: DashMap::new(),
            progress: Arc::new(RunProgress::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Shared progress counters.
    #[must_use]
    pub fn progress(&self) -> Arc<RunProgress> {
        Arc::clone(&self.progress)
    }

    fn group_semaphore(&self, group_id: &str) -> Arc<Semaphore> {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_group)))
            .clone()
    }

    /// Runs every item to a terminal outcome.
    ///
    /// Individual fetch failures never make this method fail; they are
    /// reported in the returned outcomes.
    #[instrument(skip(self, items, interrupted), fields(items = items.len()))]
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        interrupted: &Arc<AtomicBool>,
    ) -> Vec<FetchOutcome> {
        let items = interleave_by_group(items);
        let total = items.len();
        self.progress.add_planned(total);
        info!(total, "starting fetch batch");

        let mut pending: Vec<(WorkItem, JoinHandle<FetchOutcome>)> = Vec::with_capacity(total);
        for item in items {
            let context = task::TaskContext {
                source: Arc::clone(&self.source),
                rate_limiter: Arc::clone(&self.rate_limiter),
                retry_policy: self.config.retry_policy.clone(),
                global: Arc::clone(&self.global),
                group: self.group_semaphore(&item.unit.group_id),
                progress: Arc::clone(&self.progress),
                interrupted: Arc::clone(interrupted),
            };
            let task_item = item.clone();
            pending.push((item, tokio::spawn(task::execute(context, task_item))));
        }

        let mut outcomes = Vec::with_capacity(total);
        loop {
            self.drain_finished(&mut pending, &mut outcomes).await;
            if pending.is_empty() || interrupted.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
        }

        if !pending.is_empty() {
            debug!(
                in_flight = pending.len(),
                grace_ms = self.config.grace_period.as_millis(),
                "interrupted, waiting for in-flight fetches"
            );
            let deadline = tokio::time::Instant::now() + self.config.grace_period;
            for (item, mut handle) in pending {
                let now = tokio::time::Instant::now();
                let joined = if now >= deadline {
                    handle.abort();
                    handle.await
                } else {
                    match tokio::time::timeout(deadline - now, &mut handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            handle.abort();
                            handle.await
                        }
                    }
                };
                let outcome = outcome_from_join(&item, joined);
                self.progress.record(&outcome);
                outcomes.push(outcome);
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.status == OutcomeStatus::Success).count();
        let failed = outcomes.iter().filter(|o| o.status.is_failure()).count();
        info!(
            succeeded,
            failed,
            cancelled = total - succeeded - failed,
            "fetch batch complete"
        );
        outcomes
    }

    async fn drain_finished(
        &self,
        pending: &mut Vec<(WorkItem, JoinHandle<FetchOutcome>)>,
        outcomes: &mut Vec<FetchOutcome>,
    ) {
        let mut idx = 0;
        while idx < pending.len() {
            if pending[idx].1.is_finished() {
                let (item, handle) = pending.swap_remove(idx);
                let outcome = outcome_from_join(&item, handle.await);
                self.progress.record(&outcome);
                outcomes.push(outcome);
            } else {
                idx += 1;
            }
        }
    }
}

fn outcome_from_join(item: &WorkItem, joined: Result<FetchOutcome, JoinError>) -> FetchOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(error) if error.is_cancelled() => FetchOutcome::cancelled(item),
        Err(error) => {
            warn!(unit_id = %item.unit.id, error = %error, "fetch task panicked");
            FetchOutcome::failure(
                item,
                OutcomeStatus::FatalFailure,
                format!("fetch task panicked: {error}"),
                Duration::ZERO,
                1,
            )
        }
    }
}

/// Reorders items so consecutive items come from different groups where possible.
fn interleave_by_group(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let total = items.len();
    let mut order: Vec<String> = Vec::new();
    let mut queues: HashMap<String, VecDeque<WorkItem>> = HashMap::new();
    for item in items {
        let group_id = item.unit.group_id.clone();
        queues
            .entry(group_id.clone())
            .or_insert_with(|| {
                order.push(group_id);
                VecDeque::new()
            })
            .push_back(item);
    }

    let mut interleaved = Vec::with_capacity(total);
    while interleaved.len() < total {
        for group_id in &order {
            if let Some(item) = queues.get_mut(group_id).and_then(VecDeque::pop_front) {
                interleaved.push(item);
            }
        }
    }
    interleaved
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::model::{ContentUnit, ExpectedArtifact, WorkReason};

    fn item(group: &str, ordinal: u32) -> WorkItem {
        WorkItem::new(
            ContentUnit {
                id: format!("{group}:{ordinal}"),
                group_id: group.to_string(),
                ordinal,
                url: format!("https://cdn.example/{group}/{ordinal}.png"),
                relative_path: PathBuf::from(format!("{group}/{ordinal}.png")),
                expected: ExpectedArtifact::default(),
                version: "v1".to_string(),
            },
            Path::new("/lib"),
            WorkReason::Missing,
        )
    }

    #[test]
    fn test_scheduler_config_valid_ranges() {
        assert!(SchedulerConfig::new(1, 1).is_ok());
        assert!(SchedulerConfig::new(100, 100).is_ok());
        let config = SchedulerConfig::new(10, 4).unwrap();
        assert_eq!(config.max_global(), 10);
        assert_eq!(config.max_per_group(), 4);
    }

    #[test]
    fn test_scheduler_config_rejects_out_of_range() {
        assert!(matches!(
            SchedulerConfig::new(0, 1),
            Err(SchedulerError::InvalidConcurrency { global: 0, .. })
        ));
        assert!(SchedulerConfig::new(101, 1).is_err());
        assert!(SchedulerConfig::new(4, 0).is_err());
        assert!(SchedulerConfig::new(4, 5).is_err());
    }

    #[test]
    fn test_scheduler_error_display() {
        let msg = SchedulerError::InvalidConcurrency {
            global: 0,
            per_group: 1,
        }
        .to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_default_concurrency_constants() {
        assert_eq!(DEFAULT_GLOBAL_CONCURRENCY, 10);
        assert_eq!(DEFAULT_PER_GROUP_CONCURRENCY, 5);
        let config = SchedulerConfig::default();
        assert_eq!(config.max_global(), DEFAULT_GLOBAL_CONCURRENCY);
    }

    #[test]
    fn test_interleave_by_group_round_robin() {
        let items = vec![item("a", 0), item("a", 1), item("a", 2), item("b", 0), item("c", 0)];
        let ids: Vec<String> = interleave_by_group(items)
            .into_iter()
            .map(|item| item.unit.id)
            .collect();
        assert_eq!(ids, vec!["a:0", "b:0", "c:0", "a:1", "a:2"]);
    }

    #[test]
    fn test_interleave_empty() {
        assert!(interleave_by_group(Vec::new()).is_empty());
    }

    #[test]
    fn test_run_progress_records_outcomes() {
        let progress = RunProgress::new();
        let a = item("a", 0);
        progress.add_planned(3);
        progress.record(&FetchOutcome::success(&a, 10, Duration::ZERO, 1));
        progress.record(&FetchOutcome::failure(
            &a,
            OutcomeStatus::RetryableFailure,
            "x",
            Duration::ZERO,
            3,
        ));
        progress.record(&FetchOutcome::cancelled(&a));
        assert_eq!(progress.planned(), 3);
        assert_eq!(progress.finished(), 3);
        assert_eq!(progress.succeeded(), 1);
        assert_eq!(progress.failed(), 1);
        assert_eq!(progress.cancelled(), 1);
        assert_eq!(progress.bytes(), 10);
    }

    #[test]
    fn test_run_progress_tracks_peaks() {
        let progress = RunProgress::new();
        progress.enter("a");
        progress.enter("a");
        progress.enter("b");
        progress.leave("a");
        progress.enter("b");
        assert_eq!(progress.in_flight(), 3);
        assert_eq!(progress.peak_in_flight(), 3);
        assert_eq!(progress.peak_group_in_flight("a"), 2);
        assert_eq!(progress.peak_group_in_flight("b"), 2);
        assert_eq!(progress.peak_group_in_flight("missing"), 0);
    }

    #[test]
    fn test_outcome_from_join_ok_passthrough() {
        let a = item("a", 0);
        let outcome = outcome_from_join(&a, Ok(FetchOutcome::success(&a, 5, Duration::ZERO, 1)));
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }
}
