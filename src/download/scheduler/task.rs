use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::RunProgress;
use crate::download::constants::INTERRUPT_POLL_INTERVAL;
use crate::download::rate_limiter::parse_retry_after;
use crate::download::writer::write_body;
use crate::download::{
    FailureType, FetchError, RateLimiter, RetryDecision, RetryPolicy, classify_error,
};
use crate::model::{FetchOutcome, OutcomeStatus, WorkItem};
use crate::source::RemoteSource;

/// Shared handles cloned into every fetch task.
pub(super) struct TaskContext {
    pub(super) source: Arc<dyn RemoteSource>,
    pub(super) rate_limiter: Arc<RateLimiter>,
    pub(super) retry_policy: RetryPolicy,
    pub(super) global: Arc<Semaphore>,
    pub(super) group: Arc<Semaphore>,
    pub(super) progress: Arc<RunProgress>,
    pub(super) interrupted: Arc<AtomicBool>,
}

/// Decrements the in-flight gauges when the task ends, including on abort.
struct InFlight<'a> {
    progress: &'a RunProgress,
    group_id: &'a str,
}

impl<'a> InFlight<'a> {
    fn enter(progress: &'a RunProgress, group_id: &'a str) -> Self {
        progress.enter(group_id);
        Self { progress, group_id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.progress.leave(self.group_id);
    }
}

/// Resolves once the interrupt flag is set.
async fn wait_for_interrupt(interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
    }
}

/// Runs `future` unless the interrupt flag is set first.
async fn unless_interrupted<T>(interrupted: &AtomicBool, future: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        () = wait_for_interrupt(interrupted) => None,
        value = future => Some(value),
    }
}

async fn acquire_permits(
    group: Arc<Semaphore>,
    global: Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let group_permit = group.acquire_owned().await.ok()?;
    let global_permit = global.acquire_owned().await.ok()?;
    Some((group_permit, global_permit))
}

/// Admits one item under both caps and fetches it.
#[instrument(skip_all, fields(unit_id = %item.unit.id, group_id = %item.unit.group_id, reason = %item.reason))]
pub(super) async fn execute(context: TaskContext, item: WorkItem) -> FetchOutcome {
    let admitted = unless_interrupted(
        &context.interrupted,
        acquire_permits(Arc::clone(&context.group), Arc::clone(&context.global)),
    )
    .await
    .flatten();

    let Some(_permits) = admitted else {
        debug!("not admitted, run cancelled");
        return FetchOutcome::cancelled(&item);
    };

    let _in_flight = InFlight::enter(&context.progress, &item.unit.group_id);
    fetch_with_retry(&context, &item).await
}

/// Reads the Retry-After delay from a 429 and records it with the limiter.
async fn extract_retry_after_delay(
    error: &FetchError,
    url: &str,
    rate_limiter: &RateLimiter,
) -> Option<Duration> {
    let FetchError::HttpStatus {
        retry_after: Some(header),
        ..
    } = error
    else {
        return None;
    };
    let delay = parse_retry_after(header)?;
    rate_limiter.record_rate_limit(url, delay).await;
    debug!(url = %url, retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After header delay");
    Some(delay)
}

async fn attempt_fetch(context: &TaskContext, item: &WorkItem) -> Result<u64, FetchError> {
    let body = context.source.fetch_unit(&item.unit).await?;
    write_body(&item.target, &item.unit.url, body, item.unit.expected.size).await
}

/// Fetches with retry for transient errors, returning the terminal outcome.
async fn fetch_with_retry(context: &TaskContext, item: &WorkItem) -> FetchOutcome {
    let started = Instant::now();
    let url = item.unit.url.as_str();
    let policy = &context.retry_policy;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(attempt, "attempting fetch");

        if unless_interrupted(&context.interrupted, context.rate_limiter.acquire(url))
            .await
            .is_none()
        {
            return FetchOutcome::cancelled(item);
        }

        let error = match attempt_fetch(context, item).await {
            Ok(bytes) => {
                debug!(bytes, attempt, "fetch completed");
                return FetchOutcome::success(item, bytes, started.elapsed(), attempt);
            }
            Err(error) => error,
        };

        let failure_type = classify_error(&error);
        let retry_after = if failure_type == FailureType::RateLimited {
            extract_retry_after_delay(&error, url, &context.rate_limiter).await
        } else {
            None
        };

        match policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: backoff_delay,
                attempt: next_attempt,
            } => {
                let delay = retry_after.map_or(backoff_delay, |server| server.max(backoff_delay));
                info!(
                    url = %url,
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying fetch"
                );
                context.progress.increment_retried();
                if unless_interrupted(&context.interrupted, tokio::time::sleep(delay))
                    .await
                    .is_none()
                {
                    return FetchOutcome::cancelled(item);
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                let status = if failure_type.is_retryable() {
                    OutcomeStatus::RetryableFailure
                } else {
                    OutcomeStatus::FatalFailure
                };
                warn!(
                    url = %url,
                    error = %error,
                    attempts = attempt,
                    status = status.as_str(),
                    %reason,
                    "fetch failed"
                );
                return FetchOutcome::failure(item, status, error.to_string(), started.elapsed(), attempt)
                    .with_needs_auth(failure_type == FailureType::NeedsAuth);
            }
        }
    }
}
