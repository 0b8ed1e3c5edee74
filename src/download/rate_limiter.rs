//! Per-host request pacing.
//!
//! [`RateLimiter`] enforces a minimum spacing between requests to the same
//! host and honours server-mandated pauses recorded from `Retry-After`
//! headers. Requests to different hosts never wait for each other, so the
//! API session and the image delivery hosts are paced independently.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mangabook_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_millis(200)));
//!
//! // First request to a host proceeds immediately
//! limiter.acquire("https://uploads.example/data/h/1.png").await;
//!
//! // Second request to the same host waits out the spacing
//! limiter.acquire("https://uploads.example/data/h/2.png").await;
//!
//! // Another host is unaffected
//! limiter.acquire("https://api.example/manga/x").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-host rate limiter shared across fetch tasks.
///
/// `DashMap` holds one state per host; the state's timing sits behind a
/// `tokio::sync::Mutex` so the check-then-update in [`RateLimiter::acquire`]
/// is atomic per host.
#[derive(Debug)]
pub struct RateLimiter {
    default_delay: Duration,
    /// Set for `--rate-limit 0`; Retry-After pauses are still honoured.
    disabled: bool,
    /// Arc lets callers drop the shard lock before awaiting the inner Mutex.
    domains: DashMap<String, Arc<DomainState>>,
}

#[derive(Debug, Default)]
struct DomainTiming {
    /// `None` until the first request (first request is immediate).
    last_request: Option<Instant>,
    /// Earliest instant any request may start, set from Retry-After.
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct DomainState {
    timing: Mutex<DomainTiming>,
    cumulative_delay_ms: AtomicU64,
}

impl DomainState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter spacing same-host requests by `default_delay`.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = default_delay.as_millis()))]
    pub fn new(default_delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            default_delay,
            disabled: default_delay.is_zero(),
            domains: DashMap::new(),
        }
    }

    /// Creates a limiter that applies no spacing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    fn state_for(&self, domain: &str) -> Arc<DomainState> {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .clone()
    }

    /// Waits until a request to `url`'s host may start, then records it.
    #[instrument(skip(self), fields(domain))]
    pub async fn acquire(&self, url: &str) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", &domain);

        if self.disabled && !self.domains.contains_key(&domain) {
            return;
        }

        let state = self.state_for(&domain);
        let mut timing = state.timing.lock().await;
        let now = Instant::now();

        let mut ready_at = now;
        if !self.disabled
            && let Some(last_request) = timing.last_request
        {
            ready_at = ready_at.max(last_request + self.default_delay);
        }
        if let Some(not_before) = timing.not_before {
            ready_at = ready_at.max(not_before);
        }

        if ready_at > now {
            let delay = ready_at - now;
            let cumulative = state.add_cumulative_delay(delay);
            debug!(
                domain = %domain,
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    domain = %domain,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider lowering concurrency for this host"
                );
            }
            tokio::time::sleep_until(ready_at).await;
        }

        timing.last_request = Some(Instant::now());
    }

    /// Records a server-mandated pause for `url`'s host.
    ///
    /// Every subsequent [`RateLimiter::acquire`] for the host waits at least
    /// until `delay` from now has passed.
    #[instrument(skip(self), fields(domain))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", &domain);

        let state = self.state_for(&domain);
        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        {
            let mut timing = state.timing.lock().await;
            timing.not_before = Some(timing.not_before.map_or(until, |t| t.max(until)));
        }

        debug!(
            domain = %domain,
            delay_ms = delay.as_millis(),
            "recorded server rate limit"
        );
    }
}

/// Lowercased host of `url`, or `"unknown"` when it cannot be parsed.
///
/// ```
/// use mangabook_core::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://Uploads.Example/data/x"), "uploads.example");
/// assert_eq!(extract_domain("http://127.0.0.1:8080/x"), "127.0.0.1");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (delta-seconds or HTTP-date).
///
/// Values above one hour are capped; past dates yield zero; anything else
/// unparseable yields `None`.
///
/// ```
/// use std::time::Duration;
/// use mangabook_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        Err(_) => Some(Duration::ZERO),
    }
}
