//! Page fetching under bounded concurrency.
//!
//! # Features
//!
//! - Global and per-group concurrency caps ([`FetchScheduler`])
//! - Retry with exponential backoff and jitter ([`RetryPolicy`])
//! - Per-host pacing that honours `Retry-After` ([`RateLimiter`])
//! - Streaming writes through a `.part` file renamed into place
//! - Cooperative cancellation with a grace period
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use mangabook_core::download::{FetchScheduler, RateLimiter, SchedulerConfig};
//! use mangabook_core::source::{ApiSession, MangaDexSource, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(ApiSession::new(SessionConfig::default())?);
//! let source = Arc::new(MangaDexSource::new(session));
//! let scheduler = FetchScheduler::new(
//!     SchedulerConfig::new(10, 5)?,
//!     source,
//!     Arc::new(RateLimiter::disabled()),
//! );
//! let interrupted = Arc::new(AtomicBool::new(false));
//! let outcomes = scheduler.run(Vec::new(), &interrupted).await;
//! assert!(outcomes.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod error;
pub mod rate_limiter;
mod retry;
mod scheduler;
pub mod writer;

pub use error::FetchError;
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use scheduler::{
    DEFAULT_GLOBAL_CONCURRENCY, DEFAULT_PER_GROUP_CONCURRENCY, FetchScheduler, RunProgress,
    SchedulerConfig, SchedulerError,
};

// Note: no module-local Result aliases; use `Result<T, FetchError>` explicitly.
