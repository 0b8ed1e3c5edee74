//! Constants for the download module (timeouts, pacing, cancellation).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (2 minutes per page).
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Default spacing between requests to one image host.
pub const DEFAULT_RATE_LIMIT_MS: u64 = 100;

/// Warning threshold for cumulative rate limit delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// How long in-flight fetches may keep running after an interrupt.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Poll interval for the interrupt flag.
pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
