//! Error types for page fetches.
//!
//! Every failure of a single work item is expressed as a [`FetchError`]; the
//! scheduler classifies it (see [`super::classify_error`]) into retry
//! decisions and a final outcome status instead of propagating it.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching one content unit.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error fetching {url}: {detail}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// Rendered underlying error.
        detail: String,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP status other than authentication rejections.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The server rejected the session's credentials.
    #[error("[AUTH] authentication required (HTTP {status}) fetching {url}\n  Suggestion: {suggestion}")]
    AuthRequired {
        url: String,
        status: u16,
        suggestion: &'static str,
    },

    /// The body stream broke off mid-transfer.
    #[error("stream interrupted fetching {url}: {detail}")]
    Stream { url: String, detail: String },

    /// The server returned an empty body.
    #[error("empty body fetching {url}")]
    EmptyBody { url: String },

    /// Local filesystem failure while writing the page.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The unit's URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Bytes received do not match the advertised or expected length.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },
}

impl FetchError {
    /// Creates a network error from any displayable cause.
    pub fn network(url: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            detail: detail.to_string(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an authentication error; 407 gets a proxy hint.
    pub fn auth_required(url: impl Into<String>, status: u16) -> Self {
        let suggestion = if status == 407 {
            "Configure your HTTP proxy settings or check proxy credentials."
        } else {
            "Refresh the API token in MANGABOOK_API_TOKEN and run again."
        };
        Self::AuthRequired {
            url: url.into(),
            status,
            suggestion,
        }
    }

    /// Creates a mid-stream failure.
    pub fn stream(url: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Stream {
            url: url.into(),
            detail: detail.to_string(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Maps a reqwest send/stream error, keeping timeouts distinct.
    pub fn from_reqwest(url: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, error)
        }
    }
}
