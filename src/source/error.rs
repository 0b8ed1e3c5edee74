//! Error types for remote enumeration calls.

use thiserror::Error;

/// Errors from enumerating a root or a group on the remote.
///
/// Page body fetches report [`crate::download::FetchError`] instead, since
/// those feed the scheduler's retry classification.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The API rejected the session's credentials.
    #[error("[AUTH] authentication rejected (HTTP {status}) for {url}\n  Suggestion: refresh MANGABOOK_API_TOKEN and run again")]
    Auth { url: String, status: u16 },

    /// The root or group does not exist (HTTP 404/410).
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Any other non-success status.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Connection-level failure or timeout.
    #[error("transport error calling {url}: {detail}")]
    Transport { url: String, detail: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response from {url}: {detail}")]
    Decode { url: String, detail: String },

    /// The requested group is not present in the root's listing.
    #[error("group {group_id} not found for {root_id}")]
    UnknownGroup { root_id: String, group_id: String },

    /// The configured API base URL cannot be used.
    #[error("invalid API base URL {url}: {detail}")]
    InvalidBaseUrl { url: String, detail: String },

    /// The HTTP client could not be constructed.
    #[error("HTTP client construction failed: {0}")]
    ClientBuild(String),
}

impl SourceError {
    /// Maps a non-success status to the matching variant.
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        match status {
            401 | 403 | 407 => Self::Auth { url, status },
            404 | 410 => Self::NotFound { url },
            _ => Self::Http { url, status },
        }
    }

    pub fn transport(url: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.into(),
            detail: detail.to_string(),
        }
    }

    pub fn decode(url: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Decode {
            url: url.into(),
            detail: detail.to_string(),
        }
    }

    /// True for credential rejections, which abort the whole run.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}
