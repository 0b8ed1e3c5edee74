//! Shared HTTP session for one run.
//!
//! [`ApiSession`] owns the pooled reqwest client, the API base URL, the
//! optional bearer token and API-side pacing. It is created once per run,
//! shared read-only (via `Arc`) by the adapter and every fetch task, and
//! released when the last clone drops.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use super::SourceError;
use crate::download::RateLimiter;
use crate::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Public MangaDex API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.mangadex.org";

/// Minimum spacing between API calls (the public API allows ~5 req/s).
pub const DEFAULT_API_DELAY: Duration = Duration::from_millis(250);

/// Environment variable holding an optional bearer token.
pub const API_TOKEN_ENV: &str = "MANGABOOK_API_TOKEN";

/// Connection settings for an [`ApiSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Spacing between API calls; zero disables API pacing.
    pub api_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            api_delay: DEFAULT_API_DELAY,
        }
    }
}

impl SessionConfig {
    /// Reads the bearer token from [`API_TOKEN_ENV`], ignoring blank values.
    #[must_use]
    pub fn with_env_token(mut self) -> Self {
        self.token = std::env::var(API_TOKEN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }
}

/// Pooled client plus API coordinates, shared across workers.
#[derive(Debug, Clone)]
pub struct ApiSession {
    client: Client,
    api_base_url: String,
    token: Option<Arc<str>>,
    api_limiter: Arc<RateLimiter>,
}

impl ApiSession {
    /// Builds the session's HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidBaseUrl`] for an unparseable base URL and
    /// [`SourceError::ClientBuild`] when reqwest cannot build the client.
    #[instrument(skip(config), fields(api_base_url = %config.api_base_url))]
    pub fn new(config: SessionConfig) -> Result<Self, SourceError> {
        let base = config.api_base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base).map_err(|error| SourceError::InvalidBaseUrl {
            url: base.clone(),
            detail: error.to_string(),
        })?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(default_user_agent())
            .gzip(true)
            .build()
            .map_err(|error| SourceError::ClientBuild(error.to_string()))?;

        debug!(
            has_token = config.token.is_some(),
            api_delay_ms = config.api_delay.as_millis(),
            "created API session"
        );

        Ok(Self {
            client,
            api_base_url: base,
            token: config.token.map(Arc::from),
            api_limiter: Arc::new(RateLimiter::new(config.api_delay)),
        })
    }

    /// The pooled client, for page body fetches.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Absolute URL for an API path (`path` starts with `/`).
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    /// Paced, authenticated GET decoding a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] for transport failures, non-success statuses
    /// and undecodable bodies.
    #[instrument(skip(self, query), fields(url))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let mut url = self.endpoint(path);
        if !query.is_empty() {
            url = url::Url::parse_with_params(&url, query)
                .map_err(|error| SourceError::InvalidBaseUrl {
                    url: url.clone(),
                    detail: error.to_string(),
                })?
                .to_string();
        }
        tracing::Span::current().record("url", url.as_str());

        self.api_limiter.acquire(&url).await;

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| SourceError::transport(&url, error))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "API call failed");
            return Err(SourceError::from_status(url, status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| SourceError::transport(&url, error))?;
        serde_json::from_slice(&body).map_err(|error| SourceError::decode(url, error))
    }
}

fn default_user_agent() -> String {
    format!("mangabook/{}", env!("CARGO_PKG_VERSION"))
}
