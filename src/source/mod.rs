//! Remote source adapters.
//!
//! The engine talks to the remote only through [`RemoteSource`]:
//!
//! - [`RemoteSource::describe_root`] - title and id of a series
//! - [`RemoteSource::list_groups`] - its volumes, with the ungrouped sentinel normalised
//! - [`RemoteSource::list_group`] - the ordered pages of one volume
//! - [`RemoteSource::fetch_unit`] - a streaming body for one page
//!
//! Adapters never retry; retry and backoff live in the scheduler so every
//! attempt is counted and paced in one place.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mangabook_core::source::{ApiSession, MangaDexSource, RemoteSource, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(ApiSession::new(SessionConfig::default().with_env_token())?);
//! let source = MangaDexSource::new(session).with_language("en");
//! for group in source.list_groups("a1c7c817-4e59-43b7-9365-09675a149a6f").await? {
//!     println!("{} ({})", group.label, group.id);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod mangadex;
mod session;

pub use error::SourceError;
pub use mangadex::{MangaDexSource, normalize_group_id};
pub use session::{API_TOKEN_ENV, ApiSession, DEFAULT_API_BASE_URL, SessionConfig};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::download::FetchError;
use crate::model::{ContentUnit, GroupRef, RemoteListing, RootInfo};

/// A page body as it arrives from the remote.
pub struct UnitBody {
    /// Advertised length, when the server sent one.
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Vec<u8>, FetchError>>,
}

impl std::fmt::Debug for UnitBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Enumerates and fetches content units from a remote.
///
/// Implementations must be shareable across fetch tasks (`Send + Sync`) and
/// must not retry internally.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Returns root-level metadata.
    async fn describe_root(&self, root_id: &str) -> Result<RootInfo, SourceError>;

    /// Lists the root's groups in reading order.
    ///
    /// Variant spellings of the ungrouped sentinel are collapsed to `"0"`.
    async fn list_groups(&self, root_id: &str) -> Result<Vec<GroupRef>, SourceError>;

    /// Lists one group's units in ordinal order.
    async fn list_group(&self, root_id: &str, group_id: &str)
    -> Result<RemoteListing, SourceError>;

    /// Opens a streaming body for one unit.
    async fn fetch_unit(&self, unit: &ContentUnit) -> Result<UnitBody, FetchError>;
}
