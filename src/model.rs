//! Core data types shared by the reconciler, scheduler and driver.
//!
//! A [`ContentUnit`] is one fetchable page; a [`Group`] is the ordered set of
//! pages that share a destination (one volume). [`WorkItem`] and
//! [`FetchOutcome`] are ephemeral per-run values and are never persisted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size and digest a downloaded artifact is expected to have, when the remote knows them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedArtifact {
    /// Expected byte size.
    pub size: Option<u64>,
    /// Expected lowercase hex SHA-256 digest.
    pub sha256: Option<String>,
}

impl ExpectedArtifact {
    /// Returns true when neither size nor digest is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.sha256.is_none()
    }
}

/// An addressable piece of remote content (one page image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    /// Stable remote identifier, unique within a root.
    pub id: String,
    /// Canonical identifier of the owning group.
    pub group_id: String,
    /// Position within the group (0-based).
    pub ordinal: u32,
    /// Where the bytes are fetched from.
    pub url: String,
    /// Destination relative to the root's directory.
    pub relative_path: PathBuf,
    /// Size/digest when known.
    pub expected: ExpectedArtifact,
    /// Remote version token; a change means the content was replaced upstream.
    pub version: String,
}

/// An ordered collection of units forming one packaging unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub label: String,
    /// Unit identifiers in ordinal order.
    pub unit_ids: Vec<String>,
    pub complete: bool,
}

/// A group as enumerated from the root, before its units are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub id: String,
    pub label: String,
}

/// Root-level metadata (one manga series).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    pub id: String,
    pub title: String,
}

/// Fresh remote listing of one group and its units.
#[derive(Debug, Clone)]
pub struct RemoteListing {
    pub group: Group,
    pub units: Vec<ContentUnit>,
}

impl RemoteListing {
    /// Builds a listing, ordering units by ordinal and deriving the group's unit id list.
    #[must_use]
    pub fn new(group_id: impl Into<String>, label: impl Into<String>, mut units: Vec<ContentUnit>) -> Self {
        units.sort_by_key(|unit| unit.ordinal);
        let group = Group {
            id: group_id.into(),
            label: label.into(),
            unit_ids: units.iter().map(|unit| unit.id.clone()).collect(),
            complete: false,
        };
        Self { group, units }
    }

    /// Returns true when the remote reports no units for this group.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Why a unit was planned for fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkReason {
    /// No manifest entry exists.
    Missing,
    /// An entry exists but the local file failed validation.
    Invalid,
    /// The remote version token changed.
    Outdated,
    /// Overwrite was requested.
    Forced,
}

impl WorkReason {
    /// Returns the stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Outdated => "outdated",
            Self::Forced => "forced",
        }
    }
}

impl fmt::Display for WorkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned fetch.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub unit: ContentUnit,
    /// Absolute destination path.
    pub target: PathBuf,
    pub reason: WorkReason,
}

impl WorkItem {
    /// Creates a work item targeting `root_dir.join(unit.relative_path)`.
    #[must_use]
    pub fn new(unit: ContentUnit, root_dir: &Path, reason: WorkReason) -> Self {
        let target = root_dir.join(&unit.relative_path);
        Self {
            unit,
            target,
            reason,
        }
    }
}

/// Terminal status of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    /// Retries were exhausted on transient errors; a re-run may help.
    RetryableFailure,
    /// Authentication, not-found or local errors; needs intervention.
    FatalFailure,
    /// Never admitted or aborted because the run was cancelled.
    Cancelled,
}

impl OutcomeStatus {
    /// Returns the stable label used in logs and summaries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable-failure",
            Self::FatalFailure => "fatal-failure",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for either failure kind.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::RetryableFailure | Self::FatalFailure)
    }
}

/// Result of executing one [`WorkItem`].
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub unit_id: String,
    pub group_id: String,
    pub status: OutcomeStatus,
    /// Bytes written to the final path (0 unless successful).
    pub bytes: u64,
    pub elapsed: Duration,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Error detail for failures.
    pub error: Option<String>,
    /// Set when the failure was an authentication rejection.
    pub needs_auth: bool,
}

impl FetchOutcome {
    /// Successful fetch.
    #[must_use]
    pub fn success(item: &WorkItem, bytes: u64, elapsed: Duration, attempts: u32) -> Self {
        Self {
            unit_id: item.unit.id.clone(),
            group_id: item.unit.group_id.clone(),
            status: OutcomeStatus::Success,
            bytes,
            elapsed,
            attempts,
            error: None,
            needs_auth: false,
        }
    }

    /// Failed fetch with the given failure status.
    #[must_use]
    pub fn failure(
        item: &WorkItem,
        status: OutcomeStatus,
        error: impl Into<String>,
        elapsed: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            unit_id: item.unit.id.clone(),
            group_id: item.unit.group_id.clone(),
            status,
            bytes: 0,
            elapsed,
            attempts,
            error: Some(error.into()),
            needs_auth: false,
        }
    }

    /// Item that was never admitted or was aborted on cancellation.
    #[must_use]
    pub fn cancelled(item: &WorkItem) -> Self {
        Self {
            unit_id: item.unit.id.clone(),
            group_id: item.unit.group_id.clone(),
            status: OutcomeStatus::Cancelled,
            bytes: 0,
            elapsed: Duration::ZERO,
            attempts: 0,
            error: Some("run cancelled".to_string()),
            needs_auth: false,
        }
    }

    /// Marks this outcome as an authentication rejection.
    #[must_use]
    pub fn with_needs_auth(mut self, needs_auth: bool) -> Self {
        self.needs_auth = needs_auth;
        self
    }

    /// Number of retries beyond the first attempt.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
