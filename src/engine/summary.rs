//! Per-group states and the run summary.

use std::fmt;

use crate::model::{FetchOutcome, OutcomeStatus};

/// Lifecycle of one group within a run.
///
/// `NotStarted → Planning → Fetching → Reconciled → Complete | PartiallyFailed`,
/// with `Planning → Complete` when nothing needs fetching and `Unavailable`
/// when the group could not be listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    NotStarted,
    Planning,
    Fetching,
    Reconciled,
    Complete,
    PartiallyFailed,
    Unavailable,
}

impl GroupState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Planning => "planning",
            Self::Fetching => "fetching",
            Self::Reconciled => "reconciled",
            Self::Complete => "complete",
            Self::PartiallyFailed => "partially-failed",
            Self::Unavailable => "unavailable",
        }
    }

    /// True once no further transition happens in this run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::PartiallyFailed | Self::Unavailable
        )
    }

    /// Checks a transition against the state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Planning)
                | (Self::Planning, Self::Fetching | Self::Complete | Self::Unavailable)
                | (Self::Fetching, Self::Reconciled)
                | (Self::Reconciled, Self::Complete | Self::PartiallyFailed)
        )
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group_id: String,
    pub label: String,
    pub state: GroupState,
    /// Units fetched in this run.
    pub downloaded: usize,
    /// Units whose valid local artifact was kept.
    pub skipped_valid: usize,
    /// Units that exhausted retries on transient errors.
    pub failed_retryable: usize,
    /// Units that failed on auth, not-found or local errors.
    pub failed_fatal: usize,
    pub cancelled: usize,
    /// Retry attempts beyond first attempts.
    pub retried: usize,
    pub bytes: u64,
    /// At least one failure was an authentication rejection.
    pub needs_auth: bool,
    /// Listing error for `Unavailable` groups.
    pub error: Option<String>,
}

impl GroupReport {
    #[must_use]
    pub fn new(group_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            label: label.into(),
            state: GroupState::NotStarted,
            downloaded: 0,
            skipped_valid: 0,
            failed_retryable: 0,
            failed_fatal: 0,
            cancelled: 0,
            retried: 0,
            bytes: 0,
            needs_auth: false,
            error: None,
        }
    }

    /// Moves to `next`, ignoring transitions the state machine does not allow.
    pub(crate) fn transition(&mut self, next: GroupState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            tracing::debug!(
                group_id = %self.group_id,
                from = %self.state,
                to = %next,
                "ignored invalid group transition"
            );
        }
    }

    pub(crate) fn record(&mut self, outcome: &FetchOutcome) {
        self.retried += outcome.retries() as usize;
        match outcome.status {
            OutcomeStatus::Success => {
                self.downloaded += 1;
                self.bytes += outcome.bytes;
            }
            OutcomeStatus::RetryableFailure => self.failed_retryable += 1,
            OutcomeStatus::FatalFailure => self.failed_fatal += 1,
            OutcomeStatus::Cancelled => self.cancelled += 1,
        }
        self.needs_auth |= outcome.needs_auth;
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed_retryable + self.failed_fatal
    }
}

/// Result of one orchestrated run over a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub root_id: String,
    pub groups: Vec<GroupReport>,
    /// The run stopped early on an interrupt.
    pub interrupted: bool,
}

impl RunSummary {
    #[must_use]
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            groups: Vec::new(),
            interrupted: false,
        }
    }

    fn total(&self, field: impl Fn(&GroupReport) -> usize) -> usize {
        self.groups.iter().map(field).sum()
    }

    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.total(|g| g.downloaded)
    }

    #[must_use]
    pub fn skipped_valid(&self) -> usize {
        self.total(|g| g.skipped_valid)
    }

    #[must_use]
    pub fn failed_retryable(&self) -> usize {
        self.total(|g| g.failed_retryable)
    }

    #[must_use]
    pub fn failed_fatal(&self) -> usize {
        self.total(|g| g.failed_fatal)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed_retryable() + self.failed_fatal()
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.total(|g| g.cancelled)
    }

    #[must_use]
    pub fn retried(&self) -> usize {
        self.total(|g| g.retried)
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.groups.iter().map(|g| g.bytes).sum()
    }

    /// Groups that could not be listed.
    #[must_use]
    pub fn unavailable(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.state == GroupState::Unavailable)
            .count()
    }

    /// Groups that ended `Complete`.
    #[must_use]
    pub fn complete_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.state == GroupState::Complete)
            .count()
    }

    /// Any failure was an authentication rejection; re-authenticating is needed.
    #[must_use]
    pub fn needs_reauth(&self) -> bool {
        self.groups.iter().any(|g| g.needs_auth)
    }

    /// Every group is complete and the run was not interrupted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.groups.iter().all(|g| g.state == GroupState::Complete)
    }

    #[must_use]
    pub fn group(&self, group_id: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}
