//! Keep/refetch planning for one group against a fresh remote listing.
//!
//! Per unit, in order: no manifest entry is `missing`; an entry that is not
//! `downloaded` or whose file fails validation is `invalid`; a valid entry
//! with a different version token is `outdated`; anything else is kept.
//! Units absent from the listing are never touched.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, instrument};

use crate::manifest::{EntryStatus, Manifest};
use crate::model::{ContentUnit, RemoteListing, WorkItem, WorkReason};
use crate::validate::Validator;

/// Reconciliation switches, read-only for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Refetch every unit regardless of local state.
    pub force_overwrite: bool,
    /// Trust valid local artifacts. When false, kept units are refetched as `invalid`.
    pub check_local: bool,
    /// An outdated unit in a previously complete group refetches the whole group.
    pub whole_group_refresh: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            force_overwrite: false,
            check_local: true,
            whole_group_refresh: true,
        }
    }
}

/// Result of reconciling one group.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Units whose local artifact is trusted as-is.
    pub keep: Vec<ContentUnit>,
    /// Units to fetch, with their reasons.
    pub refetch: Vec<WorkItem>,
}

impl ReconcilePlan {
    /// True when nothing needs fetching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refetch.is_empty()
    }

    /// Number of planned items with the given reason.
    #[must_use]
    pub fn count(&self, reason: WorkReason) -> usize {
        self.refetch
            .iter()
            .filter(|item| item.reason == reason)
            .count()
    }

    /// Planned item counts keyed by reason.
    #[must_use]
    pub fn reasons(&self) -> HashMap<WorkReason, usize> {
        let mut counts = HashMap::new();
        for item in &self.refetch {
            *counts.entry(item.reason).or_insert(0) += 1;
        }
        counts
    }
}

/// Decides which units of `listing` must be fetched into `root_dir`.
#[must_use]
#[instrument(skip_all, fields(group_id = %listing.group.id, units = listing.units.len()))]
pub fn plan(
    listing: &RemoteListing,
    manifest: &Manifest,
    root_dir: &Path,
    validator: &Validator,
    policy: &ReconcilePolicy,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    if policy.force_overwrite {
        plan.refetch = listing
            .units
            .iter()
            .map(|unit| WorkItem::new(unit.clone(), root_dir, WorkReason::Forced))
            .collect();
        debug!(refetch = plan.refetch.len(), "forced overwrite");
        return plan;
    }

    for unit in &listing.units {
        match classify(unit, manifest, root_dir, validator, policy) {
            Some(reason) => plan
                .refetch
                .push(WorkItem::new(unit.clone(), root_dir, reason)),
            None => plan.keep.push(unit.clone()),
        }
    }

    let any_outdated = plan.count(WorkReason::Outdated) > 0;
    if policy.whole_group_refresh
        && any_outdated
        && manifest.group_complete(&listing.group.id)
        && !plan.keep.is_empty()
    {
        debug!(
            kept = plan.keep.len(),
            "stale unit in complete group, refreshing whole group"
        );
        for unit in std::mem::take(&mut plan.keep) {
            plan.refetch
                .push(WorkItem::new(unit, root_dir, WorkReason::Outdated));
        }
        plan.refetch.sort_by_key(|item| item.unit.ordinal);
    }

    debug!(
        keep = plan.keep.len(),
        refetch = plan.refetch.len(),
        "reconciled group"
    );
    plan
}

fn classify(
    unit: &ContentUnit,
    manifest: &Manifest,
    root_dir: &Path,
    validator: &Validator,
    policy: &ReconcilePolicy,
) -> Option<WorkReason> {
    let Some(entry) = manifest.entry(&unit.id) else {
        return Some(WorkReason::Missing);
    };

    if entry.status != EntryStatus::Downloaded || !policy.check_local {
        return Some(WorkReason::Invalid);
    }

    let expected = (!unit.expected.is_empty()).then_some(&unit.expected);
    if !validator.is_valid(&root_dir.join(&unit.relative_path), expected) {
        return Some(WorkReason::Invalid);
    }

    if entry.remote_version != unit.version {
        return Some(WorkReason::Outdated);
    }

    None
}
