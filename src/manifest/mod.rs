//! Durable per-series record of what has been fetched.
//!
//! A [`Manifest`] holds exactly one [`ManifestEntry`] per content unit id and
//! one [`GroupRecord`] per group. Entries are only ever inserted or
//! overwritten. [`ManifestStore`] persists manifests as JSON with atomic
//! replace semantics and prunes expired entries before every save.

mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use store::ManifestStore;

/// On-disk format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Entries older than this many days are dropped on save.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Errors raised while persisting a manifest.
///
/// Read-side problems never surface here: a missing or corrupt manifest is
/// recovered as an empty one.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Filesystem failure while writing or renaming.
    #[error("manifest IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization failure.
    #[error("failed to serialize manifest for {root_id}: {source}")]
    Serialize {
        root_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ManifestError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Lifecycle state of a single unit's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Downloaded,
    Failed,
    Invalid,
}

impl EntryStatus {
    /// Returns the stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
            Self::Invalid => "invalid",
        }
    }
}

/// One row per content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub unit_id: String,
    pub group_id: String,
    /// Path relative to the series directory.
    pub local_path: PathBuf,
    /// Time of the last fetch attempt that produced this row.
    pub downloaded_at: DateTime<Utc>,
    /// Version token as last seen remotely.
    pub remote_version: String,
    pub status: EntryStatus,
    pub retries: u32,
}

/// Completeness flag for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub group_id: String,
    pub complete: bool,
}

/// Serialized shape of a manifest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default = "default_format_version")]
    version: u32,
    root_id: String,
    #[serde(default)]
    entries: Vec<ManifestEntry>,
    #[serde(default)]
    groups: Vec<GroupRecord>,
}

fn default_format_version() -> u32 {
    MANIFEST_FORMAT_VERSION
}

/// In-memory manifest for one root content id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    root_id: String,
    entries: BTreeMap<String, ManifestEntry>,
    groups: BTreeMap<String, GroupRecord>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            entries: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Looks up the entry for a unit.
    #[must_use]
    pub fn entry(&self, unit_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(unit_id)
    }

    /// Inserts or replaces the entry keyed by `entry.unit_id`.
    pub fn upsert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.unit_id.clone(), entry);
    }

    /// Demotes a `downloaded` entry to `invalid`, keeping its version and
    /// timestamp. Returns whether the entry changed.
    pub fn mark_invalid(&mut self, unit_id: &str) -> bool {
        match self.entries.get_mut(unit_id) {
            Some(entry) if entry.status == EntryStatus::Downloaded => {
                entry.status = EntryStatus::Invalid;
                true
            }
            _ => false,
        }
    }

    /// All entries ordered by unit id.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// Entries belonging to one group.
    pub fn entries_for_group<'a>(
        &'a self,
        group_id: &'a str,
    ) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| entry.group_id == group_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.groups.is_empty()
    }

    /// Number of entries with the given status.
    #[must_use]
    pub fn count_by_status(&self, status: EntryStatus) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Most recent entry timestamp, if any entry exists.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|entry| entry.downloaded_at).max()
    }

    /// Whether the group was recorded complete.
    #[must_use]
    pub fn group_complete(&self, group_id: &str) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|record| record.complete)
    }

    /// Records a group's completeness flag.
    pub fn set_group_complete(&mut self, group_id: &str, complete: bool) {
        self.groups.insert(
            group_id.to_string(),
            GroupRecord {
                group_id: group_id.to_string(),
                complete,
            },
        );
    }

    /// All group records ordered by group id.
    pub fn groups(&self) -> impl Iterator<Item = &GroupRecord> {
        self.groups.values()
    }

    /// Drops entries downloaded before `now - retention_days`.
    ///
    /// Groups that lose an entry are marked incomplete; group records left
    /// with no entries are dropped. A retention of 0 disables pruning.
    #[must_use]
    pub fn pruned_at(mut self, retention_days: u32, now: DateTime<Utc>) -> Self {
        if retention_days == 0 {
            return self;
        }
        let horizon = now - ChronoDuration::days(i64::from(retention_days));

        let mut touched_groups = Vec::new();
        self.entries.retain(|_, entry| {
            let keep = entry.downloaded_at >= horizon;
            if !keep {
                touched_groups.push(entry.group_id.clone());
            }
            keep
        });

        if touched_groups.is_empty() {
            return self;
        }

        debug!(
            root_id = %self.root_id,
            pruned = touched_groups.len(),
            retention_days,
            "pruned expired manifest entries"
        );

        for group_id in touched_groups {
            if let Some(record) = self.groups.get_mut(&group_id) {
                record.complete = false;
            }
        }
        let entries = &self.entries;
        self.groups
            .retain(|group_id, _| entries.values().any(|entry| &entry.group_id == group_id));
        self
    }

    fn into_document(self) -> ManifestDocument {
        ManifestDocument {
            version: MANIFEST_FORMAT_VERSION,
            root_id: self.root_id,
            entries: self.entries.into_values().collect(),
            groups: self.groups.into_values().collect(),
        }
    }

    fn to_document(&self) -> ManifestDocument {
        self.clone().into_document()
    }

    fn from_document(document: ManifestDocument) -> Self {
        let mut manifest = Self::new(document.root_id);
        // Later duplicates overwrite earlier ones.
        for entry in document.entries {
            manifest.upsert(entry);
        }
        for record in document.groups {
            manifest.groups.insert(record.group_id.clone(), record);
        }
        manifest
    }
}

/// Prunes a manifest against the current time.
#[must_use]
pub fn prune(manifest: Manifest, retention_days: u32) -> Manifest {
    manifest.pruned_at(retention_days, Utc::now())
}
