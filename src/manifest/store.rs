use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::{DEFAULT_RETENTION_DAYS, EntryStatus, Manifest, ManifestDocument, ManifestError};
use crate::paths::sanitize_filename;

/// Subdirectory of the state dir holding one JSON file per root.
const MANIFESTS_DIR_NAME: &str = "manifests";

/// Loads and saves manifests under a state directory.
///
/// Saves write a sibling temp file, sync it, then rename over the target, so
/// a crash mid-write leaves the previous manifest intact.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
    retention_days: u32,
}

impl ManifestStore {
    /// Creates a store rooted at `state_dir` with the default retention.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(MANIFESTS_DIR_NAME),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    /// Overrides the retention horizon applied on save (0 disables pruning).
    #[must_use]
    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }

    #[must_use]
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Directory holding the manifest files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic manifest path for a root id.
    ///
    /// The readable prefix is lossy, so a digest of the raw id keeps ids that
    /// sanitize alike (`a/b`, `a_b`) in separate files.
    #[must_use]
    pub fn path_for(&self, root_id: &str) -> PathBuf {
        let digest = Sha256::digest(root_id.as_bytes());
        let tag: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
        self.dir
            .join(format!("{}-{tag}.json", sanitize_filename(root_id)))
    }

    /// Loads the manifest for `root_id`.
    ///
    /// A missing file yields an empty manifest. An unreadable or corrupt file
    /// is logged, moved aside to `<name>.json.corrupt`, and also yields an
    /// empty manifest.
    #[instrument(skip(self), fields(path))]
    pub async fn load(&self, root_id: &str) -> Manifest {
        let path = self.path_for(root_id);
        tracing::Span::current().record("path", tracing::field::display(path.display()));

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no manifest on disk, starting empty");
                return Manifest::new(root_id);
            }
            Err(error) => {
                warn!(error = %error, "manifest unreadable, starting empty");
                return Manifest::new(root_id);
            }
        };

        let document = match serde_json::from_slice::<ManifestDocument>(&raw) {
            Ok(document) => document,
            Err(error) => {
                warn!(error = %error, "manifest corrupt, starting empty");
                quarantine(&path).await;
                return Manifest::new(root_id);
            }
        };

        if document.root_id != root_id {
            // Someone else's valid manifest; leave it where it is.
            warn!(
                expected = root_id,
                found = %document.root_id,
                "manifest belongs to a different root, starting empty"
            );
            return Manifest::new(root_id);
        }

        let manifest = Manifest::from_document(document);
        debug!(
            entries = manifest.len(),
            downloaded = manifest.count_by_status(EntryStatus::Downloaded),
            "loaded manifest"
        );
        manifest
    }

    /// Loads every manifest in the store, ordered by root id.
    ///
    /// Unreadable or corrupt files are skipped with a warning and left in
    /// place; [`load`](Self::load) deals with them for their own root.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn load_all(&self) -> Vec<Manifest> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no manifest directory yet");
                return Vec::new();
            }
            Err(error) => {
                warn!(error = %error, "manifest directory unreadable");
                return Vec::new();
            }
        };

        let mut manifests = Vec::new();
        loop {
            let path = match dir.next_entry().await {
                Ok(Some(entry)) => entry.path(),
                Ok(None) => break,
                Err(error) => {
                    warn!(error = %error, "stopped listing manifests");
                    break;
                }
            };
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping unreadable manifest");
                    continue;
                }
            };
            match serde_json::from_slice::<ManifestDocument>(&raw) {
                Ok(document) => manifests.push(Manifest::from_document(document)),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping corrupt manifest");
                }
            }
        }

        manifests.sort_by(|a, b| a.root_id().cmp(b.root_id()));
        debug!(manifests = manifests.len(), "loaded library manifests");
        manifests
    }

    /// Prunes expired entries, then atomically persists the manifest.
    ///
    /// Nothing is written for a root that has never had a successful fetch
    /// and has no manifest on disk yet.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if serialization or any filesystem step fails.
    #[instrument(skip(self, manifest), fields(root_id = %manifest.root_id()))]
    pub async fn save(&self, manifest: &mut Manifest) -> Result<(), ManifestError> {
        let root_id = manifest.root_id().to_string();
        let taken = std::mem::replace(manifest, Manifest::new(root_id));
        *manifest = taken.pruned_at(self.retention_days, chrono::Utc::now());

        let path = self.path_for(manifest.root_id());
        if manifest.count_by_status(EntryStatus::Downloaded) == 0
            && !tokio::fs::try_exists(&path).await.unwrap_or(false)
        {
            debug!("no successful fetch recorded yet, manifest not created");
            return Ok(());
        }

        let data = serde_json::to_vec_pretty(&manifest.to_document()).map_err(|source| {
            ManifestError::Serialize {
                root_id: manifest.root_id().to_string(),
                source,
            }
        })?;

        write_atomic(&path, &data).await?;
        info!(
            path = %path.display(),
            entries = manifest.len(),
            "manifest saved"
        );
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ManifestError> {
    let parent = path
        .parent()
        .ok_or_else(|| ManifestError::io(path, std::io::Error::other("path has no parent")))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| ManifestError::io(parent, e))?;

    let tmp_path = path.with_extension(format!(
        "json.tmp.{}.{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| ManifestError::io(&tmp_path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| ManifestError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| ManifestError::io(&tmp_path, e))?;
        drop(file);
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ManifestError::io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn quarantine(path: &Path) {
    let aside = path.with_extension("json.corrupt");
    if let Err(error) = tokio::fs::rename(path, &aside).await {
        warn!(error = %error, path = %path.display(), "could not move corrupt manifest aside");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::manifest::ManifestEntry;

    fn downloaded(unit_id: &str) -> ManifestEntry {
        ManifestEntry {
            unit_id: unit_id.to_string(),
            group_id: "1".to_string(),
            local_path: PathBuf::from(format!("volume_1/{unit_id}.png")),
            downloaded_at: Utc::now(),
            remote_version: "hash/1.png".to_string(),
            status: EntryStatus::Downloaded,
            retries: 1,
        }
    }

    #[tokio::test]
    async fn test_load_missing_returns_empty() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let manifest = store.load("abc").await;
        assert_eq!(manifest.root_id(), "abc");
        assert!(manifest.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut manifest = Manifest::new("abc");
        manifest.upsert(downloaded("u1"));
        manifest.set_group_complete("1", true);

        store.save(&mut manifest).await.unwrap();
        let loaded = store.load("abc").await;

        assert_eq!(loaded, manifest);
        assert!(store.path_for("abc").exists());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut manifest = Manifest::new("abc");
        manifest.upsert(downloaded("u1"));
        store.save(&mut manifest).await.unwrap();
        store.save(&mut manifest).await.unwrap();

        let names: Vec<PathBuf> = std::fs::read_dir(dir.path().join("manifests"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(names, vec![store.path_for("abc")]);
    }

    #[tokio::test]
    async fn test_save_without_success_does_not_create_file() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut manifest = Manifest::new("abc");
        let mut failed = downloaded("u1");
        failed.status = EntryStatus::Failed;
        manifest.upsert(failed);

        store.save(&mut manifest).await.unwrap();
        assert!(!store.path_for("abc").exists());
    }

    #[tokio::test]
    async fn test_save_prunes_expired_entries() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path()).with_retention_days(7);
        let mut manifest = Manifest::new("abc");
        let mut old = downloaded("old");
        old.downloaded_at = Utc::now() - ChronoDuration::days(8);
        manifest.upsert(old);
        manifest.upsert(downloaded("new"));

        store.save(&mut manifest).await.unwrap();

        assert!(manifest.entry("old").is_none());
        let loaded = store.load("abc").await;
        assert!(loaded.entry("old").is_none());
        assert!(loaded.entry("new").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_treated_as_empty_and_moved_aside() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let path = store.path_for("abc");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let manifest = store.load("abc").await;

        assert!(manifest.is_empty());
        assert!(!path.exists());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_manifest_for_other_root_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut other = Manifest::new("other");
        other.upsert(downloaded("u1"));
        store.save(&mut other).await.unwrap();
        std::fs::rename(store.path_for("other"), store.path_for("abc")).unwrap();

        let manifest = store.load("abc").await;
        assert!(manifest.is_empty());
        // the other root's manifest is not quarantined
        let moved = store.path_for("abc");
        assert!(moved.exists());
        assert!(!moved.with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_load_all_lists_every_root_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load_all().await.is_empty());

        for root in ["zeta", "alpha"] {
            let mut manifest = Manifest::new(root);
            manifest.upsert(downloaded("u1"));
            store.save(&mut manifest).await.unwrap();
        }
        std::fs::write(store.dir().join("broken.json"), b"{ nope").unwrap();
        std::fs::write(store.dir().join("old.json.corrupt"), b"{}").unwrap();

        let manifests = store.load_all().await;

        let roots: Vec<&str> = manifests.iter().map(Manifest::root_id).collect();
        assert_eq!(roots, vec!["alpha", "zeta"]);
        assert!(store.dir().join("broken.json").exists());
    }

    #[test]
    fn test_path_for_sanitizes_root_id() {
        let store = ManifestStore::new(Path::new("/state"));
        let path = store.path_for("a/b");
        assert_eq!(path.parent().unwrap(), Path::new("/state/manifests"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("a_b-"), "{name}");
        assert!(name.ends_with(".json"));
        assert_eq!(store.path_for("a/b"), path);
    }

    #[tokio::test]
    async fn test_ids_that_sanitize_alike_keep_separate_manifests() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));

        let mut slashed = Manifest::new("a/b");
        slashed.upsert(downloaded("u1"));
        store.save(&mut slashed).await.unwrap();
        let mut underscored = Manifest::new("a_b");
        underscored.upsert(downloaded("u2"));
        store.save(&mut underscored).await.unwrap();

        assert_eq!(store.load("a/b").await, slashed);
        assert_eq!(store.load("a_b").await, underscored);
    }
}
