//! MangaDex adapter.
//!
//! Volumes map to groups and chapter pages map to units. Listing a volume
//! calls the at-home endpoint once per chapter; the aggregate listing is
//! cached per root for the adapter's lifetime.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{ApiSession, RemoteSource, SourceError, UnitBody};
use crate::download::FetchError;
use crate::model::{ContentUnit, ExpectedArtifact, GroupRef, RemoteListing, RootInfo};
use crate::paths::{chapter_dir_name, page_extension_from_url, page_file_name, volume_dir_name};

/// Canonical id of the "no volume" group.
pub const UNGROUPED_ID: &str = "0";

/// Collapses the remote's spellings of "no volume" (`none`, empty, `0`) to `"0"`.
///
/// ```
/// use mangabook_core::source::normalize_group_id;
///
/// assert_eq!(normalize_group_id("none"), "0");
/// assert_eq!(normalize_group_id(" 3 "), "3");
/// ```
#[must_use]
pub fn normalize_group_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") || trimmed == UNGROUPED_ID {
        UNGROUPED_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

fn group_label(group_id: &str) -> String {
    if group_id == UNGROUPED_ID {
        "No volume".to_string()
    } else {
        format!("Volume {group_id}")
    }
}

/// Numeric order first, then non-numeric, with the ungrouped id last.
fn compare_numbers(a: &str, b: &str) -> Ordering {
    let key = |value: &str| {
        if value == UNGROUPED_ID {
            (2, 0.0)
        } else {
            value.parse::<f64>().map_or((1, 0.0), |n| (0, n))
        }
    };
    let (rank_a, num_a) = key(a);
    let (rank_b, num_b) = key(b);
    rank_a
        .cmp(&rank_b)
        .then(num_a.total_cmp(&num_b))
        .then_with(|| a.cmp(b))
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct MangaResponse {
    data: MangaData,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
}

#[derive(Debug, Deserialize)]
struct MangaAttributes {
    #[serde(default)]
    title: BTreeMap<String, String>,
}

/// The API sends `{}` maps, but `[]` when a level is empty.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MapOrList<T> {
    Map(BTreeMap<String, T>),
    List(Vec<T>),
}

impl<T> MapOrList<T> {
    fn into_values(self) -> Vec<T> {
        match self {
            Self::Map(map) => map.into_values().collect(),
            Self::List(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    volumes: MapOrList<AggregateVolume>,
}

#[derive(Debug, Deserialize)]
struct AggregateVolume {
    volume: String,
    chapters: MapOrList<AggregateChapter>,
}

#[derive(Debug, Clone, Deserialize)]
struct AggregateChapter {
    chapter: String,
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeResponse {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeChapter {
    hash: String,
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    data_saver: Vec<String>,
}

/// One volume of the aggregate listing, chapters in reading order.
#[derive(Debug, Clone)]
struct VolumeListing {
    id: String,
    chapters: Vec<AggregateChapter>,
}

/// [`RemoteSource`] backed by the MangaDex REST API.
#[derive(Debug)]
pub struct MangaDexSource {
    session: Arc<ApiSession>,
    language: Option<String>,
    data_saver: bool,
    aggregates: DashMap<String, Arc<Vec<VolumeListing>>>,
}

impl MangaDexSource {
    #[must_use]
    pub fn new(session: Arc<ApiSession>) -> Self {
        Self {
            session,
            language: None,
            data_saver: false,
            aggregates: DashMap::new(),
        }
    }

    /// Restricts chapters to one translated language (e.g. `en`).
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        self.language = (!language.trim().is_empty()).then_some(language);
        self
    }

    /// Fetches the compressed `data-saver` renditions instead of originals.
    #[must_use]
    pub fn with_data_saver(mut self, data_saver: bool) -> Self {
        self.data_saver = data_saver;
        self
    }

    async fn volumes(&self, root_id: &str) -> Result<Arc<Vec<VolumeListing>>, SourceError> {
        if let Some(cached) = self.aggregates.get(root_id) {
            return Ok(Arc::clone(cached.value()));
        }

        let path = format!("/manga/{root_id}/aggregate");
        let query: Vec<(&str, &str)> = self
            .language
            .as_deref()
            .map(|language| vec![("translatedLanguage[]", language)])
            .unwrap_or_default();
        let response: AggregateResponse = self.session.get_json(&path, &query).await?;

        // merge variant spellings of the ungrouped volume
        let mut merged: BTreeMap<String, Vec<AggregateChapter>> = BTreeMap::new();
        for volume in response.volumes.into_values() {
            merged
                .entry(normalize_group_id(&volume.volume))
                .or_default()
                .extend(volume.chapters.into_values());
        }

        let mut volumes: Vec<VolumeListing> = merged
            .into_iter()
            .map(|(id, mut chapters)| {
                chapters.sort_by(|a, b| compare_numbers(&a.chapter, &b.chapter));
                chapters.dedup_by(|a, b| a.id == b.id);
                VolumeListing { id, chapters }
            })
            .collect();
        volumes.sort_by(|a, b| compare_numbers(&a.id, &b.id));

        let volumes = Arc::new(volumes);
        self.aggregates
            .insert(root_id.to_string(), Arc::clone(&volumes));
        Ok(volumes)
    }

    /// Lists the pages of one chapter, numbering ordinals from `first_ordinal`.
    async fn chapter_units(
        &self,
        group_id: &str,
        chapter: &AggregateChapter,
        first_ordinal: u32,
    ) -> Result<Vec<ContentUnit>, SourceError> {
        let path = format!("/at-home/server/{}", chapter.id);
        let response: AtHomeResponse = self.session.get_json(&path, &[]).await?;

        let (quality, files) = if self.data_saver {
            ("data-saver", response.chapter.data_saver)
        } else {
            ("data", response.chapter.data)
        };
        let base_url = response.base_url.trim_end_matches('/');
        let hash = response.chapter.hash;
        let chapter_dir = PathBuf::from(volume_dir_name(group_id)).join(chapter_dir_name(&chapter.chapter));

        let mut units = Vec::with_capacity(files.len());
        for (index, filename) in files.into_iter().enumerate() {
            let page = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let url = format!("{base_url}/{quality}/{hash}/{filename}");
            let extension = page_extension_from_url(&url);
            units.push(ContentUnit {
                id: format!("{}:{page}", chapter.id),
                group_id: group_id.to_string(),
                ordinal: first_ordinal.saturating_add(page - 1),
                relative_path: chapter_dir.join(page_file_name(page, extension)),
                url,
                expected: ExpectedArtifact::default(),
                version: format!("{hash}/{filename}"),
            });
        }
        Ok(units)
    }
}

#[async_trait]
impl RemoteSource for MangaDexSource {
    #[instrument(skip(self))]
    async fn describe_root(&self, root_id: &str) -> Result<RootInfo, SourceError> {
        let response: MangaResponse = self
            .session
            .get_json(&format!("/manga/{root_id}"), &[])
            .await?;
        let mut titles = response.data.attributes.title;
        let title = titles
            .remove("en")
            .or_else(|| titles.into_values().next())
            .unwrap_or_else(|| response.data.id.clone());
        debug!(%title, "described root");
        Ok(RootInfo {
            id: response.data.id,
            title,
        })
    }

    #[instrument(skip(self))]
    async fn list_groups(&self, root_id: &str) -> Result<Vec<GroupRef>, SourceError> {
        let volumes = self.volumes(root_id).await?;
        Ok(volumes
            .iter()
            .map(|volume| GroupRef {
                id: volume.id.clone(),
                label: group_label(&volume.id),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_group(
        &self,
        root_id: &str,
        group_id: &str,
    ) -> Result<RemoteListing, SourceError> {
        let group_id = normalize_group_id(group_id);
        let volumes = self.volumes(root_id).await?;
        let volume = volumes
            .iter()
            .find(|volume| volume.id == group_id)
            .ok_or_else(|| SourceError::UnknownGroup {
                root_id: root_id.to_string(),
                group_id: group_id.clone(),
            })?;

        let mut units = Vec::new();
        for chapter in &volume.chapters {
            let first_ordinal = u32::try_from(units.len()).unwrap_or(u32::MAX);
            match self.chapter_units(&group_id, chapter, first_ordinal).await {
                Ok(chapter_units) => units.extend(chapter_units),
                // externally hosted chapters have no at-home server
                Err(SourceError::NotFound { url }) => {
                    warn!(chapter = %chapter.chapter, %url, "chapter has no pages, skipping");
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            group_id = %group_id,
            chapters = volume.chapters.len(),
            units = units.len(),
            "listed group"
        );
        Ok(RemoteListing::new(group_id.clone(), group_label(&group_id), units))
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id))]
    async fn fetch_unit(&self, unit: &ContentUnit) -> Result<UnitBody, FetchError> {
        url::Url::parse(&unit.url).map_err(|_| FetchError::invalid_url(&unit.url))?;

        let response = self
            .session
            .client()
            .get(&unit.url)
            .send()
            .await
            .map_err(|error| FetchError::from_reqwest(&unit.url, &error))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if matches!(code, 401 | 403 | 407) {
                return Err(FetchError::auth_required(&unit.url, code));
            }
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Err(FetchError::http_status_with_retry_after(
                &unit.url,
                code,
                retry_after,
            ));
        }

        let content_length = response.content_length();
        let url = unit.url.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| FetchError::stream(&url, error))
            })
            .boxed();

        Ok(UnitBody {
            content_length,
            stream,
        })
    }
}
