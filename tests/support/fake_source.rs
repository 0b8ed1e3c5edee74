//! Scriptable in-memory `RemoteSource` for engine and scheduler tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use mangabook_core::{
    ContentUnit, ExpectedArtifact, FetchError, GroupRef, RemoteListing, RemoteSource, RootInfo,
    SourceError, UnitBody,
};

/// How a failing fetch fails.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Timeout,
    ServerError,
    Auth,
    NotFound,
}

impl Failure {
    fn into_error(self, url: &str) -> FetchError {
        match self {
            Self::Timeout => FetchError::timeout(url),
            Self::ServerError => FetchError::http_status(url, 503),
            Self::Auth => FetchError::auth_required(url, 401),
            Self::NotFound => FetchError::http_status(url, 404),
        }
    }
}

/// Scripted behaviour of one unit's fetches.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Ok,
    /// Sleep before answering.
    Delay(Duration),
    /// Fail the first `n` attempts, then succeed.
    FailTimes(u32, Failure),
    Always(Failure),
    /// Advertise more bytes than the stream delivers.
    Truncated,
    /// Deliver half the body, then never finish.
    Hang,
    /// Serve these bytes instead of the generated page.
    Serve(&'static [u8]),
    Panic,
}

/// How listing a group fails.
#[derive(Debug, Clone, Copy)]
pub enum ListFailure {
    Auth,
    Transport,
}

#[derive(Debug, Default)]
pub struct FakeSource {
    groups: Mutex<BTreeMap<String, Vec<ContentUnit>>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    list_failures: Mutex<HashMap<String, ListFailure>>,
    fetches: Mutex<HashMap<String, u32>>,
    total_fetches: AtomicUsize,
    interrupt_on_listing: Mutex<Option<Arc<AtomicBool>>>,
}

/// Deterministic, non-image page content.
#[must_use]
pub fn page_bytes(unit_id: &str) -> Vec<u8> {
    format!("page-content:{unit_id}:").repeat(8).into_bytes()
}

impl FakeSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group with `pages` units named `{group}-{page}`.
    #[must_use]
    pub fn with_group(self, group_id: &str, pages: u32) -> Self {
        let units = (1..=pages)
            .map(|page| ContentUnit {
                id: format!("{group_id}-{page}"),
                group_id: group_id.to_string(),
                ordinal: page - 1,
                url: format!("https://cdn.test/{group_id}/{page}.bin"),
                relative_path: PathBuf::from(format!("volume_{group_id}/{page:03}.bin")),
                expected: ExpectedArtifact::default(),
                version: "v1".to_string(),
            })
            .collect();
        self.groups
            .lock()
            .unwrap()
            .insert(group_id.to_string(), units);
        self
    }

    /// Overrides one unit's destination file name (e.g. to give it an image extension).
    pub fn set_relative_path(&self, unit_id: &str, relative_path: &str) {
        self.update_unit(unit_id, |unit| unit.relative_path = PathBuf::from(relative_path));
    }

    pub fn set_version(&self, unit_id: &str, version: &str) {
        self.update_unit(unit_id, |unit| unit.version = version.to_string());
    }

    fn update_unit(&self, unit_id: &str, update: impl FnOnce(&mut ContentUnit)) {
        let mut groups = self.groups.lock().unwrap();
        let unit = groups
            .values_mut()
            .flat_map(|units| units.iter_mut())
            .find(|unit| unit.id == unit_id)
            .unwrap_or_else(|| panic!("unknown unit {unit_id}"));
        update(unit);
    }

    pub fn set_behavior(&self, unit_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), behavior);
    }

    pub fn fail_listing(&self, group_id: &str, failure: ListFailure) {
        self.list_failures
            .lock()
            .unwrap()
            .insert(group_id.to_string(), failure);
    }

    /// Raises `flag` whenever a group is listed, as if Ctrl-C arrived mid-listing.
    pub fn interrupt_on_listing(&self, flag: &Arc<AtomicBool>) {
        *self.interrupt_on_listing.lock().unwrap() = Some(Arc::clone(flag));
    }

    /// Fetch calls made for one unit.
    #[must_use]
    pub fn fetches(&self, unit_id: &str) -> u32 {
        self.fetches
            .lock()
            .unwrap()
            .get(unit_id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_fetches(&self) -> usize {
        self.total_fetches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn group_refs(&self) -> Vec<GroupRef> {
        self.groups
            .lock()
            .unwrap()
            .keys()
            .map(|id| GroupRef {
                id: id.clone(),
                label: format!("Volume {id}"),
            })
            .collect()
    }

    #[must_use]
    pub fn units(&self, group_id: &str) -> Vec<ContentUnit> {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn complete_body(bytes: Vec<u8>) -> UnitBody {
    let len = bytes.len() as u64;
    let (first, second) = bytes.split_at(bytes.len() / 2);
    UnitBody {
        content_length: Some(len),
        stream: stream::iter(vec![Ok(first.to_vec()), Ok(second.to_vec())]).boxed(),
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn describe_root(&self, root_id: &str) -> Result<RootInfo, SourceError> {
        Ok(RootInfo {
            id: root_id.to_string(),
            title: "Fake Series".to_string(),
        })
    }

    async fn list_groups(&self, _root_id: &str) -> Result<Vec<GroupRef>, SourceError> {
        Ok(self.group_refs())
    }

    async fn list_group(
        &self,
        root_id: &str,
        group_id: &str,
    ) -> Result<RemoteListing, SourceError> {
        if let Some(flag) = self.interrupt_on_listing.lock().unwrap().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
        let failure = self.list_failures.lock().unwrap().get(group_id).copied();
        let url = format!("https://api.test/{root_id}/{group_id}");
        match failure {
            Some(ListFailure::Auth) => return Err(SourceError::from_status(url, 401)),
            Some(ListFailure::Transport) => {
                return Err(SourceError::transport(url, "connection reset"));
            }
            None => {}
        }
        let units = self
            .groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or_else(|| SourceError::UnknownGroup {
                root_id: root_id.to_string(),
                group_id: group_id.to_string(),
            })?;
        Ok(RemoteListing::new(group_id, format!("Volume {group_id}"), units))
    }

    async fn fetch_unit(&self, unit: &ContentUnit) -> Result<UnitBody, FetchError> {
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(unit.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.total_fetches.fetch_add(1, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&unit.id)
            .copied()
            .unwrap_or(Behavior::Ok);
        let bytes = page_bytes(&unit.id);

        match behavior {
            Behavior::Ok => Ok(complete_body(bytes)),
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(complete_body(bytes))
            }
            Behavior::FailTimes(failures, failure) if attempt <= failures => {
                Err(failure.into_error(&unit.url))
            }
            Behavior::FailTimes(..) => Ok(complete_body(bytes)),
            Behavior::Always(failure) => Err(failure.into_error(&unit.url)),
            Behavior::Truncated => Ok(UnitBody {
                content_length: Some(bytes.len() as u64 + 16),
                stream: stream::iter(vec![Ok(bytes)]).boxed(),
            }),
            Behavior::Hang => {
                let len = bytes.len() as u64;
                let first = bytes[..bytes.len() / 2].to_vec();
                Ok(UnitBody {
                    content_length: Some(len),
                    stream: stream::iter(vec![Ok(first)])
                        .chain(stream::pending::<Result<Vec<u8>, FetchError>>())
                        .boxed(),
                })
            }
            Behavior::Serve(bytes) => Ok(complete_body(bytes.to_vec())),
            Behavior::Panic => panic!("scripted panic fetching {}", unit.id),
        }
    }
}
