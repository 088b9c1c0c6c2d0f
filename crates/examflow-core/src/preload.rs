//! Media preload manager.
//!
//! Keeps one record per URL no matter how many groups reference it. A URL is
//! fetched at most once at a time: later callers share the in-flight load.
//! Failed loads stay failed until a caller explicitly asks for a reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::MediaLoadError;
use crate::model::{MediaAsset, MediaKind};
use crate::traits::{FetchedMedia, MediaFetcher};

/// Upper bound on a single fetch.
pub const DEFAULT_PRELOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Externally visible state of a preload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStatus {
    Pending,
    Loading,
    Loaded,
    Error,
}

/// A loaded resource ready for playback or display.
#[derive(Debug)]
pub struct PreloadedMedia {
    id: Uuid,
    url: String,
    kind: MediaKind,
    content_type: Option<String>,
    bytes: Arc<[u8]>,
    revoked: AtomicBool,
}

impl PreloadedMedia {
    fn new(url: &str, kind: MediaKind, fetched: FetchedMedia) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            kind,
            content_type: fetched.content_type,
            bytes: Arc::from(fetched.bytes),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Where the host should point its player or image element.
    ///
    /// Audio stays bound to its source URL. Images get a local handle so the
    /// display does not download them again. `None` once revoked.
    pub fn local_uri(&self) -> Option<String> {
        if self.is_revoked() {
            return None;
        }
        Some(match self.kind {
            MediaKind::Audio => self.url.clone(),
            MediaKind::Image => format!("blob:examflow/{}", self.id),
        })
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<PreloadedMedia>, MediaLoadError>>>;

enum Slot {
    Pending,
    Loading {
        generation: u64,
        load: SharedLoad,
        abort: AbortHandle,
    },
    Loaded(Arc<PreloadedMedia>),
    Failed(MediaLoadError),
}

struct PreloadRecord {
    kind: MediaKind,
    slot: Slot,
    retry_count: u32,
}

impl PreloadRecord {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            slot: Slot::Pending,
            retry_count: 0,
        }
    }

    fn status(&self) -> PreloadStatus {
        match self.slot {
            Slot::Pending => PreloadStatus::Pending,
            Slot::Loading { .. } => PreloadStatus::Loading,
            Slot::Loaded(_) => PreloadStatus::Loaded,
            Slot::Failed(_) => PreloadStatus::Error,
        }
    }
}

struct Inner {
    fetcher: Arc<dyn MediaFetcher>,
    timeout: Duration,
    records: Mutex<HashMap<String, PreloadRecord>>,
    generation: AtomicU64,
}

impl Inner {
    fn records(&self) -> MutexGuard<'_, HashMap<String, PreloadRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a finished load, unless the record was discarded or reset
    /// since this load started.
    fn settle(
        &self,
        url: &str,
        generation: u64,
        result: &Result<Arc<PreloadedMedia>, MediaLoadError>,
    ) {
        let mut records = self.records();
        let Some(record) = records.get_mut(url) else {
            return;
        };
        let current =
            matches!(record.slot, Slot::Loading { generation: g, .. } if g == generation);
        if !current {
            tracing::debug!(url, generation, "dropping stale preload result");
            if let Ok(media) = result {
                media.revoke();
            }
            return;
        }

        record.slot = match result {
            Ok(media) => {
                tracing::debug!(url, bytes = media.len(), "preload finished");
                Slot::Loaded(Arc::clone(media))
            }
            Err(err) => {
                tracing::warn!(url, "preload failed: {err}");
                Slot::Failed(err.clone())
            }
        };
    }
}

/// De-duplicating media prefetcher.
#[derive(Clone)]
pub struct PreloadManager {
    inner: Arc<Inner>,
}

impl PreloadManager {
    pub fn new(fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self::with_timeout(fetcher, DEFAULT_PRELOAD_TIMEOUT)
    }

    pub fn with_timeout(fetcher: Arc<dyn MediaFetcher>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                timeout,
                records: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Load `url`, sharing any load already in flight.
    ///
    /// A record that previously failed returns its error without fetching;
    /// use [`PreloadManager::reload`] to try again.
    pub async fn preload(
        &self,
        url: &str,
        kind: MediaKind,
    ) -> Result<Arc<PreloadedMedia>, MediaLoadError> {
        let load = {
            let mut records = self.inner.records();
            let record = records
                .entry(url.to_string())
                .or_insert_with(|| PreloadRecord::new(kind));
            let existing = match &record.slot {
                Slot::Loaded(media) => return Ok(Arc::clone(media)),
                Slot::Failed(err) => return Err(err.clone()),
                Slot::Loading { load, .. } => Some(load.clone()),
                Slot::Pending => None,
            };
            match existing {
                Some(load) => load,
                None => self.start_load(url, record),
            }
        };
        load.await
    }

    /// Discard the record for `url` and load it again.
    pub async fn reload(
        &self,
        url: &str,
        kind: MediaKind,
    ) -> Result<Arc<PreloadedMedia>, MediaLoadError> {
        self.discard(url);
        self.preload(url, kind).await
    }

    /// Reset a record to pending, cancelling any in-flight load and
    /// releasing its handle. The retry counter survives and is incremented.
    pub fn discard(&self, url: &str) {
        let mut records = self.inner.records();
        if let Some(record) = records.get_mut(url) {
            match &record.slot {
                Slot::Loading { abort, .. } => abort.abort(),
                Slot::Loaded(media) => media.revoke(),
                Slot::Pending | Slot::Failed(_) => {}
            }
            record.slot = Slot::Pending;
            record.retry_count += 1;
        }
    }

    /// Start background loads for every asset not yet requested, in the
    /// given order. Returns how many loads were started.
    pub fn warm<'a>(&self, assets: impl IntoIterator<Item = &'a MediaAsset>) -> usize {
        let mut records = self.inner.records();
        let mut started = 0;
        for asset in assets {
            let record = records
                .entry(asset.url.clone())
                .or_insert_with(|| PreloadRecord::new(asset.file_type));
            if matches!(record.slot, Slot::Pending) {
                // The load runs in its own task; nobody needs to hold it.
                let _ = self.start_load(&asset.url, record);
                started += 1;
            }
        }
        started
    }

    fn start_load(&self, url: &str, record: &mut PreloadRecord) -> SharedLoad {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let kind = record.kind;
        let inner = Arc::clone(&self.inner);
        let task_url = url.to_string();

        let task = tokio::spawn(async move {
            let result =
                match tokio::time::timeout(inner.timeout, inner.fetcher.fetch(&task_url, kind))
                    .await
                {
                    Ok(Ok(fetched)) => Ok(Arc::new(PreloadedMedia::new(&task_url, kind, fetched))),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(MediaLoadError::Timeout {
                        url: task_url.clone(),
                        secs: inner.timeout.as_secs(),
                    }),
                };
            inner.settle(&task_url, generation, &result);
            result
        });

        let abort = task.abort_handle();
        let join_url = url.to_string();
        let load = async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(MediaLoadError::Aborted { url: join_url }),
            }
        }
        .boxed()
        .shared();

        tracing::debug!(url, %kind, generation, "preload started");
        record.slot = Slot::Loading {
            generation,
            load: load.clone(),
            abort,
        };
        load
    }

    pub fn status(&self, url: &str) -> Option<PreloadStatus> {
        self.inner.records().get(url).map(PreloadRecord::status)
    }

    /// Number of explicit reloads issued for `url`.
    pub fn retry_count(&self, url: &str) -> u32 {
        self.inner
            .records()
            .get(url)
            .map(|r| r.retry_count)
            .unwrap_or(0)
    }

    /// The loaded resource, if it is ready.
    pub fn media(&self, url: &str) -> Option<Arc<PreloadedMedia>> {
        match self.inner.records().get(url).map(|r| &r.slot) {
            Some(Slot::Loaded(media)) => Some(Arc::clone(media)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records().is_empty()
    }

    /// Abort every in-flight load, revoke every handle, forget everything.
    pub fn shutdown(&self) {
        let mut records = self.inner.records();
        let mut aborted = 0usize;
        for (_, record) in records.drain() {
            match record.slot {
                Slot::Loading { abort, .. } => {
                    abort.abort();
                    aborted += 1;
                }
                Slot::Loaded(media) => media.revoke(),
                Slot::Pending | Slot::Failed(_) => {}
            }
        }
        tracing::debug!(aborted, "preload cache torn down");
    }
}
