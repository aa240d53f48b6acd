//! Ingestion coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::fetch::{FetchError, Fetcher, HttpFetcher};
use super::ingestion::{
    lock, Download, DownloadState, Ingestion, IngestionSnapshot, IngestionState, IntakeStatus,
    SharedIngestion, StatusCache,
};
use super::{IntakeError, IntakeSettings};
use crate::domain::{BlobId, EntryId, EntryMetadata, EntrySpec};
use crate::library::{Library, LibraryError, Registry};

/// One intake submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeRequest {
    /// Target library name
    pub library: String,
    /// Source URLs, in blob sequence order
    pub urls: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl IntakeRequest {
    pub fn new(library: impl Into<String>, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            library: library.into(),
            urls: urls.into_iter().map(Into::into).collect(),
            attributes: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// At least one URL, each absolute http(s)
    pub fn validate(&self) -> Result<(), IntakeError> {
        if self.urls.is_empty() {
            return Err(IntakeError::InvalidRequest("no urls given".to_string()));
        }

        for url in &self.urls {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| IntakeError::InvalidRequest(format!("{}: {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(IntakeError::InvalidRequest(format!(
                    "{}: unsupported scheme {}",
                    url,
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            attributes: self.attributes.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Returned by [`Intake::submit`]; resolves once the ingestion is terminal
#[derive(Debug, Clone)]
pub struct IngestionHandle {
    pub id: Uuid,
    pub state: IngestionState,
    record: SharedIngestion,
    done: watch::Receiver<IngestionState>,
}

impl IngestionHandle {
    /// Current view of this ingestion, even after cache eviction
    pub fn snapshot(&self) -> IngestionSnapshot {
        lock(&self.record).snapshot()
    }

    /// Wait for the terminal state and return the committed entry id
    pub async fn wait(mut self) -> Result<EntryId, IntakeError> {
        // A closed channel still leaves the final state in the record
        let _ = self.done.wait_for(|s| s.is_terminal()).await;

        let record = lock(&self.record);
        match (&record.state, &record.entry_id, &record.failure) {
            (IngestionState::Completed, Some(entry_id), _) => Ok(entry_id.clone()),
            (_, _, Some(failure)) => Err(failure.clone()),
            _ => Err(IntakeError::Aborted),
        }
    }
}

/// Publishes the terminal state when the coordinator ends, however it ends.
///
/// A coordinator that panics or is dropped with the runtime leaves its
/// record `FAILED` instead of `RUNNING`.
struct Completion {
    record: SharedIngestion,
    done: watch::Sender<IngestionState>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let state = {
            let mut ingestion = lock(&self.record);
            if !ingestion.state.is_terminal() {
                fail_unfinished(&mut ingestion);
                ingestion.state = IngestionState::Failed;
                ingestion.failure = Some(IntakeError::Aborted);
                error!(ingestion_id = %ingestion.id, "Ingestion task aborted");
            }
            ingestion.state
        };
        self.done.send_replace(state);
    }
}

/// Everything a running ingestion needs, shared across its tasks
struct Shared {
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    settings: IntakeSettings,
}

/// Intake pipeline over a fixed registry
pub struct Intake {
    registry: Arc<Registry>,
    shared: Arc<Shared>,
    statuses: StatusCache,
}

impl Intake {
    /// Intake fetching over HTTP
    pub fn new(registry: Arc<Registry>, settings: IntakeSettings) -> Self {
        let fetcher = Arc::new(HttpFetcher::new(settings.max_download_bytes));
        Self::with_fetcher(registry, fetcher, settings)
    }

    pub fn with_fetcher(
        registry: Arc<Registry>,
        fetcher: Arc<dyn Fetcher>,
        settings: IntakeSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1)));
        let statuses = StatusCache::new(settings.status_capacity);
        Self {
            registry,
            shared: Arc::new(Shared {
                fetcher,
                permits,
                settings,
            }),
            statuses,
        }
    }

    /// Validate and start an ingestion. Must be called within a tokio runtime.
    ///
    /// Validation failures are returned here and leave no trace in the
    /// status cache.
    #[instrument(skip(self, request), fields(library = %request.library, urls = request.urls.len()))]
    pub fn submit(&self, request: IntakeRequest) -> Result<IngestionHandle, IntakeError> {
        let library = self.registry.lookup(&request.library).map_err(|e| match e {
            LibraryError::UnknownLibrary(name) => IntakeError::UnknownLibrary(name),
            other => IntakeError::InvalidRequest(other.to_string()),
        })?;
        request.validate()?;

        let ingestion = Ingestion::new(&request.library, &request.urls);
        let id = ingestion.id;
        let state = ingestion.state;
        let record: SharedIngestion = Arc::new(Mutex::new(ingestion));
        self.statuses.insert(Arc::clone(&record));

        let (done_tx, done_rx) = watch::channel(state);
        info!(ingestion_id = %id, "Accepted ingestion");

        tokio::spawn(run_ingestion(
            id,
            Arc::clone(&self.shared),
            library,
            Arc::clone(&record),
            request,
            done_tx,
        ));

        Ok(IngestionHandle {
            id,
            state,
            record,
            done: done_rx,
        })
    }

    /// Snapshot of every cached ingestion
    pub fn status(&self) -> IntakeStatus {
        self.statuses.status()
    }
}

#[instrument(skip_all, fields(ingestion_id = %ingestion_id, library = %library.name()))]
async fn run_ingestion(
    ingestion_id: Uuid,
    shared: Arc<Shared>,
    library: Arc<dyn Library>,
    record: SharedIngestion,
    request: IntakeRequest,
    done: watch::Sender<IngestionState>,
) {
    let _completion = Completion {
        record: Arc::clone(&record),
        done,
    };

    let mut tasks = JoinSet::new();
    for (index, url) in request.urls.iter().enumerate() {
        let shared = Arc::clone(&shared);
        let library = Arc::clone(&library);
        let record = Arc::clone(&record);
        let url = url.clone();
        tasks.spawn(async move {
            let outcome = run_download(&shared, library.as_ref(), &record, index, &url).await;
            (index, outcome)
        });
    }

    // Slots are filled by URL index, so completion order never leaks into
    // the committed sequence.
    let mut blobs: Vec<Option<BlobId>> = vec![None; request.urls.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(blob_id))) => blobs[index] = Some(blob_id),
            Ok((_, Err(()))) => {}
            Err(err) => error!(error = %err, "Download task aborted"),
        }
    }

    let blob_sequence: Option<Vec<BlobId>> = blobs.into_iter().collect();
    match blob_sequence {
        Some(blob_sequence) => commit(library.as_ref(), &record, &request, blob_sequence).await,
        None => {
            let mut ingestion = lock(&record);
            fail_unfinished(&mut ingestion);
            let failure = ingestion
                .downloads
                .iter()
                .find(|d| d.state == DownloadState::Failed)
                .map(|d| IntakeError::DownloadFailed {
                    url: d.url.clone(),
                    summary: d.failure.clone().unwrap_or_default(),
                });
            ingestion.state = IngestionState::Failed;
            ingestion.failure = failure;
            error!("Ingestion failed, no entry written");
        }
    }
}

/// Mark downloads whose task vanished (panic) as failed
fn fail_unfinished(ingestion: &mut Ingestion) {
    for download in ingestion.downloads.iter_mut() {
        if !download.state.is_terminal() {
            download.state = DownloadState::Failed;
            download.failure = Some("download task aborted".to_string());
        }
    }
}

async fn commit(
    library: &dyn Library,
    record: &SharedIngestion,
    request: &IntakeRequest,
    blob_sequence: Vec<BlobId>,
) {
    let spec = EntrySpec {
        metadata: request.metadata(),
        blob_sequence,
    };

    match library.put_entry(spec).await {
        Ok(entry_id) => {
            info!(entry_id = %entry_id, "Ingestion completed");
            let mut ingestion = lock(record);
            ingestion.entry_id = Some(entry_id);
            ingestion.state = IngestionState::Completed;
        }
        Err(err) => {
            error!(error = %err, "Failed to commit entry; stored blobs are left in place");
            let mut ingestion = lock(record);
            ingestion.failure = Some(IntakeError::CommitFailed(err.to_string()));
            ingestion.state = IngestionState::Failed;
        }
    }
}

fn update_download(record: &SharedIngestion, index: usize, f: impl FnOnce(&mut Download)) {
    if let Some(download) = lock(record).downloads.get_mut(index) {
        f(download);
    }
}

/// Fetch one URL with retries and store it. `Err(())` once recorded as failed.
#[instrument(skip(shared, library, record), fields(url = %url))]
async fn run_download(
    shared: &Shared,
    library: &dyn Library,
    record: &SharedIngestion,
    index: usize,
    url: &str,
) -> Result<BlobId, ()> {
    let policy = &shared.settings.retry_policy;
    let fetch_timeout = shared.settings.fetch_timeout();
    let mut attempt = 0u32;

    let failed = |summary: String| {
        update_download(record, index, |d| {
            d.state = DownloadState::Failed;
            d.failure = Some(summary);
        });
    };

    loop {
        attempt += 1;

        // The permit covers the fetch and the store, so a held body always
        // counts against the cap. A closed semaphore only happens on shutdown.
        let Ok(permit) = shared.permits.acquire().await else {
            failed("intake shut down".to_string());
            return Err(());
        };

        let result = {
            update_download(record, index, |d| {
                d.state = DownloadState::InProgress;
                d.received = 0;
                d.total = None;
            });

            let progress = |received: u64, total: Option<u64>| {
                update_download(record, index, |d| {
                    d.received = received;
                    d.total = total;
                });
            };

            match tokio::time::timeout(fetch_timeout, shared.fetcher.fetch(url, &progress)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            }
        };

        match result {
            Ok(content) => {
                let bytes = content.len();
                let stored = library.put_blob(content).await;
                drop(permit);
                return match stored {
                    Ok(blob_id) => {
                        debug!(blob_id = %blob_id, bytes, attempt, "Download stored");
                        update_download(record, index, |d| {
                            d.state = DownloadState::Succeeded;
                            d.blob_id = Some(blob_id.clone());
                        });
                        Ok(blob_id)
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to store downloaded content");
                        failed(format!("store failed: {}", err));
                        Err(())
                    }
                };
            }
            Err(err) if err.is_retryable() && policy.should_retry(attempt) => {
                drop(permit);
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(attempt, error = %err, "Fetch failed permanently");
                failed(format!("{} (after {} attempt(s))", err, attempt));
                return Err(());
            }
        }
    }
}
