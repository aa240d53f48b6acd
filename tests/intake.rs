//! Intake Integration Tests
//!
//! Ordering, all-or-nothing commit, retries, timeouts and the shared
//! download cap, driven through scripted fetchers and a mock HTTP server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sbs2::domain::{BlobId, Content, Entry, EntryId, EntrySpec};
use sbs2::intake::{
    DownloadState, FetchError, Fetcher, IngestionState, Intake, IntakeError, IntakeRequest,
    IntakeSettings, ProgressFn, RetryPolicy,
};
use sbs2::library::{
    AwsLibrary, EntryPage, FileSystemLibrary, Library, LibraryResult, MemoryEntryTable,
    MemoryObjectStore, PageToken, Registry,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serves `body of <url>` as PNG after a per-URL delay
#[derive(Default)]
struct ScriptedFetcher {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    unavailable: HashSet<String>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn with_delay(mut self, url: &str, millis: u64) -> Self {
        self.delays
            .insert(url.to_string(), Duration::from_millis(millis));
        self
    }

    fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Always answers 503, which is retryable
    fn unavailable(mut self, url: &str) -> Self {
        self.unavailable.insert(url.to_string());
        self
    }
}

fn body_for(url: &str) -> Content {
    Content::new(format!("body of {}", url).into_bytes(), "image/png")
}

fn blob_for(url: &str) -> BlobId {
    BlobId::for_content(&body_for(url)).unwrap()
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, progress: ProgressFn<'_>) -> Result<Content, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(url)
            .copied()
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(url) {
            return Err(FetchError::Status(404));
        }
        if self.unavailable.contains(url) {
            return Err(FetchError::Status(503));
        }

        let content = body_for(url);
        progress(content.len() as u64, Some(content.len() as u64));
        Ok(content)
    }
}

/// Wraps a library with a slow `put_blob` and counts stores in flight
struct SlowStoreLibrary {
    inner: Arc<dyn Library>,
    store_delay: Duration,
    panic_on_commit: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowStoreLibrary {
    fn new(inner: Arc<dyn Library>, store_delay: Duration) -> Self {
        Self {
            inner,
            store_delay,
            panic_on_commit: false,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn panicking_on_commit(mut self) -> Self {
        self.panic_on_commit = true;
        self
    }
}

#[async_trait]
impl Library for SlowStoreLibrary {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put_blob(&self, content: Content) -> LibraryResult<BlobId> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.store_delay).await;
        let result = self.inner.put_blob(content).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_blob(&self, blob_id: &BlobId) -> LibraryResult<Content> {
        self.inner.get_blob(blob_id).await
    }

    async fn put_entry(&self, spec: EntrySpec) -> LibraryResult<EntryId> {
        if self.panic_on_commit {
            panic!("entry table went away");
        }
        self.inner.put_entry(spec).await
    }

    async fn get_entry(&self, entry_id: &EntryId) -> LibraryResult<Entry> {
        self.inner.get_entry(entry_id).await
    }

    async fn list_entries(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> LibraryResult<EntryPage> {
        self.inner.list_entries(page_token, page_size).await
    }
}

fn fast_settings() -> IntakeSettings {
    IntakeSettings {
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

async fn fs_registry(temp: &TempDir) -> (Arc<Registry>, Arc<dyn Library>) {
    let library: Arc<dyn Library> = Arc::new(
        FileSystemLibrary::open("FSLibrary", temp.path().join("FSLibrary"))
            .await
            .unwrap(),
    );
    let registry = Registry::new([Arc::clone(&library)]).unwrap();
    (Arc::new(registry), library)
}

#[tokio::test]
async fn test_blob_sequence_follows_url_order() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let (a, b, c) = ("http://x/a.png", "http://x/b.png", "http://x/c.png");

    // Completion order is B, C, A
    let fetcher = ScriptedFetcher::default()
        .with_delay(a, 300)
        .with_delay(b, 10)
        .with_delay(c, 120);
    let intake = Intake::with_fetcher(registry, Arc::new(fetcher), fast_settings());

    let handle = intake.submit(IntakeRequest::new("FSLibrary", [a, b, c])).unwrap();
    assert_eq!(handle.state, IngestionState::Running);
    let entry_id = handle.wait().await.unwrap();

    let entry = library.get_entry(&entry_id).await.unwrap();
    assert_eq!(entry.blob_sequence, vec![blob_for(a), blob_for(b), blob_for(c)]);
}

#[tokio::test]
async fn test_one_failed_download_fails_the_ingestion() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let (good, bad) = ("http://x/good.png", "http://x/missing.png");

    let fetcher = ScriptedFetcher::default().failing(bad);
    let intake = Intake::with_fetcher(registry, Arc::new(fetcher), fast_settings());

    let handle = intake
        .submit(IntakeRequest::new("FSLibrary", [good, bad]))
        .unwrap();
    let watched = handle.clone();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, IntakeError::DownloadFailed { ref url, .. } if url == bad));
    assert!(library.list_entries(None, 10).await.unwrap().entries.is_empty());

    // The successful blob is left behind as an orphan
    assert!(library.get_blob(&blob_for(good)).await.is_ok());

    let snapshot = watched.snapshot();
    assert_eq!(snapshot.state, IngestionState::Failed);
    assert!(snapshot.entry_id.is_none());
    assert_eq!(snapshot.downloads[0].state, DownloadState::Succeeded);
    assert_eq!(snapshot.downloads[1].state, DownloadState::Failed);
    assert!(snapshot.downloads[1].summary.contains("404"));
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let temp = TempDir::new().unwrap();
    let (registry, _library) = fs_registry(&temp).await;
    let url = "http://x/missing.png";

    let fetcher = Arc::new(ScriptedFetcher::default().failing(url));
    let intake = Intake::with_fetcher(registry, fetcher.clone(), fast_settings());

    let result = intake
        .submit(IntakeRequest::new("FSLibrary", [url]))
        .unwrap()
        .wait()
        .await;

    assert!(result.is_err());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_demo_scenario_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"jpeg bytes".to_vec(), "image/jpeg"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"png bytes".to_vec(), "image/png"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let intake = Intake::new(registry, fast_settings());

    let request = IntakeRequest::new(
        "FSLibrary",
        [
            format!("{}/a.jpg", server.uri()),
            format!("{}/b.png", server.uri()),
        ],
    )
    .with_tag("demo");
    let entry_id = intake.submit(request).unwrap().wait().await.unwrap();

    let entry = library.get_entry(&entry_id).await.unwrap();
    assert_eq!(entry.blob_sequence.len(), 2);
    assert_eq!(entry.metadata.tags.iter().collect::<Vec<_>>(), vec!["demo"]);
    assert_eq!(entry.blob_sequence[0].extension(), ".jpg");
    assert_eq!(entry.blob_sequence[1].extension(), ".png");

    let status = intake.status();
    assert_eq!(status.count, 1);
    assert_eq!(status.count_by_state.get(&IngestionState::Completed), Some(&1));
    let ingestion = &status.ingestions[0];
    assert_eq!(ingestion.entry_id.as_ref(), Some(&entry_id));
    assert!(ingestion
        .downloads
        .iter()
        .all(|d| d.state == DownloadState::Succeeded && d.percent == 100));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"finally".to_vec(), "image/png"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let intake = Intake::new(registry, fast_settings());

    let entry_id = intake
        .submit(IntakeRequest::new(
            "FSLibrary",
            [format!("{}/flaky.png", server.uri())],
        ))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let entry = library.get_entry(&entry_id).await.unwrap();
    let content = library.get_blob(&entry.blob_sequence[0]).await.unwrap();
    assert_eq!(content.bytes().as_ref(), b"finally");
}

#[tokio::test]
async fn test_missing_content_type_is_octet_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw".to_vec()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let intake = Intake::new(registry, fast_settings());

    let entry_id = intake
        .submit(IntakeRequest::new(
            "FSLibrary",
            [format!("{}/raw", server.uri())],
        ))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let entry = library.get_entry(&entry_id).await.unwrap();
    assert_eq!(entry.blob_sequence[0].extension(), ".bin");
}

#[tokio::test]
async fn test_hung_fetch_times_out() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let url = "http://x/hang.png";

    let fetcher = ScriptedFetcher::default().with_delay(url, 10_000);
    let settings = IntakeSettings {
        fetch_timeout_seconds: 1,
        retry_policy: RetryPolicy::none(),
        ..Default::default()
    };
    let intake = Intake::with_fetcher(registry, Arc::new(fetcher), settings);

    let handle = intake.submit(IntakeRequest::new("FSLibrary", [url])).unwrap();
    let watched = handle.clone();
    let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("ingestion should finish after the fetch timeout")
        .unwrap_err();

    assert!(matches!(err, IntakeError::DownloadFailed { .. }));
    assert!(watched.snapshot().downloads[0].summary.contains("Timed out"));
    assert!(library.list_entries(None, 10).await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_concurrent_ingestions_stay_isolated() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let urls_one = ["http://x/1.png", "http://x/shared.png", "http://x/2.png"];
    let urls_two = ["http://x/shared.png", "http://x/3.png"];

    let fetcher = ScriptedFetcher::default()
        .with_delay("http://x/1.png", 80)
        .with_delay("http://x/3.png", 40)
        .with_delay("http://x/shared.png", 20);
    let intake = Intake::with_fetcher(registry, Arc::new(fetcher), fast_settings());

    let one = intake.submit(IntakeRequest::new("FSLibrary", urls_one)).unwrap();
    let two = intake.submit(IntakeRequest::new("FSLibrary", urls_two)).unwrap();
    let (one, two) = tokio::join!(one.wait(), two.wait());
    let (one, two) = (one.unwrap(), two.unwrap());

    assert_ne!(one, two);
    let entry_one = library.get_entry(&one).await.unwrap();
    let entry_two = library.get_entry(&two).await.unwrap();
    assert_eq!(
        entry_one.blob_sequence,
        urls_one.iter().map(|u| blob_for(u)).collect::<Vec<_>>()
    );
    assert_eq!(
        entry_two.blob_sequence,
        urls_two.iter().map(|u| blob_for(u)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_download_cap_is_shared_across_ingestions() {
    let temp = TempDir::new().unwrap();
    let (registry, _library) = fs_registry(&temp).await;

    let mut fetcher = ScriptedFetcher::default();
    for i in 0..9 {
        fetcher = fetcher.with_delay(&format!("http://x/{}.png", i), 30);
    }
    let fetcher = Arc::new(fetcher);
    let settings = IntakeSettings {
        max_concurrent_downloads: 2,
        ..fast_settings()
    };
    let intake = Intake::with_fetcher(registry, fetcher.clone(), settings);

    let mut handles = Vec::new();
    for batch in 0..3 {
        let urls: Vec<String> = (0..3)
            .map(|i| format!("http://x/{}.png", batch * 3 + i))
            .collect();
        handles.push(intake.submit(IntakeRequest::new("FSLibrary", urls)).unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn test_unknown_library_is_rejected_synchronously() {
    let temp = TempDir::new().unwrap();
    let (registry, _library) = fs_registry(&temp).await;
    let intake = Intake::with_fetcher(
        registry,
        Arc::new(ScriptedFetcher::default()),
        fast_settings(),
    );

    let err = intake
        .submit(IntakeRequest::new("Nope", ["http://x/a.png"]))
        .unwrap_err();
    assert_eq!(err, IntakeError::UnknownLibrary("Nope".to_string()));

    let err = intake
        .submit(IntakeRequest::new("FSLibrary", Vec::<String>::new()))
        .unwrap_err();
    assert!(matches!(err, IntakeError::InvalidRequest(_)));

    assert_eq!(intake.status().count, 0);
}

#[tokio::test]
async fn test_commit_failure_ends_failed() {
    let table = Arc::new(MemoryEntryTable::new());
    let library: Arc<dyn Library> = Arc::new(AwsLibrary::new(
        "Cloud",
        Arc::new(MemoryObjectStore::new()),
        table.clone(),
    ));
    let registry = Arc::new(Registry::new([Arc::clone(&library)]).unwrap());
    let intake = Intake::with_fetcher(
        registry,
        Arc::new(ScriptedFetcher::default()),
        fast_settings(),
    );

    table.fail_next(1);
    let url = "http://x/a.png";
    let handle = intake.submit(IntakeRequest::new("Cloud", [url])).unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, IntakeError::CommitFailed(_)));
    assert!(library.get_blob(&blob_for(url)).await.is_ok());
    assert!(table.is_empty().await);

    let status = intake.status();
    assert_eq!(status.count_by_state.get(&IngestionState::Failed), Some(&1));
    assert!(status.ingestions[0]
        .failure
        .as_deref()
        .unwrap_or_default()
        .starts_with("Commit failed"));
}

#[tokio::test]
async fn test_evicted_ingestion_still_completes() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let fetcher = ScriptedFetcher::default().with_delay("http://x/slow.png", 100);
    let settings = IntakeSettings {
        status_capacity: 1,
        ..fast_settings()
    };
    let intake = Intake::with_fetcher(registry, Arc::new(fetcher), settings);

    let first = intake
        .submit(IntakeRequest::new("FSLibrary", ["http://x/slow.png"]))
        .unwrap();
    let second = intake
        .submit(IntakeRequest::new("FSLibrary", ["http://x/fast.png"]))
        .unwrap();

    let status = intake.status();
    assert_eq!(status.count, 1);
    assert_eq!(status.ingestions[0].id, second.id);

    let entry_id = first.wait().await.unwrap();
    assert!(library.get_entry(&entry_id).await.is_ok());
    second.wait().await.unwrap();
}

#[tokio::test]
async fn test_retryable_failure_exhausts_attempts() {
    let temp = TempDir::new().unwrap();
    let (registry, library) = fs_registry(&temp).await;
    let (a, b) = ("http://x/down-a.png", "http://x/down-b.png");

    let fetcher = Arc::new(ScriptedFetcher::default().unavailable(a).unavailable(b));
    let intake = Intake::with_fetcher(registry, fetcher.clone(), fast_settings());

    let handle = intake.submit(IntakeRequest::new("FSLibrary", [a, b])).unwrap();
    let watched = handle.clone();
    let err = handle.wait().await.unwrap_err();

    // max_attempts is 3 for each URL
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    assert!(matches!(err, IntakeError::DownloadFailed { .. }));

    let snapshot = watched.snapshot();
    assert_eq!(snapshot.state, IngestionState::Failed);
    for download in &snapshot.downloads {
        assert_eq!(download.state, DownloadState::Failed);
        assert!(download.summary.contains("503"));
        assert!(download.summary.contains("after 3 attempt(s)"));
    }
    assert!(library.list_entries(None, 10).await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_download_cap_covers_storing() {
    let temp = TempDir::new().unwrap();
    let (_, inner) = fs_registry(&temp).await;
    let library = Arc::new(SlowStoreLibrary::new(inner, Duration::from_millis(100)));
    let registry = Arc::new(Registry::new([library.clone() as Arc<dyn Library>]).unwrap());

    let settings = IntakeSettings {
        max_concurrent_downloads: 1,
        ..fast_settings()
    };
    let intake = Intake::with_fetcher(registry, Arc::new(ScriptedFetcher::default()), settings);

    let urls: Vec<String> = (0..6).map(|i| format!("http://x/{}.png", i)).collect();
    let entry_id = intake
        .submit(IntakeRequest::new("FSLibrary", urls))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(library.peak.load(Ordering::SeqCst), 1);
    assert_eq!(library.get_entry(&entry_id).await.unwrap().blob_sequence.len(), 6);
}

#[tokio::test]
async fn test_coordinator_panic_ends_failed() {
    let temp = TempDir::new().unwrap();
    let (_, inner) = fs_registry(&temp).await;
    let library: Arc<dyn Library> =
        Arc::new(SlowStoreLibrary::new(inner, Duration::ZERO).panicking_on_commit());
    let registry = Arc::new(Registry::new([library]).unwrap());
    let intake = Intake::with_fetcher(
        registry,
        Arc::new(ScriptedFetcher::default()),
        fast_settings(),
    );

    let handle = intake
        .submit(IntakeRequest::new("FSLibrary", ["http://x/a.png"]))
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("a panicked ingestion should still finish")
        .unwrap_err();

    assert_eq!(err, IntakeError::Aborted);
    let status = intake.status();
    assert_eq!(status.count_by_state.get(&IngestionState::Failed), Some(&1));
    assert_eq!(status.count_by_state.get(&IngestionState::Running), None);
    assert_eq!(
        status.ingestions[0].failure.as_deref(),
        Some("Ingestion task aborted")
    );
}
