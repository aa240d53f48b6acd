//! Ingestion and download records, status snapshots and the status cache.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::IntakeError;
use crate::domain::{BlobId, EntryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionState {
    Running,
    Completed,
    Failed,
}

impl IngestionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, IngestionState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadState::Succeeded | DownloadState::Failed)
    }
}

/// How a status surface should draw a download's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressIndicator {
    Waiting,
    /// Total length known
    Determinate,
    /// Total length unknown
    Indeterminate,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub(crate) struct Download {
    pub url: String,
    pub state: DownloadState,
    pub received: u64,
    pub total: Option<u64>,
    pub failure: Option<String>,
    pub blob_id: Option<BlobId>,
}

impl Download {
    fn new(url: String) -> Self {
        Self {
            url,
            state: DownloadState::Pending,
            received: 0,
            total: None,
            failure: None,
            blob_id: None,
        }
    }

    fn percent(&self) -> u8 {
        match self.state {
            DownloadState::Pending => 0,
            DownloadState::InProgress => match self.total {
                Some(total) if total > 0 => (self.received.saturating_mul(100) / total).min(100) as u8,
                _ => 0,
            },
            DownloadState::Succeeded | DownloadState::Failed => 100,
        }
    }

    fn indicator(&self) -> ProgressIndicator {
        match self.state {
            DownloadState::Pending => ProgressIndicator::Waiting,
            DownloadState::InProgress if self.total.map_or(false, |t| t > 0) => {
                ProgressIndicator::Determinate
            }
            DownloadState::InProgress => ProgressIndicator::Indeterminate,
            DownloadState::Succeeded => ProgressIndicator::Success,
            DownloadState::Failed => ProgressIndicator::Failure,
        }
    }

    fn summary(&self) -> String {
        match self.state {
            DownloadState::Pending => "Pending".to_string(),
            DownloadState::InProgress => match self.indicator() {
                ProgressIndicator::Determinate => format!("Downloading {}%", self.percent()),
                _ => format!("Downloading {} bytes", self.received),
            },
            DownloadState::Succeeded => "Succeeded".to_string(),
            DownloadState::Failed => match &self.failure {
                Some(reason) => format!("Failed: {}", reason),
                None => "Failed".to_string(),
            },
        }
    }

    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            url: self.url.clone(),
            state: self.state,
            progress: self.indicator(),
            percent: self.percent(),
            received_bytes: self.received,
            total_bytes: self.total,
            summary: self.summary(),
            blob_id: self.blob_id.clone(),
        }
    }
}

/// Runtime record of one intake request
#[derive(Debug)]
pub(crate) struct Ingestion {
    pub id: Uuid,
    pub library: String,
    pub created_at: DateTime<Utc>,
    pub state: IngestionState,
    pub entry_id: Option<EntryId>,
    pub failure: Option<IntakeError>,
    pub downloads: Vec<Download>,
}

impl Ingestion {
    pub fn new(library: impl Into<String>, urls: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            library: library.into(),
            created_at: Utc::now(),
            state: IngestionState::Running,
            entry_id: None,
            failure: None,
            downloads: urls.iter().cloned().map(Download::new).collect(),
        }
    }

    pub fn snapshot(&self) -> IngestionSnapshot {
        IngestionSnapshot {
            id: self.id,
            library: self.library.clone(),
            entry_id: self.entry_id.clone(),
            state: self.state,
            created_at: self.created_at,
            failure: self.failure.as_ref().map(|e| e.to_string()),
            downloads: self.downloads.iter().map(Download::snapshot).collect(),
        }
    }
}

/// Shared, lock-protected ingestion record
pub(crate) type SharedIngestion = Arc<Mutex<Ingestion>>;

/// Lock a record, recovering the data if a holder panicked
pub(crate) fn lock(record: &SharedIngestion) -> MutexGuard<'_, Ingestion> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub url: String,
    pub state: DownloadState,
    pub progress: ProgressIndicator,
    pub percent: u8,
    pub received_bytes: u64,
    pub total_bytes: Option<u64>,
    pub summary: String,
    pub blob_id: Option<BlobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionSnapshot {
    pub id: Uuid,
    pub library: String,
    /// Set once the entry is committed
    pub entry_id: Option<EntryId>,
    pub state: IngestionState,
    pub created_at: DateTime<Utc>,
    pub failure: Option<String>,
    pub downloads: Vec<DownloadSnapshot>,
}

/// Status of every cached ingestion, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeStatus {
    pub count: usize,
    pub count_by_state: BTreeMap<IngestionState, usize>,
    pub ingestions: Vec<IngestionSnapshot>,
}

/// Bounded FIFO of ingestion records.
///
/// Eviction drops the record from status queries only; the ingestion itself
/// keeps running and still resolves its handle.
#[derive(Debug)]
pub(crate) struct StatusCache {
    capacity: usize,
    records: Mutex<VecDeque<SharedIngestion>>,
}

impl StatusCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn insert(&self, record: SharedIngestion) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn status(&self) -> IntakeStatus {
        let records: Vec<SharedIngestion> = self
            .records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();

        let ingestions: Vec<IngestionSnapshot> =
            records.iter().map(|r| lock(r).snapshot()).collect();
        let mut count_by_state = BTreeMap::new();
        for ingestion in &ingestions {
            *count_by_state.entry(ingestion.state).or_insert(0) += 1;
        }

        IntakeStatus {
            count: ingestions.len(),
            count_by_state,
            ingestions,
        }
    }
}
