//! Intake: fetch remote content concurrently, then commit one entry.
//!
//! ```text
//! submit ──► validate ──► Ingestion (RUNNING) ──► download tasks ─┐
//!                                                                 │  bounded by a
//!                            status cache ◄── progress updates ◄──┤  shared semaphore
//!                                                                 ▼
//!                           all SUCCEEDED ──► put_entry ──► COMPLETED
//!                           any FAILED    ─────────────────► FAILED
//! ```
//!
//! The blob sequence always follows the request's URL order, never the
//! order downloads finish in. Blobs written by a failed ingestion are left
//! in place.

pub mod fetch;
pub mod ingestion;
pub mod pipeline;
pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fetch::{FetchError, Fetcher, HttpFetcher, ProgressFn};
pub use ingestion::{
    DownloadSnapshot, DownloadState, IngestionSnapshot, IngestionState, IntakeStatus,
    ProgressIndicator,
};
pub use pipeline::{Intake, IntakeRequest, IngestionHandle};
pub use retry::RetryPolicy;

/// Errors surfaced by intake
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntakeError {
    #[error("Unknown library: {0}")]
    UnknownLibrary(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Download of {url} failed: {summary}")]
    DownloadFailed { url: String, summary: String },

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Ingestion task aborted")]
    Aborted,
}

/// Tunables for the intake pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    /// Downloads running at once across all ingestions
    pub max_concurrent_downloads: usize,

    /// Ingestions kept for status queries
    pub status_capacity: usize,

    /// Per-attempt limit for one fetch, body included
    pub fetch_timeout_seconds: u64,

    pub max_download_bytes: u64,

    pub retry_policy: RetryPolicy,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 16,
            status_capacity: 100,
            fetch_timeout_seconds: 60,
            max_download_bytes: 512 * 1024 * 1024,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl IntakeSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}
