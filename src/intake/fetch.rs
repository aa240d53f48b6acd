//! Fetching remote content.

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Content, DEFAULT_MIME_TYPE};

/// Progress callback: `(received_bytes, total_bytes_if_known)`
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    /// Transport failures, timeouts, 5xx and 429 are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout => true,
            FetchError::Status(status) => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            FetchError::TooLarge { .. } => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Source of remote content for downloads
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the whole body of `url`, reporting progress as bytes arrive
    async fn fetch(&self, url: &str, progress: ProgressFn<'_>) -> Result<Content, FetchError>;
}

/// Streams bodies over HTTP with reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(max_bytes: u64) -> Self {
        Self::with_client(reqwest::Client::new(), max_bytes)
    }

    pub fn with_client(client: reqwest::Client, max_bytes: u64) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, progress: ProgressFn<'_>) -> Result<Content, FetchError> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let total = response.content_length();
        if total.map_or(false, |t| t > self.max_bytes) {
            return Err(FetchError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        let capacity = total.unwrap_or(0).min(self.max_bytes);
        let mut body = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        progress(0, total);

        while let Some(chunk) = response.chunk().await? {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
            progress(body.len() as u64, total);
        }

        debug!(url, bytes = body.len(), mime_type = %mime_type, "Fetched body");
        Ok(Content::new(body.freeze(), &mime_type))
    }
}
