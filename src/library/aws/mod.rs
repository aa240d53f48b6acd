//! AWS-style library: blobs in an object store, entries in a key-value table.
//!
//! The backend talks to two client seams, [`ObjectStore`] and [`EntryTable`].
//! In-memory clients live in [`memory`]; S3/DynamoDB clients live in `sdk`
//! behind the `aws` cargo feature.
//!
//! ```text
//! object key:  Libraries/<library>/Blobs/<blob_id>
//! item key:    library_id (partition) + entry_id (sort)
//! item attrs:  attributes, tags, blob_sequence, expires_at
//! ```
//!
//! `expires_at` is only written here; expiry is enforced by the table's own
//! TTL policy.

pub mod memory;
#[cfg(feature = "aws")]
pub mod sdk;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::{blob_id_for, EntryPage, Library, LibraryError, LibraryResult, PageToken};
use crate::domain::{BlobId, Content, Entry, EntryId, EntryIdGenerator, EntryMetadata, EntrySpec};

pub use memory::{MemoryEntryTable, MemoryObjectStore};
#[cfg(feature = "aws")]
pub use sdk::{DynamoEntryTable, S3ObjectStore};

/// Default retention written into `expires_at`
pub const DEFAULT_ENTRY_TTL_DAYS: i64 = 365;

/// Attempts at finding an unused entry id before giving up
const PUT_ENTRY_ATTEMPTS: u32 = 3;

/// Errors reported by the storage clients
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Conditional check failed")]
    ConditionFailed,

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<ClientError> for LibraryError {
    fn from(err: ClientError) -> Self {
        LibraryError::Unavailable(err.to_string())
    }
}

/// An object as returned by the object store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str)
        -> Result<(), ClientError>;

    /// `Ok(None)` when no object exists under `key`
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, ClientError>;

    async fn head_object(&self, key: &str) -> Result<bool, ClientError>;
}

/// Entry item in its stored shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryItem {
    pub library_id: String,
    pub entry_id: String,
    pub attributes: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub blob_sequence: Vec<String>,
    /// Unix seconds
    pub expires_at: i64,
}

impl EntryItem {
    fn into_entry(self) -> LibraryResult<Entry> {
        let corrupt = |reason: String| LibraryError::Corrupt {
            id: self.entry_id.clone(),
            reason,
        };
        let entry_id = self
            .entry_id
            .parse::<EntryId>()
            .map_err(|e| corrupt(e.to_string()))?;
        let blob_sequence = self
            .blob_sequence
            .iter()
            .map(|id| id.parse::<BlobId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Entry {
            entry_id,
            metadata: EntryMetadata {
                attributes: self.attributes,
                tags: self.tags.into_iter().collect(),
            },
            blob_sequence,
        })
    }
}

/// One response page from [`EntryTable::query`]
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<EntryItem>,
    /// Sort key to resume from, when the table stopped early
    pub last_evaluated_key: Option<String>,
}

#[async_trait]
pub trait EntryTable: Send + Sync {
    /// Write the item unless one with the same key exists
    /// (`ClientError::ConditionFailed` otherwise)
    async fn put_item_if_absent(&self, item: EntryItem) -> Result<(), ClientError>;

    async fn get_item(
        &self,
        library_id: &str,
        entry_id: &str,
    ) -> Result<Option<EntryItem>, ClientError>;

    /// Sorted range read within one partition
    async fn query(
        &self,
        library_id: &str,
        exclusive_start: Option<&str>,
        limit: usize,
        descending: bool,
    ) -> Result<QueryPage, ClientError>;
}

pub struct AwsLibrary {
    name: String,
    objects: Arc<dyn ObjectStore>,
    table: Arc<dyn EntryTable>,
    entry_ttl: Duration,
    ids: EntryIdGenerator,
}

impl AwsLibrary {
    pub fn new(
        name: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        table: Arc<dyn EntryTable>,
    ) -> Self {
        Self {
            name: name.into(),
            objects,
            table,
            entry_ttl: Duration::days(DEFAULT_ENTRY_TTL_DAYS),
            ids: EntryIdGenerator::new(),
        }
    }

    /// Library over fresh in-memory clients
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryEntryTable::new()),
        )
    }

    pub fn with_entry_ttl(mut self, entry_ttl: Duration) -> Self {
        self.entry_ttl = entry_ttl;
        self
    }

    pub fn blob_key(&self, blob_id: &BlobId) -> String {
        format!("Libraries/{}/Blobs/{}", self.name, blob_id)
    }
}

#[async_trait]
impl Library for AwsLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_blob(&self, content: Content) -> LibraryResult<BlobId> {
        let blob_id = blob_id_for(&content)?;
        let key = self.blob_key(&blob_id);

        if self.objects.head_object(&key).await? {
            debug!(library = %self.name, blob_id = %blob_id, "Blob already stored, skipping upload");
            return Ok(blob_id);
        }

        let mime_type = content.mime_type().to_string();
        self.objects
            .put_object(&key, content.into_bytes(), &mime_type)
            .await?;
        debug!(library = %self.name, blob_id = %blob_id, "Uploaded blob");
        Ok(blob_id)
    }

    async fn get_blob(&self, blob_id: &BlobId) -> LibraryResult<Content> {
        let object = self
            .objects
            .get_object(&self.blob_key(blob_id))
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("blob {}", blob_id)))?;

        let mime_type = object
            .content_type
            .unwrap_or_else(|| blob_id.mime_type().to_string());
        Ok(Content::new(object.body, &mime_type))
    }

    async fn put_entry(&self, spec: EntrySpec) -> LibraryResult<EntryId> {
        let expires_at = (Utc::now() + self.entry_ttl).timestamp();

        for attempt in 1..=PUT_ENTRY_ATTEMPTS {
            let entry_id = self.ids.next_id();
            let item = EntryItem {
                library_id: self.name.clone(),
                entry_id: entry_id.to_string(),
                attributes: spec.metadata.attributes.clone(),
                tags: spec.metadata.tags.iter().cloned().collect(),
                blob_sequence: spec.blob_sequence.iter().map(|b| b.to_string()).collect(),
                expires_at,
            };

            match self.table.put_item_if_absent(item).await {
                Ok(()) => {
                    debug!(library = %self.name, entry_id = %entry_id, "Put entry item");
                    return Ok(entry_id);
                }
                Err(ClientError::ConditionFailed) => {
                    warn!(library = %self.name, entry_id = %entry_id, attempt, "Entry id already taken, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LibraryError::Unavailable(format!(
            "no unused entry id after {} attempts",
            PUT_ENTRY_ATTEMPTS
        )))
    }

    async fn get_entry(&self, entry_id: &EntryId) -> LibraryResult<Entry> {
        self.table
            .get_item(&self.name, entry_id.as_str())
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("entry {}", entry_id)))?
            .into_entry()
    }

    async fn list_entries(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> LibraryResult<EntryPage> {
        let page_size = page_size.max(1);
        let wanted = page_size + 1;
        let mut start = page_token.map(|t| t.entry_id().to_string());
        let mut items = Vec::with_capacity(wanted);

        // The table may stop short of the limit; keep reading until we have
        // one more item than the page needs or the partition is exhausted.
        loop {
            let page = self
                .table
                .query(&self.name, start.as_deref(), wanted - items.len(), true)
                .await?;
            items.extend(page.items);

            match page.last_evaluated_key {
                Some(key) if items.len() < wanted => start = Some(key),
                _ => break,
            }
        }

        let has_more = items.len() > page_size;
        let entries = items
            .into_iter()
            .take(page_size)
            .map(EntryItem::into_entry)
            .collect::<LibraryResult<Vec<_>>>()?;
        let next_page_token = if has_more {
            entries.last().map(|e| PageToken::after(e.entry_id.clone()))
        } else {
            None
        };

        Ok(EntryPage {
            entries,
            next_page_token,
        })
    }
}
