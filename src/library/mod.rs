//! Library storage contract and its backends.
//!
//! Every backend implements [`Library`]: content-addressed blob storage plus
//! entry storage with sortable ids and newest-first pagination.
//!
//! # Backends
//!
//! ```text
//! FileSystemLibrary   <root>/Blobs/<blob_id>        <root>/Entries/<entry_id>
//! SqliteLibrary       <root>/Blobs/<blob_id>        <root>/entries.db
//! AwsLibrary          object store (blobs)          key-value table (entries)
//! ```
//!
//! The [`Registry`] maps library names to instances and is built once.

pub mod aws;
pub mod blob_dir;
pub mod filesystem;
pub mod registry;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BlobId, Content, Entry, EntryId, EntrySpec, InvalidIdentifier};

pub use aws::{AwsLibrary, EntryTable, MemoryEntryTable, MemoryObjectStore, ObjectStore};
pub use filesystem::FileSystemLibrary;
pub use registry::Registry;
pub use sqlite::SqliteLibrary;

/// Errors surfaced by every library backend
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown library: {0}")]
    UnknownLibrary(String),

    #[error("Duplicate library name: {0}")]
    DuplicateLibrary(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Unavailable(err.to_string())
    }
}

pub type LibraryResult<T> = Result<T, LibraryError>;

/// Opaque continuation token for [`Library::list_entries`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(EntryId);

impl PageToken {
    /// Listing resumes strictly below this id
    pub fn after(entry_id: EntryId) -> Self {
        Self(entry_id)
    }

    pub fn entry_id(&self) -> &EntryId {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PageToken {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// One page of entries, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    pub next_page_token: Option<PageToken>,
}

/// Storage contract shared by all backends.
///
/// Implementations must tolerate concurrent callers: identical concurrent
/// `put_blob` calls both succeed with the same id, and concurrent
/// `put_entry` calls always receive distinct ids.
#[async_trait]
pub trait Library: Send + Sync {
    /// Name under which the library is registered
    fn name(&self) -> &str;

    /// Store content and return its content-derived id. Idempotent.
    async fn put_blob(&self, content: Content) -> LibraryResult<BlobId>;

    async fn get_blob(&self, blob_id: &BlobId) -> LibraryResult<Content>;

    /// Assign a fresh id and persist the entry all-or-nothing
    async fn put_entry(&self, spec: EntrySpec) -> LibraryResult<EntryId>;

    async fn get_entry(&self, entry_id: &EntryId) -> LibraryResult<Entry>;

    /// Entries ordered by id descending. `page_size` of zero is treated as one.
    async fn list_entries(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> LibraryResult<EntryPage>;
}

impl fmt::Debug for dyn Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Library: {}>", self.name())
    }
}

/// Resolve the blob id for content, rejecting unmapped MIME types
pub fn blob_id_for(content: &Content) -> LibraryResult<BlobId> {
    BlobId::for_content(content)
        .ok_or_else(|| LibraryError::UnsupportedContentType(content.mime_type().to_string()))
}

/// Select one page from ids already sorted descending.
///
/// Returns the ids on the page and the token for the next page, if any.
pub(crate) fn page_of(
    ids_desc: &[EntryId],
    page_token: Option<&PageToken>,
    page_size: usize,
) -> (Vec<EntryId>, Option<PageToken>) {
    let page_size = page_size.max(1);
    let start = match page_token {
        Some(token) => ids_desc.partition_point(|id| id >= token.entry_id()),
        None => 0,
    };
    let remaining = &ids_desc[start..];
    let page: Vec<EntryId> = remaining.iter().take(page_size).cloned().collect();
    let next = if remaining.len() > page_size {
        page.last().cloned().map(PageToken::after)
    } else {
        None
    };
    (page, next)
}
