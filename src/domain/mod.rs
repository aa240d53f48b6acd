//! Content model shared by every library backend.
//!
//! - Blob: content-addressed payload ([`Content`] + [`BlobId`])
//! - Entry: ordered blob sequence plus metadata, keyed by a sortable [`EntryId`]

pub mod blob;
pub mod entry;

use thiserror::Error;

pub use blob::{extension_for, BlobId, Content, DEFAULT_MIME_TYPE};
pub use entry::{Entry, EntryId, EntryIdGenerator, EntryMetadata, EntrySpec};

/// A string that is not a well-formed identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentifier {
    #[error("Invalid blob id: {0}")]
    Blob(String),

    #[error("Invalid entry id: {0}")]
    Entry(String),
}
