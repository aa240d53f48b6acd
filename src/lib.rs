//! sbs2 - Content-addressed blob and entry storage
//!
//! Binary content ("blobs") is addressed by a SHA-1 digest plus a
//! MIME-derived extension and grouped into ordered, metadata-bearing
//! entries. Every storage backend implements one [`Library`] contract.
//!
//! # Architecture
//!
//! - Blobs are write-once and deduplicated by content id
//! - Entries get sortable ids and list newest first
//! - Intake downloads URLs concurrently and commits one entry only when
//!   every download succeeded
//!
//! # Modules
//!
//! - `domain`: Content model (Content, BlobId, Entry, EntryId)
//! - `library`: Library trait, backends (filesystem, SQLite, AWS), Registry
//! - `intake`: Concurrent download and commit pipeline
//! - `server`: HTTP API for intake
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Ingest two images as one entry
//! sbs2 ingest http://x/a.jpg http://x/b.png --tags demo
//!
//! # Browse
//! sbs2 entries
//! sbs2 show <entry-id>
//!
//! # Serve the intake API
//! sbs2 serve --bind 127.0.0.1:8080
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod intake;
pub mod library;
pub mod server;

// Re-export main types at crate root for convenience
pub use domain::{BlobId, Content, Entry, EntryId, EntryMetadata, EntrySpec};
pub use intake::{Intake, IntakeError, IntakeRequest, IntakeSettings};
pub use library::{
    AwsLibrary, EntryPage, FileSystemLibrary, Library, LibraryError, PageToken, Registry,
    SqliteLibrary,
};
