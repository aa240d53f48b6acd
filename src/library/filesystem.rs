//! Filesystem-backed library.
//!
//! ```text
//! <root>/
//! ├── Blobs/<blob_id>       # raw bytes, named by content id
//! └── Entries/<entry_id>    # YAML entry record
//! ```
//!
//! Entry files are written to a hidden temp file and renamed into place.
//! Listing is a directory scan sorted descending by file name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::blob_dir::BlobDirectory;
use super::{page_of, EntryPage, Library, LibraryError, LibraryResult, PageToken};
use crate::domain::{BlobId, Content, Entry, EntryId, EntryIdGenerator, EntrySpec};

pub const BLOBS_DIR: &str = "Blobs";
pub const ENTRIES_DIR: &str = "Entries";

pub struct FileSystemLibrary {
    name: String,
    root: PathBuf,
    entries_path: PathBuf,
    blobs: BlobDirectory,
    ids: EntryIdGenerator,
}

impl FileSystemLibrary {
    /// Open a library rooted at `root`, creating the directory layout
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> LibraryResult<Self> {
        let name = name.into();
        let root = root.into();
        let entries_path = root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries_path).await?;
        let blobs = BlobDirectory::open(root.join(BLOBS_DIR)).await?;

        info!(library = %name, root = %root.display(), "Opened filesystem library");

        Ok(Self {
            name,
            root,
            entries_path,
            blobs,
            ids: EntryIdGenerator::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, entry_id: &EntryId) -> PathBuf {
        self.entries_path.join(entry_id.as_str())
    }

    async fn load_entry(&self, entry_id: &EntryId) -> LibraryResult<Option<Entry>> {
        let text = match fs::read_to_string(self.entry_path(entry_id)).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let entry: Entry = serde_yaml::from_str(&text).map_err(|e| LibraryError::Corrupt {
            id: entry_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(entry))
    }

    /// All entry ids on disk, newest first. Temp files and stray names are skipped.
    async fn entry_ids_desc(&self) -> LibraryResult<Vec<EntryId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(&self.entries_path).await?;

        while let Some(dir_entry) = dir.next_entry().await? {
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Ok(id) = name.parse::<EntryId>() {
                    ids.push(id);
                }
            }
        }

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}

#[async_trait]
impl Library for FileSystemLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_blob(&self, content: Content) -> LibraryResult<BlobId> {
        self.blobs.put(content).await
    }

    async fn get_blob(&self, blob_id: &BlobId) -> LibraryResult<Content> {
        self.blobs.get(blob_id).await
    }

    async fn put_entry(&self, spec: EntrySpec) -> LibraryResult<EntryId> {
        let entry = Entry::from_spec(self.ids.next_id(), spec);
        let yaml = serde_yaml::to_string(&entry).map_err(|e| LibraryError::Corrupt {
            id: entry.entry_id.to_string(),
            reason: e.to_string(),
        })?;

        let target = self.entry_path(&entry.entry_id);
        let temp = self.entries_path.join(format!(".{}.tmp", entry.entry_id));
        fs::write(&temp, yaml).await?;
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }

        debug!(library = %self.name, entry_id = %entry.entry_id, "Wrote entry");
        Ok(entry.entry_id)
    }

    async fn get_entry(&self, entry_id: &EntryId) -> LibraryResult<Entry> {
        self.load_entry(entry_id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("entry {}", entry_id)))
    }

    async fn list_entries(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> LibraryResult<EntryPage> {
        let ids = self.entry_ids_desc().await?;
        let (page_ids, next_page_token) = page_of(&ids, page_token, page_size);

        let mut entries = Vec::with_capacity(page_ids.len());
        for id in &page_ids {
            match self.load_entry(id).await? {
                Some(entry) => entries.push(entry),
                None => warn!(library = %self.name, entry_id = %id, "Entry vanished during listing"),
            }
        }

        Ok(EntryPage {
            entries,
            next_page_token,
        })
    }
}
