//! Directory of blob files named verbatim by [`BlobId`].
//!
//! Shared by the filesystem and SQLite backends. Writes go to a hidden
//! temporary file in the same directory and are renamed into place, so a
//! reader either sees the complete blob or no file at all.

use std::path::PathBuf;

use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{blob_id_for, LibraryError, LibraryResult};
use crate::domain::{BlobId, Content};

#[derive(Debug, Clone)]
pub struct BlobDirectory {
    path: PathBuf,
}

impl BlobDirectory {
    /// Open (creating if needed) a blob directory
    pub async fn open(path: impl Into<PathBuf>) -> LibraryResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn blob_path(&self, blob_id: &BlobId) -> PathBuf {
        self.path.join(blob_id.as_str())
    }

    pub async fn put(&self, content: Content) -> LibraryResult<BlobId> {
        let blob_id = blob_id_for(&content)?;
        let target = self.blob_path(&blob_id);

        if fs::try_exists(&target).await? {
            debug!(blob_id = %blob_id, "Blob already stored, skipping write");
            return Ok(blob_id);
        }

        // Concurrent writers of the same bytes each use their own temp file;
        // whichever rename lands last replaces identical content.
        let temp = self
            .path
            .join(format!(".{}.{}.tmp", blob_id, Uuid::new_v4().simple()));
        fs::write(&temp, content.bytes()).await?;
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }

        debug!(blob_id = %blob_id, bytes = content.len(), "Stored blob");
        Ok(blob_id)
    }

    pub async fn get(&self, blob_id: &BlobId) -> LibraryResult<Content> {
        match fs::read(self.blob_path(blob_id)).await {
            Ok(bytes) => Ok(Content::new(bytes, blob_id.mime_type())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LibraryError::NotFound(format!("blob {}", blob_id)))
            }
            Err(err) => Err(err.into()),
        }
    }
}
