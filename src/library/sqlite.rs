//! SQLite-backed library: entries in `entries.db`, blobs as files.
//!
//! The connection is shared behind a mutex and driven from the blocking
//! pool. Entry ids are the table's primary key, so listing is an indexed
//! descending range scan.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::blob_dir::BlobDirectory;
use super::{EntryPage, Library, LibraryError, LibraryResult, PageToken};
use crate::domain::{
    BlobId, Content, Entry, EntryId, EntryIdGenerator, EntrySpec, InvalidIdentifier,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        entry_id TEXT PRIMARY KEY NOT NULL,
        record   TEXT NOT NULL
    );
";

pub struct SqliteLibrary {
    name: String,
    blobs: BlobDirectory,
    conn: Arc<Mutex<Connection>>,
    ids: EntryIdGenerator,
}

fn unavailable(err: impl std::fmt::Display) -> LibraryError {
    LibraryError::Unavailable(err.to_string())
}

fn decode(entry_id: &str, record: &str) -> LibraryResult<Entry> {
    let corrupt = |reason: String| LibraryError::Corrupt {
        id: entry_id.to_string(),
        reason,
    };
    let entry_id: EntryId = entry_id
        .parse()
        .map_err(|e: InvalidIdentifier| corrupt(e.to_string()))?;
    let spec: EntrySpec = serde_json::from_str(record).map_err(|e| corrupt(e.to_string()))?;
    Ok(Entry::from_spec(entry_id, spec))
}

impl SqliteLibrary {
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> LibraryResult<Self> {
        let name = name.into();
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let blobs = BlobDirectory::open(root.join(super::filesystem::BLOBS_DIR)).await?;

        let db_path = root.join("entries.db");
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(unavailable)?
        .map_err(unavailable)?;

        info!(library = %name, root = %root.display(), "Opened sqlite library");

        Ok(Self {
            name,
            blobs,
            conn: Arc::new(Mutex::new(conn)),
            ids: EntryIdGenerator::new(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> LibraryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> LibraryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| unavailable("sqlite connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(unavailable)?
    }
}

#[async_trait]
impl Library for SqliteLibrary {
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
        let entry_id = self.ids.next_id();
        let record = serde_json::to_string(&spec).map_err(|e| LibraryError::Corrupt {
            id: entry_id.to_string(),
            reason: e.to_string(),
        })?;

        let key = entry_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (entry_id, record) VALUES (?1, ?2)",
                params![key, record],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await?;

        debug!(library = %self.name, entry_id = %entry_id, "Inserted entry");
        Ok(entry_id)
    }

    async fn get_entry(&self, entry_id: &EntryId) -> LibraryResult<Entry> {
        let key = entry_id.to_string();
        let record = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT record FROM entries WHERE entry_id = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(unavailable)
            })
            .await?;

        match record {
            Some(record) => decode(entry_id.as_str(), &record),
            None => Err(LibraryError::NotFound(format!("entry {}", entry_id))),
        }
    }

    async fn list_entries(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> LibraryResult<EntryPage> {
        let page_size = page_size.max(1);
        let after = page_token.map(|t| t.entry_id().to_string());
        // One extra row tells us whether another page exists.
        let limit = i64::try_from(page_size + 1).unwrap_or(i64::MAX);

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT entry_id, record FROM entries
                         WHERE ?1 IS NULL OR entry_id < ?1
                         ORDER BY entry_id DESC
                         LIMIT ?2",
                    )
                    .map_err(unavailable)?;
                let rows = stmt
                    .query_map(params![after, limit], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(unavailable)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(unavailable)?;
                Ok(rows)
            })
            .await?;

        let has_more = rows.len() > page_size;
        let entries = rows
            .iter()
            .take(page_size)
            .map(|(id, record)| decode(id, record))
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
