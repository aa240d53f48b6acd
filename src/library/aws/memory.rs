//! In-memory object store and entry table.
//!
//! Intended for tests and local runs. Both mirror the semantics the AWS
//! backend relies on: idempotent object puts, conditional item puts and
//! sorted partition queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{ClientError, EntryItem, EntryTable, ObjectStore, QueryPage, StoredObject};

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ClientError> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: Some(content_type.to_string()),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, ClientError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn head_object(&self, key: &str) -> Result<bool, ClientError> {
        Ok(self.objects.read().await.contains_key(key))
    }
}

/// Items keyed by (partition, sort key), kept in sort order
#[derive(Debug, Default)]
pub struct MemoryEntryTable {
    items: RwLock<BTreeMap<(String, String), EntryItem>>,
    failures: AtomicUsize,
}

impl MemoryEntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` requests fail with a service error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), ClientError> {
        let taken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(ClientError::Service("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl EntryTable for MemoryEntryTable {
    async fn put_item_if_absent(&self, item: EntryItem) -> Result<(), ClientError> {
        self.injected_failure()?;
        let key = (item.library_id.clone(), item.entry_id.clone());
        let mut items = self.items.write().await;
        if items.contains_key(&key) {
            return Err(ClientError::ConditionFailed);
        }
        items.insert(key, item);
        Ok(())
    }

    async fn get_item(
        &self,
        library_id: &str,
        entry_id: &str,
    ) -> Result<Option<EntryItem>, ClientError> {
        self.injected_failure()?;
        let key = (library_id.to_string(), entry_id.to_string());
        Ok(self.items.read().await.get(&key).cloned())
    }

    async fn query(
        &self,
        library_id: &str,
        exclusive_start: Option<&str>,
        limit: usize,
        descending: bool,
    ) -> Result<QueryPage, ClientError> {
        self.injected_failure()?;
        let items = self.items.read().await;
        let partition = items
            .iter()
            .filter(|((partition, _), _)| partition == library_id)
            .map(|(_, item)| item);

        let matching: Vec<&EntryItem> = if descending {
            partition
                .rev()
                .filter(|item| exclusive_start.map_or(true, |s| item.entry_id.as_str() < s))
                .collect()
        } else {
            partition
                .filter(|item| exclusive_start.map_or(true, |s| item.entry_id.as_str() > s))
                .collect()
        };

        let page: Vec<EntryItem> = matching.iter().take(limit).map(|i| (*i).clone()).collect();
        let last_evaluated_key = if matching.len() > limit {
            page.last().map(|i| i.entry_id.clone())
        } else {
            None
        };

        Ok(QueryPage {
            items: page,
            last_evaluated_key,
        })
    }
}
