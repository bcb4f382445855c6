//! Default in-process [`PersistenceStore`], backed by a [`DashMap`].

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cancel::CancellationWatcher;
use crate::model::{DownloadItem, DownloadStatus, ErrorReason, FileRecord, ItemId};

use super::{AttemptRecord, PersistenceStore, StorageError};

/// An in-memory [`PersistenceStore`]. Durable only for the process
/// lifetime; intended for tests and embedders without a database.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: DashMap<ItemId, DownloadItem>,
    attempts: DashMap<ItemId, Vec<AttemptRecord>>,
    files: DashMap<ItemId, Vec<FileRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File records recorded against `id`, in insertion order. Not part of
    /// [`PersistenceStore`] since it has no durable-backend equivalent
    /// beyond a plain `SELECT`; exposed here for callers (tests, admin
    /// tooling) that already hold a concrete `InMemoryStore`.
    #[must_use]
    pub fn file_records(&self, id: ItemId) -> Vec<FileRecord> {
        self.files.get(&id).map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn create_item(
        &self,
        item: &DownloadItem,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        self.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: ItemId,
        status: DownloadStatus,
        error_reason: Option<ErrorReason>,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.status = status;
        entry.error_reason = error_reason;
        Ok(())
    }

    async fn update_progress(
        &self,
        id: ItemId,
        bytes_downloaded: u64,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.bytes_downloaded = bytes_downloaded;
        Ok(())
    }

    async fn update_attempts(
        &self,
        id: ItemId,
        attempts: u32,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.attempts = attempts;
        Ok(())
    }

    async fn record_attempt(
        &self,
        attempt: AttemptRecord,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        self.attempts.entry(attempt.item_id).or_default().push(attempt);
        Ok(())
    }

    async fn insert_file_record(
        &self,
        record: FileRecord,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        self.files.entry(record.item_id).or_default().push(record);
        Ok(())
    }

    async fn list_active(&self, _cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError> {
        Ok(self
            .items
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.clone())
            .collect())
    }

    async fn list_history(&self, _cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError> {
        Ok(self
            .items
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| e.clone())
            .collect())
    }

    async fn get(&self, id: ItemId, _cancel: &mut CancellationWatcher) -> Result<DownloadItem, StorageError> {
        self.items
            .get(&id)
            .map(|e| e.clone())
            .ok_or(StorageError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn sample(id: ItemId) -> DownloadItem {
        DownloadItem {
            id,
            user_id: "u1".into(),
            source_url: "https://example.com/a.epub".into(),
            format: crate::model::Format::Epub,
            target_path: PathBuf::from("/tmp/a.epub"),
            expected_bytes: None,
            user_priority: 5,
            status: DownloadStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            error_reason: None,
            bytes_downloaded: 0,
            book_id: None,
            source_label: None,
            original_input: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryStore::new();
        let token = CancellationToken::new();
        let mut watcher = token.watcher();
        store.create_item(&sample(1), &mut watcher).await.unwrap();
        let fetched = store.get(1, &mut watcher).await.unwrap();
        assert_eq!(fetched.id, 1);
    }

    #[tokio::test]
    async fn get_missing_item_errors() {
        let store = InMemoryStore::new();
        let token = CancellationToken::new();
        let mut watcher = token.watcher();
        assert!(matches!(store.get(99, &mut watcher).await, Err(StorageError::NotFound(99))));
    }

    #[tokio::test]
    async fn active_and_history_partition_by_terminal_status() {
        let store = InMemoryStore::new();
        let token = CancellationToken::new();
        let mut watcher = token.watcher();
        store.create_item(&sample(1), &mut watcher).await.unwrap();
        store.create_item(&sample(2), &mut watcher).await.unwrap();
        store
            .update_status(2, DownloadStatus::Completed, None, &mut watcher)
            .await
            .unwrap();

        assert_eq!(store.list_active(&mut watcher).await.unwrap().len(), 1);
        assert_eq!(store.list_history(&mut watcher).await.unwrap().len(), 1);
    }
}
