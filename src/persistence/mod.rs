//! Persistence boundary (§6): where `DownloadItem`s, attempts, and
//! `FileRecord`s are durably recorded.
//!
//! Owning a schema and its migrations is explicitly out of scope for this
//! crate; [`PersistenceStore`] is the seam an embedding service implements
//! against its own storage. [`InMemoryStore`] is the default, always
//! available implementation, adequate for tests and for callers that don't
//! need durability across restarts. The optional `sqlite` feature adds
//! [`sqlite::SqlitePersistence`] as a batteries-included adapter.

mod error;
mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::StorageError;
pub use memory::InMemoryStore;

use async_trait::async_trait;

use crate::cancel::CancellationWatcher;
use crate::model::{DownloadItem, DownloadStatus, ErrorReason, FileRecord, ItemId};

/// A single worker attempt record, for audit and diagnostics.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub item_id: ItemId,
    pub attempt_number: u32,
    pub outcome: DownloadStatus,
    pub error_reason: Option<ErrorReason>,
    pub bytes_downloaded: u64,
}

/// Durable storage contract for the download execution core.
///
/// Every method accepts a [`CancellationWatcher`] so a slow backend can be
/// abandoned cooperatively along with the operation that triggered it.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn create_item(
        &self,
        item: &DownloadItem,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    async fn update_status(
        &self,
        id: ItemId,
        status: DownloadStatus,
        error_reason: Option<ErrorReason>,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    async fn update_progress(
        &self,
        id: ItemId,
        bytes_downloaded: u64,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    /// Persists the attempt counter for `id`. Called once per attempt,
    /// before that attempt starts, so `get`/`list_*` reflect how many
    /// attempts an item has used even before it reaches a terminal state.
    async fn update_attempts(
        &self,
        id: ItemId,
        attempts: u32,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    async fn record_attempt(
        &self,
        attempt: AttemptRecord,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    async fn insert_file_record(
        &self,
        record: FileRecord,
        cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError>;

    async fn list_active(&self, cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError>;

    async fn list_history(&self, cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError>;

    async fn get(&self, id: ItemId, cancel: &mut CancellationWatcher) -> Result<DownloadItem, StorageError>;
}
