//! Persistence layer failure type (§7 `StorageError`).

use thiserror::Error;

use crate::model::ItemId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("item {0} not found in persistence")]
    NotFound(ItemId),

    #[error("persistence backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
}
