//! `SQLite`-backed [`PersistenceStore`], gated behind the `sqlite` feature.
//!
//! No `migrations/` directory ships with this crate: owning a schema is a
//! caller concern (§6), so the schema here is created ad hoc with
//! `CREATE TABLE IF NOT EXISTS` rather than `sqlx::migrate!`.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::instrument;

use crate::cancel::CancellationWatcher;
use crate::model::{DownloadItem, DownloadStatus, ErrorReason, FileRecord, Format, ItemId};

use super::{AttemptRecord, PersistenceStore, StorageError};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    source_url TEXT NOT NULL,
    format TEXT NOT NULL,
    target_path TEXT NOT NULL,
    expected_bytes INTEGER,
    user_priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_reason TEXT,
    bytes_downloaded INTEGER NOT NULL,
    book_id TEXT,
    source_label TEXT,
    original_input TEXT
);
CREATE TABLE IF NOT EXISTS attempts (
    item_id INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    error_reason TEXT,
    bytes_downloaded INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS file_records (
    item_id INTEGER NOT NULL,
    absolute_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    format TEXT NOT NULL,
    attached_book_id TEXT,
    is_primary INTEGER NOT NULL
);
";

/// `SQLite`-backed persistence adapter.
#[derive(Debug, Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// ad hoc schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Sqlite`] if the connection or schema setup
    /// fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Opens an in-memory database, useful for tests that want the real
    /// SQL path without touching disk.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Sqlite`] if the connection or schema setup
    /// fails.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

/// Stores `SystemTime` as seconds-since-epoch text; the teacher stack
/// doesn't carry `chrono`, and this crate has no need for human-readable
/// timestamps in the database.
fn system_time_to_rfc3339(t: std::time::SystemTime) -> String {
    t.duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

fn rfc3339_to_system_time(s: &str) -> std::time::SystemTime {
    let secs: u64 = s.parse().unwrap_or(0);
    std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> DownloadItem {
    let format: String = row.get("format");
    let status: String = row.get("status");
    let error_reason: Option<String> = row.get("error_reason");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    DownloadItem {
        id: row.get::<i64, _>("id") as ItemId,
        user_id: row.get("user_id"),
        source_url: row.get("source_url"),
        format: format.parse::<Format>().unwrap_or(Format::Epub),
        target_path: row.get::<String, _>("target_path").into(),
        expected_bytes: row.get::<Option<i64>, _>("expected_bytes").map(|v| v as u64),
        user_priority: row.get::<i64, _>("user_priority") as u8,
        status: parse_status(&status),
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        created_at: rfc3339_to_system_time(&row.get::<String, _>("created_at")),
        started_at: started_at.map(|s| rfc3339_to_system_time(&s)),
        completed_at: completed_at.map(|s| rfc3339_to_system_time(&s)),
        error_reason: error_reason.and_then(|s| parse_error_reason(&s)),
        bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
        book_id: row.get("book_id"),
        source_label: row.get("source_label"),
        original_input: row.get("original_input"),
    }
}

fn parse_status(s: &str) -> DownloadStatus {
    use DownloadStatus::{
        Active, Cancelled, Completed, FailedPermanent, FailedTransient, Paused, Pending, Ready, Retrying,
    };
    match s {
        "pending" => Pending,
        "ready" => Ready,
        "active" => Active,
        "paused" => Paused,
        "retrying" => Retrying,
        "completed" => Completed,
        "failed_transient" => FailedTransient,
        "failed_permanent" => FailedPermanent,
        _ => Cancelled,
    }
}

fn error_reason_to_db(r: ErrorReason) -> String {
    serde_json::to_string(&r).unwrap_or_default()
}

fn parse_error_reason(s: &str) -> Option<ErrorReason> {
    serde_json::from_str(s).ok()
}

#[async_trait]
impl PersistenceStore for SqlitePersistence {
    async fn create_item(&self, item: &DownloadItem, _cancel: &mut CancellationWatcher) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO items (id, user_id, source_url, format, target_path, expected_bytes, \
             user_priority, status, attempts, max_attempts, created_at, started_at, completed_at, \
             error_reason, bytes_downloaded, book_id, source_label, original_input) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(item.id as i64)
        .bind(&item.user_id)
        .bind(&item.source_url)
        .bind(item.format.to_string())
        .bind(item.target_path.to_string_lossy().to_string())
        .bind(item.expected_bytes.map(|v| v as i64))
        .bind(i64::from(item.user_priority))
        .bind(item.status.to_string())
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(system_time_to_rfc3339(item.created_at))
        .bind(item.started_at.map(system_time_to_rfc3339))
        .bind(item.completed_at.map(system_time_to_rfc3339))
        .bind(item.error_reason.map(error_reason_to_db))
        .bind(item.bytes_downloaded as i64)
        .bind(&item.book_id)
        .bind(&item.source_label)
        .bind(&item.original_input)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: ItemId,
        status: DownloadStatus,
        error_reason: Option<ErrorReason>,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE items SET status = ?, error_reason = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(error_reason.map(error_reason_to_db))
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        id: ItemId,
        bytes_downloaded: u64,
        _cancel: &mut CancellationWatcher,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE items SET bytes_downloaded = ? WHERE id = ?")
            .bind(bytes_downloaded as i64)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn update_attempts(&self, id: ItemId, attempts: u32, _cancel: &mut CancellationWatcher) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE items SET attempts = ? WHERE id = ?")
            .bind(i64::from(attempts))
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: AttemptRecord, _cancel: &mut CancellationWatcher) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO attempts (item_id, attempt_number, outcome, error_reason, bytes_downloaded) \
             VALUES (?,?,?,?,?)",
        )
        .bind(attempt.item_id as i64)
        .bind(i64::from(attempt.attempt_number))
        .bind(attempt.outcome.to_string())
        .bind(attempt.error_reason.map(error_reason_to_db))
        .bind(attempt.bytes_downloaded as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_file_record(&self, record: FileRecord, _cancel: &mut CancellationWatcher) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO file_records (item_id, absolute_path, size_bytes, sha256, format, \
             attached_book_id, is_primary) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(record.item_id as i64)
        .bind(record.absolute_path.to_string_lossy().to_string())
        .bind(record.size_bytes as i64)
        .bind(&record.sha256)
        .bind(record.format.to_string())
        .bind(&record.attached_book_id)
        .bind(record.is_primary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self, _cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE status NOT IN ('completed', 'failed_permanent', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    async fn list_history(&self, _cancel: &mut CancellationWatcher) -> Result<Vec<DownloadItem>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE status IN ('completed', 'failed_permanent', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    async fn get(&self, id: ItemId, _cancel: &mut CancellationWatcher) -> Result<DownloadItem, StorageError> {
        let row = sqlx::query("SELECT * FROM items WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound(id))?;
        Ok(row_to_item(&row))
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
            format: Format::Epub,
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
    async fn create_and_fetch_round_trips_through_sqlite() {
        let store = SqlitePersistence::open_in_memory().await.unwrap();
        let token = CancellationToken::new();
        let mut watcher = token.watcher();
        store.create_item(&sample(1), &mut watcher).await.unwrap();
        let fetched = store.get(1, &mut watcher).await.unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.status, DownloadStatus::Pending);
    }

    #[tokio::test]
    async fn update_status_persists_error_reason() {
        let store = SqlitePersistence::open_in_memory().await.unwrap();
        let token = CancellationToken::new();
        let mut watcher = token.watcher();
        store.create_item(&sample(1), &mut watcher).await.unwrap();
        store
            .update_status(1, DownloadStatus::FailedPermanent, Some(ErrorReason::ProtocolError), &mut watcher)
            .await
            .unwrap();
        let fetched = store.get(1, &mut watcher).await.unwrap();
        assert_eq!(fetched.status, DownloadStatus::FailedPermanent);
        assert_eq!(fetched.error_reason, Some(ErrorReason::ProtocolError));
    }
}
