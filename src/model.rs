//! Core data types shared across the download execution pipeline.
//!
//! These mirror the entities of the data model: [`DownloadItem`], its
//! [`DownloadStatus`] lifecycle, [`ProgressEvent`], and [`FileRecord`].
//! `QueueEntry` lives in [`crate::queue`] since it is private to the
//! priority queue's internal ordering.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Unique identifier for a [`DownloadItem`].
pub type ItemId = u64;

/// eBook formats the organizer and worker understand.
///
/// Format conversion between these is explicitly out of scope; this enum
/// only distinguishes how a downloaded artifact is validated and laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Epub,
    Pdf,
    Mobi,
    Azw3,
    Txt,
    Djvu,
    Fb2,
    Rtf,
}

impl Format {
    /// All formats accepted by `Scheduler::submit`.
    pub const ALL: [Format; 8] = [
        Format::Epub,
        Format::Pdf,
        Format::Mobi,
        Format::Azw3,
        Format::Txt,
        Format::Djvu,
        Format::Fb2,
        Format::Rtf,
    ];

    /// Lowercase file extension, also used as the `{format}` layout token.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Epub => "epub",
            Format::Pdf => "pdf",
            Format::Mobi => "mobi",
            Format::Azw3 => "azw3",
            Format::Txt => "txt",
            Format::Djvu => "djvu",
            Format::Fb2 => "fb2",
            Format::Rtf => "rtf",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epub" => Ok(Format::Epub),
            "pdf" => Ok(Format::Pdf),
            "mobi" => Ok(Format::Mobi),
            "azw3" => Ok(Format::Azw3),
            "txt" => Ok(Format::Txt),
            "djvu" => Ok(Format::Djvu),
            "fb2" => Ok(Format::Fb2),
            "rtf" => Ok(Format::Rtf),
            other => Err(format!("unrecognized format: {other}")),
        }
    }
}

/// Lifecycle state of a [`DownloadItem`] (state machine in §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Ready,
    Active,
    Paused,
    Retrying,
    Completed,
    FailedTransient,
    FailedPermanent,
    Cancelled,
}

impl DownloadStatus {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::FailedPermanent | DownloadStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    ///
    /// `Cancelled` is reachable from any non-terminal state, so it is
    /// checked first rather than being enumerated per source state.
    #[must_use]
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::{
            Active, Cancelled, Completed, FailedPermanent, FailedTransient, Paused, Pending,
            Ready, Retrying,
        };

        if next == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Active)
                | (Active, Paused)
                | (Paused, Ready)
                | (Active, Completed)
                | (Active, FailedTransient)
                | (FailedTransient, Retrying)
                | (Retrying, Ready)
                | (FailedTransient, FailedPermanent)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Ready => "ready",
            DownloadStatus::Active => "active",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Retrying => "retrying",
            DownloadStatus::Completed => "completed",
            DownloadStatus::FailedTransient => "failed_transient",
            DownloadStatus::FailedPermanent => "failed_permanent",
            DownloadStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Stable identifier for why an item stopped making progress (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    ValidationError,
    StorageError,
    NetworkError,
    ProtocolError,
    TimeoutError,
    IntegrityError,
    DiskError,
    Cancelled,
    QueueOverflow,
    ValidationFailed,
    DuplicateOfExisting,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single eBook acquisition request and its current lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: ItemId,
    pub user_id: String,
    pub source_url: String,
    pub format: Format,
    pub target_path: PathBuf,
    pub expected_bytes: Option<u64>,
    /// 1 (lowest) through 10 (highest).
    pub user_priority: u8,
    pub status: DownloadStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub error_reason: Option<ErrorReason>,
    /// Bytes written so far in the current (or most recent) attempt.
    pub bytes_downloaded: u64,
    /// Book record to attach a `FileRecord` to on completion, if any.
    pub book_id: Option<String>,
    /// How this item entered the system, e.g. `"api"`, `"import"`. Not
    /// load-bearing for any invariant; carried through for audit/debugging.
    pub source_label: Option<String>,
    /// Original caller-supplied input before any resolution, if distinct
    /// from `source_url`.
    pub original_input: Option<String>,
}

impl DownloadItem {
    /// Attempts the `self.status -> next` edge, applying it in place.
    ///
    /// # Errors
    ///
    /// Returns `Err(next)` without mutating `self` if the edge is not
    /// permitted by the §4.1 state machine.
    pub fn transition(&mut self, next: DownloadStatus) -> Result<(), DownloadStatus> {
        if !self.status.can_transition_to(next) {
            return Err(next);
        }
        self.status = next;
        Ok(())
    }
}

/// A request to submit to [`crate::scheduler::Scheduler::submit`].
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub user_id: String,
    pub source_url: String,
    pub format: Format,
    pub expected_bytes: Option<u64>,
    pub user_priority: u8,
    pub max_attempts: u32,
    pub book_id: Option<String>,
    pub source_label: Option<String>,
    pub original_input: Option<String>,
    /// Metadata used to resolve the layout pattern's `{author}`/`{title}`/
    /// `{series}` tokens at submission time (§4.8 step 2).
    pub author: Option<String>,
    pub title: Option<String>,
    pub series: Option<String>,
}

/// A progress update emitted during an active transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub item_id: ItemId,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub instantaneous_rate_bps: f64,
    pub smoothed_rate_bps: f64,
    pub eta_seconds: Option<u64>,
    pub status: DownloadStatus,
    pub emitted_at: SystemTime,
}

/// A finalized, organized file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub item_id: ItemId,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub format: Format,
    pub attached_book_id: Option<String>,
    pub is_primary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trips_through_extension() {
        for f in Format::ALL {
            assert_eq!(f.extension().parse::<Format>().unwrap(), f);
        }
    }

    #[test]
    fn format_parse_rejects_unknown() {
        assert!("cbz".parse::<Format>().is_err());
    }

    #[test]
    fn cancel_reachable_from_any_non_terminal_state() {
        let non_terminal = [
            DownloadStatus::Pending,
            DownloadStatus::Ready,
            DownloadStatus::Active,
            DownloadStatus::Paused,
            DownloadStatus::Retrying,
        ];
        for s in non_terminal {
            assert!(s.can_transition_to(DownloadStatus::Cancelled));
        }
    }

    #[test]
    fn cancel_unreachable_from_terminal_states() {
        let terminal = [
            DownloadStatus::Completed,
            DownloadStatus::FailedPermanent,
            DownloadStatus::Cancelled,
        ];
        for s in terminal {
            assert!(!s.can_transition_to(DownloadStatus::Cancelled));
        }
    }

    #[test]
    fn forbidden_edge_is_rejected() {
        assert!(!DownloadStatus::Pending.can_transition_to(DownloadStatus::Active));
        assert!(!DownloadStatus::Completed.can_transition_to(DownloadStatus::Ready));
    }

    #[test]
    fn item_transition_mutates_only_on_success() {
        let mut item = sample_item();
        assert!(item.transition(DownloadStatus::Ready).is_ok());
        assert_eq!(item.status, DownloadStatus::Ready);

        let err = item.transition(DownloadStatus::Completed).unwrap_err();
        assert_eq!(err, DownloadStatus::Completed);
        assert_eq!(item.status, DownloadStatus::Ready);
    }

    fn sample_item() -> DownloadItem {
        DownloadItem {
            id: 1,
            user_id: "u1".into(),
            source_url: "https://example.com/a.epub".into(),
            format: Format::Epub,
            target_path: PathBuf::from("/tmp/a.epub"),
            expected_bytes: Some(1024),
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
}
