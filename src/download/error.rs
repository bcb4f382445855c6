//! Error taxonomy for a single download attempt (§7).

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ErrorReason;

/// Failures a worker can encounter during a single attempt.
///
/// Distinct from [`crate::model::ErrorReason`], which is the stable
/// identifier persisted on the item; [`DownloadError::reason`] maps one
/// onto the other.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout downloading {url}")]
    Timeout { url: String },

    #[error("unexpected HTTP status {status} downloading {url}")]
    Protocol { url: String, status: u16 },

    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity check failed for {path}: {detail}")]
    Integrity { path: PathBuf, detail: String },

    #[error("insufficient disk space or permission denied at {path}")]
    Disk {
        path: PathBuf,
        /// Permission-denied is the one `DiskError` treated as permanent (§7).
        permanent: bool,
    },

    #[error("attempt cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Maps this attempt-level error onto the stable [`ErrorReason`]
    /// persisted on the item.
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            DownloadError::Network { .. } => ErrorReason::NetworkError,
            DownloadError::Timeout { .. } => ErrorReason::TimeoutError,
            DownloadError::Protocol { .. } => ErrorReason::ProtocolError,
            DownloadError::Io { .. } | DownloadError::Disk { .. } => ErrorReason::DiskError,
            DownloadError::Integrity { .. } => ErrorReason::IntegrityError,
            DownloadError::Cancelled => ErrorReason::Cancelled,
        }
    }

    /// Whether this error, on its own, should be treated as permanent
    /// regardless of remaining attempts (§7: permission-denied `DiskError`).
    #[must_use]
    pub fn is_inherently_permanent(&self) -> bool {
        matches!(self, DownloadError::Disk { permanent: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_maps_to_protocol_reason() {
        let err = DownloadError::Protocol {
            url: "http://x".into(),
            status: 404,
        };
        assert_eq!(err.reason(), ErrorReason::ProtocolError);
    }

    #[test]
    fn permission_denied_disk_error_is_permanent() {
        let err = DownloadError::Disk {
            path: PathBuf::from("/tmp/x"),
            permanent: true,
        };
        assert!(err.is_inherently_permanent());
    }

    #[test]
    fn transient_disk_error_is_not_permanent() {
        let err = DownloadError::Disk {
            path: PathBuf::from("/tmp/x"),
            permanent: false,
        };
        assert!(!err.is_inherently_permanent());
    }
}
