//! Post-download validation, layout, and duplicate detection (§4.8).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::model::{FileRecord, Format, ItemId};

/// Characters forbidden in path components, mapped to `-` (§4.8 step 2).
const FORBIDDEN_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Error)]
pub enum OrganizerError {
    #[error("downloaded file failed magic-byte validation for format {0}")]
    InvalidMagicBytes(Format),

    #[error("downloaded file is empty")]
    EmptyFile,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hashing error: {0}")]
    Hash(String),
}

/// Metadata used to expand a layout pattern's `{author}`/`{title}`/`{series}`
/// tokens. Missing components substitute `Unknown` after sanitization.
#[derive(Debug, Clone, Default)]
pub struct LayoutMetadata {
    pub author: Option<String>,
    pub title: Option<String>,
    pub series: Option<String>,
}

/// Outcome of organizing a completed download.
#[derive(Debug, Clone)]
pub enum OrganizeOutcome {
    /// Placed at a new path; `file_record` describes it.
    Placed { final_path: PathBuf, file_record: FileRecord },
    /// Content-identical file already existed; the new file was discarded.
    Duplicate { existing_path: PathBuf, file_record: FileRecord },
}

/// Validates, places, deduplicates, and attaches a completed download.
pub struct FileOrganizer;

impl FileOrganizer {
    /// Reads the first 512 bytes of `downloaded_path` and validates magic
    /// bytes per format (§4.8 step 1).
    ///
    /// # Errors
    ///
    /// Returns [`OrganizerError::InvalidMagicBytes`] or
    /// [`OrganizerError::EmptyFile`] when validation fails, and
    /// [`OrganizerError::Io`] on read failure.
    #[instrument(skip(downloaded_path), fields(path = %downloaded_path.display()))]
    pub async fn validate(downloaded_path: &Path, format: Format) -> Result<(), OrganizerError> {
        let mut file = tokio::fs::File::open(downloaded_path).await?;
        let mut buf = vec![0u8; 512];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);

        if buf.is_empty() {
            return Err(OrganizerError::EmptyFile);
        }

        let valid = match format {
            Format::Epub => buf.starts_with(b"PK\x03\x04"),
            Format::Pdf => buf.starts_with(b"%PDF-"),
            Format::Txt => {
                let non_printable = buf
                    .iter()
                    .filter(|&&b| b != b'\n' && b != b'\r' && b != b'\t' && (b < 0x20 || b == 0x7f))
                    .count();
                (non_printable as f64) / (buf.len() as f64) <= 0.30
            }
            // Unknown/unvalidated formats skip content checks but still
            // require non-empty size, already established above.
            Format::Mobi | Format::Azw3 | Format::Djvu | Format::Fb2 | Format::Rtf => true,
        };

        if valid {
            Ok(())
        } else {
            Err(OrganizerError::InvalidMagicBytes(format))
        }
    }

    /// Sanitizes one path component: maps forbidden characters to `-`,
    /// trims leading/trailing whitespace and dots, substitutes `Unknown`
    /// for an empty result (§4.8 step 2).
    #[must_use]
    pub fn sanitize_component(raw: &str) -> String {
        let mapped: String = raw
            .chars()
            .map(|c| if FORBIDDEN_CHARS.contains(&c) { '-' } else { c })
            .collect();
        let trimmed = mapped.trim_matches(|c: char| c.is_whitespace() || c == '.');
        if trimmed.is_empty() {
            "Unknown".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Expands `pattern`'s `{author}`, `{title}`, `{series}`, `{format}`
    /// tokens against sanitized metadata and returns `root/<expanded>.{format}`.
    #[must_use]
    pub fn resolve_target_path(root: &Path, pattern: &str, metadata: &LayoutMetadata, format: Format) -> PathBuf {
        let author = Self::sanitize_component(metadata.author.as_deref().unwrap_or(""));
        let title = Self::sanitize_component(metadata.title.as_deref().unwrap_or(""));
        let series = Self::sanitize_component(metadata.series.as_deref().unwrap_or(""));

        let expanded = pattern
            .replace("{author}", &author)
            .replace("{title}", &title)
            .replace("{series}", &series)
            .replace("{format}", format.extension());

        root.join(expanded)
    }

    /// Computes the SHA-256 of a file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`OrganizerError::Io`] if the file cannot be read.
    pub async fn hash_file(path: &Path) -> Result<String, OrganizerError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Finalizes a completed download at `downloaded_path`: validates,
    /// places it under `target_path`, deduplicates against any existing
    /// file there, and builds the [`FileRecord`] (§4.8 steps 2-4).
    ///
    /// `downloaded_path` and `target_path` may be the same path if the
    /// worker already wrote directly to the final location; in that case
    /// duplicate detection compares against a backup taken before overwrite
    /// is the caller's responsibility, so this function assumes
    /// `downloaded_path` and `target_path` are distinct when a prior file
    /// may exist at `target_path`.
    ///
    /// # Errors
    ///
    /// Returns [`OrganizerError::Io`] on filesystem failures during hashing,
    /// moving, or directory creation.
    #[instrument(skip(self, metadata), fields(item_id, target = %target_path.display()))]
    pub async fn organize(
        &self,
        item_id: ItemId,
        downloaded_path: &Path,
        target_path: &Path,
        format: Format,
        book_id: Option<String>,
        metadata: &LayoutMetadata,
    ) -> Result<OrganizeOutcome, OrganizerError> {
        let _ = metadata; // kept for callers that resolved target_path separately
        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let new_hash = Self::hash_file(downloaded_path).await?;
        let size_bytes = tokio::fs::metadata(downloaded_path).await?.len();

        if tokio::fs::try_exists(target_path).await? {
            let existing_hash = Self::hash_file(target_path).await?;
            if existing_hash == new_hash {
                tokio::fs::remove_file(downloaded_path).await?;
                let record = FileRecord {
                    item_id,
                    absolute_path: target_path.to_path_buf(),
                    size_bytes,
                    sha256: new_hash,
                    format,
                    attached_book_id: book_id,
                    is_primary: false,
                };
                return Ok(OrganizeOutcome::Duplicate {
                    existing_path: target_path.to_path_buf(),
                    file_record: record,
                });
            }
            let suffixed = suffix_path(target_path);
            tokio::fs::rename(downloaded_path, &suffixed).await?;
            let record = FileRecord {
                item_id,
                absolute_path: suffixed.clone(),
                size_bytes,
                sha256: new_hash,
                format,
                attached_book_id: book_id,
                is_primary: false,
            };
            return Ok(OrganizeOutcome::Placed {
                final_path: suffixed,
                file_record: record,
            });
        }

        if downloaded_path != target_path {
            tokio::fs::rename(downloaded_path, target_path).await?;
        }
        let record = FileRecord {
            item_id,
            absolute_path: target_path.to_path_buf(),
            size_bytes,
            sha256: new_hash,
            format,
            attached_book_id: book_id,
            is_primary: false,
        };
        Ok(OrganizeOutcome::Placed {
            final_path: target_path.to_path_buf(),
            file_record: record,
        })
    }
}

fn suffix_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    let mut n = 1;
    loop {
        let candidate_name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = path.with_file_name(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Scans `roots` for files and groups them by SHA-256, reusing the same
/// hash logic [`FileOrganizer::organize`] uses for online duplicate
/// detection. Returns only groups with more than one member.
///
/// # Errors
///
/// Returns [`OrganizerError::Io`] if a root cannot be read.
pub async fn scan_duplicate_groups(roots: &[PathBuf]) -> Result<Vec<Vec<PathBuf>>, OrganizerError> {
    let mut by_hash: HashMap<String, Vec<PathBuf>> = HashMap::new();

    for root in roots {
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(hash) = FileOrganizer::hash_file(&path).await {
                    by_hash.entry(hash).or_default().push(path);
                }
            }
        }
    }

    Ok(by_hash.into_values().filter(|g| g.len() > 1).collect())
}
