//! Archive extraction into a staging directory.
//!
//! Every entry is written to a temporary name in its final parent directory
//! and renamed into place, so a crash mid-extraction never leaves a
//! truncated file under its final name. Entries whose paths escape the
//! destination are rejected outright.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::ErrorKind;
use crate::reporter::UpdateReporter;

/// Predicate deciding whether an archive entry should be extracted.
///
/// Receives the archive path and the entry name; returning `false` skips
/// the entry and records it in [`ExtractionResult::skipped`].
pub type EntryFilter = Arc<dyn Fn(&Path, &str) -> bool + Send + Sync>;

/// Options controlling one extraction run.
#[derive(Clone, Default)]
pub struct ExtractOptions {
    /// Restore unix permission bits recorded in the archive.
    pub preserve_attributes: bool,
    /// Replace files that already exist at the destination. When unset,
    /// existing files are skipped and recorded.
    pub overwrite: bool,
    /// Passphrase for encrypted entries.
    pub password: Option<String>,
    /// Optional per-entry predicate.
    pub filter: Option<EntryFilter>,
}

impl std::fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("preserve_attributes", &self.preserve_attributes)
            .field("overwrite", &self.overwrite)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Per-entry progress metadata handed to the reporter.
#[derive(Debug, Clone)]
pub struct ExtractProgress<'a> {
    /// Entry name as recorded in the archive.
    pub entry: &'a str,
    /// Compressed size of the entry in bytes.
    pub compressed_size: u64,
    /// Uncompressed size of the entry in bytes.
    pub uncompressed_size: u64,
    /// Zero-based index of the entry.
    pub index: usize,
    /// Total number of entries in the archive.
    pub total: usize,
}

/// Outcome of a successful extraction.
#[derive(Debug)]
pub struct ExtractionResult {
    /// Directory the archive was extracted into.
    pub destination: PathBuf,
    /// Number of entries written.
    pub extracted: usize,
    /// Entry names skipped by the filter or the overwrite policy.
    pub skipped: Vec<String>,
}

/// Errors produced by extraction. On failure, entries already renamed into
/// place are left for the caller to clean up with the staging directory.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The archive is unreadable or structurally invalid.
    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    /// An entry is encrypted and no passphrase was supplied.
    #[error("Archive entry is encrypted and no passphrase is configured")]
    PasswordRequired,

    /// The supplied passphrase failed to decrypt an entry.
    #[error("Incorrect archive passphrase")]
    PasswordIncorrect,

    /// An entry path would escape the destination directory.
    #[error("Entry '{0}' escapes the destination directory")]
    Traversal(String),

    /// Filesystem failure (disk full, permissions, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Classify for the `failed` event taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Corrupt(_) => ErrorKind::ArchiveCorrupt,
            Self::PasswordRequired => ErrorKind::PasswordRequired,
            Self::PasswordIncorrect => ErrorKind::PasswordIncorrect,
            Self::Traversal(_) => ErrorKind::PathTraversalRejected,
            Self::Io(_) => ErrorKind::Disk,
        }
    }
}

fn map_zip_error(err: ZipError) -> ExtractError {
    match err {
        ZipError::Io(e) => ExtractError::Io(e),
        ZipError::InvalidPassword => ExtractError::PasswordIncorrect,
        ZipError::UnsupportedArchive(msg) if msg.contains("Password") => {
            ExtractError::PasswordRequired
        }
        other => ExtractError::Corrupt(other.to_string()),
    }
}

/// Extract `archive` into `dest`, creating it if absent.
///
/// Emits one progress event per entry, in increasing entry-index order.
/// Skipped entries (filter or overwrite policy) still produce a progress
/// event so the listener's index/total accounting stays dense.
pub fn extract<R: UpdateReporter + ?Sized>(
    archive: &Path,
    dest: &Path,
    options: &ExtractOptions,
    reporter: &R,
) -> Result<ExtractionResult, ExtractError> {
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(map_zip_error)?;
    let total = zip.len();

    let mut extracted = 0usize;
    let mut skipped = Vec::new();

    for index in 0..total {
        let mut entry = match &options.password {
            Some(pw) => zip.by_index_decrypt(index, pw.as_bytes()),
            None => zip.by_index(index),
        }
        .map_err(map_zip_error)?;

        let name = entry.name().to_string();
        reporter.extracting(&ExtractProgress {
            entry: &name,
            compressed_size: entry.compressed_size(),
            uncompressed_size: entry.size(),
            index,
            total,
        });

        // Reject anything that would land outside the destination.
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = %name, "rejecting archive entry escaping destination");
            return Err(ExtractError::Traversal(name));
        };
        let target = dest.join(relative);

        if let Some(filter) = &options.filter {
            if !filter(archive, &name) {
                skipped.push(name);
                continue;
            }
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if target.exists() && !options.overwrite {
            skipped.push(name);
            continue;
        }

        let parent = target.parent().unwrap_or(dest);
        std::fs::create_dir_all(parent)?;

        // Write to a temp name in the final parent, then rename into place.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::copy(&mut entry, tmp.as_file_mut()).map_err(|e| {
            // A short read on an encrypted entry usually means a CRC failure
            // from a wrong key rather than a bad disk.
            if options.password.is_some() && e.kind() == std::io::ErrorKind::InvalidData {
                ExtractError::PasswordIncorrect
            } else if e.kind() == std::io::ErrorKind::InvalidData {
                ExtractError::Corrupt(e.to_string())
            } else {
                ExtractError::Io(e)
            }
        })?;
        tmp.as_file_mut().sync_all()?;

        #[cfg(unix)]
        if options.preserve_attributes {
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(std::fs::Permissions::from_mode(mode))?;
            }
        }

        tmp.persist(&target).map_err(|e| ExtractError::Io(e.error))?;
        extracted += 1;
    }

    Ok(ExtractionResult {
        destination: dest.to_path_buf(),
        extracted,
        skipped,
    })
}
