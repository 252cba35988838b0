//! Domain-specific errors for the update pipeline.
//!
//! Each stage keeps its own error enum (`FetchError`, `ExtractError`, ...)
//! and [`OtaError`] is the top-level type the controller surfaces to the
//! host shell, classified by [`ErrorKind`].

use thiserror::Error;

use crate::bundle::BundleError;
use crate::extract::ExtractError;
use crate::fetch::FetchError;
use crate::verify::VerifyError;

/// Stable classification of pipeline failures, delivered with `failed`
/// events so the host shell can react without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient transport failure; retried internally before surfacing.
    Network,
    /// The server's manifest could not be parsed or failed validation.
    ManifestInvalid,
    /// Downloaded artifact's hash did not match the manifest; artifact discarded.
    IntegrityMismatch,
    /// The archive is unreadable or structurally invalid.
    ArchiveCorrupt,
    /// The archive is encrypted and no passphrase was configured.
    PasswordRequired,
    /// The configured passphrase did not decrypt the archive.
    PasswordIncorrect,
    /// An archive entry attempted to escape the destination directory.
    PathTraversalRejected,
    /// Filesystem failure (disk full, permissions, ...).
    Disk,
    /// The new bundle could not be made current; rollback was attempted.
    ActivationFailed,
    /// The host shell did not confirm boot within the grace period.
    ConfirmationTimeout,
    /// The run was cancelled at a step boundary.
    Cancelled,
    /// A pipeline run was already in progress.
    Busy,
    /// Rollback itself failed; the marker may need manual repair.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::ManifestInvalid => "manifest-invalid",
            Self::IntegrityMismatch => "integrity-mismatch",
            Self::ArchiveCorrupt => "archive-corrupt",
            Self::PasswordRequired => "password-required",
            Self::PasswordIncorrect => "password-incorrect",
            Self::PathTraversalRejected => "path-traversal-rejected",
            Self::Disk => "disk",
            Self::ActivationFailed => "activation-failed",
            Self::ConfirmationTimeout => "confirmation-timeout",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum OtaError {
    /// Checking or downloading failed.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Integrity verification failed.
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// Extraction failed.
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// Bundle store operation failed.
    #[error("Bundle operation failed: {0}")]
    Bundle(#[from] BundleError),

    /// Filesystem failure outside a specific stage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled between steps.
    #[error("Pipeline cancelled")]
    Cancelled,

    /// A run was requested while another was still in progress.
    #[error("A pipeline run is already in progress")]
    Busy,
}

impl OtaError {
    /// Classify this error for the `failed` event taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Verify(VerifyError::Io(_)) => ErrorKind::Disk,
            Self::Verify(VerifyError::Mismatch { .. }) => ErrorKind::IntegrityMismatch,
            Self::Extract(e) => e.kind(),
            Self::Bundle(e) => e.kind(),
            Self::Io(_) => ErrorKind::Disk,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Busy => ErrorKind::Busy,
        }
    }
}
