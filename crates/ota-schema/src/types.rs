//! Bundle identifiers and version records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of an installed (or installable) bundle version.
///
/// Doubles as the on-disk directory name of the bundle, so it must be
/// non-empty and must not contain path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BundleId(String);

/// Errors that can occur when validating a [`BundleId`].
#[derive(thiserror::Error, Debug)]
pub enum BundleIdError {
    /// The identifier is empty.
    #[error("Bundle id must not be empty")]
    Empty,

    /// The identifier contains a character that is unsafe in a directory name.
    #[error("Bundle id '{0}' contains a path separator or '.' segment")]
    Unsafe(String),
}

impl BundleId {
    /// Create a validated `BundleId`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleIdError`] if the id is empty, contains `/` or `\`,
    /// or is one of the relative path segments `.` / `..`.
    pub fn new(s: impl Into<String>) -> Result<Self, BundleIdError> {
        let s = s.into();
        if s.is_empty() {
            return Err(BundleIdError::Empty);
        }
        if s.contains('/') || s.contains('\\') || s == "." || s == ".." {
            return Err(BundleIdError::Unsafe(s));
        }
        Ok(Self(s))
    }

    /// Return the inner identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for BundleId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BundleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of an installed bundle version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    /// Installed but not currently active.
    Staged,
    /// The bundle the marker currently points at (at most one).
    Active,
    /// Deactivated by a rollback that did not condemn it (a cancelled run
    /// rather than a boot failure); eligible for reactivation.
    #[serde(rename = "rolled-back")]
    RolledBack,
    /// Failed to boot within the confirmation window; excluded from
    /// future activation attempts.
    Corrupt,
}

/// Metadata record for one installed bundle version.
///
/// Persisted as `.ota-meta.json` inside the bundle directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleVersion {
    /// Version identifier; also the directory name under `bundles/`.
    pub id: BundleId,

    /// Absolute path of the bundle directory.
    pub path: PathBuf,

    /// When this bundle was last made current, if ever.
    pub activated_at: Option<DateTime<Utc>>,

    /// Current lifecycle status.
    pub status: BundleStatus,
}
