//! The on-disk bundle store: which bundle versions are installed, which one
//! the host application boots from, and the atomic switch between them.
//!
//! The active bundle is named by a single marker file. Activation writes the
//! new marker content to a temporary name and renames it over the marker,
//! so any reader of `current_bundle_url()` observes either the old or the
//! new target, never an intermediate. The manager is the only writer; the
//! host's boot path only ever reads.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ota_schema::{BUNDLE_META_FILE, BundleId, BundleStatus, BundleVersion, Sha256Digest};

use crate::error::ErrorKind;
use crate::extract::{ExtractOptions, extract};
use crate::paths::OtaHome;
use crate::reporter::NullReporter;

/// Errors produced by bundle store operations.
#[derive(Error, Debug)]
pub enum BundleError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata record could not be read or written.
    #[error("Metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    /// The requested id was rolled back before and is excluded from
    /// activation.
    #[error("Bundle '{0}' was previously marked corrupt")]
    CorruptTarget(BundleId),

    /// The marker names a directory that does not exist.
    #[error("Marker points at missing bundle '{0}'")]
    MissingBundle(BundleId),

    /// Rollback requested but there is no previous version to return to.
    /// This is the fatal class: the store cannot restore a prior state.
    #[error("No previous bundle recorded, cannot roll back")]
    NothingToRollBack,

    /// A marker file contains something that is not a bundle id.
    #[error("Invalid marker content: {0}")]
    InvalidMarker(String),
}

impl BundleError {
    /// Classify for the `failed` event taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Meta(_) => ErrorKind::Disk,
            Self::CorruptTarget(_) | Self::MissingBundle(_) => ErrorKind::ActivationFailed,
            Self::NothingToRollBack | Self::InvalidMarker(_) => ErrorKind::Fatal,
        }
    }
}

/// One line of the rollback diagnostics log.
#[derive(Debug, Serialize, Deserialize)]
struct RollbackRecord {
    at: chrono::DateTime<Utc>,
    from: BundleId,
    to: BundleId,
    reason: String,
}

/// Owns the installed bundle set and the active-bundle marker.
#[derive(Debug)]
pub struct BundleManager {
    home: OtaHome,
    retention: usize,
}

impl BundleManager {
    /// Open (and lay out, if needed) the bundle store under `home`.
    ///
    /// `retention` is the number of inactive bundle versions kept around
    /// after pruning.
    pub fn open(home: OtaHome, retention: usize) -> Result<Self, BundleError> {
        home.ensure_layout()?;
        Ok(Self { home, retention })
    }

    /// The store's root layout.
    pub fn home(&self) -> &OtaHome {
        &self.home
    }

    fn read_marker(&self, marker: &Path) -> Result<Option<BundleId>, BundleError> {
        let content = match std::fs::read_to_string(marker) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = BundleId::new(content.trim())
            .map_err(|e| BundleError::InvalidMarker(e.to_string()))?;
        Ok(Some(id))
    }

    /// Atomically repoint a marker: write a temp file next to it, then
    /// rename over the marker. The rename is the only moment the marker's
    /// observable content changes.
    fn write_marker(&self, marker: &Path, id: &BundleId) -> Result<(), BundleError> {
        let parent = marker.parent().unwrap_or(self.home.root());
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        use std::io::Write;
        tmp.write_all(id.as_str().as_bytes())?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(marker).map_err(|e| BundleError::Io(e.error))?;
        Ok(())
    }

    fn read_meta(&self, id: &BundleId) -> Result<Option<BundleVersion>, BundleError> {
        let path = self.home.bundle_dir(id.as_str()).join(BUNDLE_META_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_meta(&self, version: &BundleVersion) -> Result<(), BundleError> {
        let path = version.path.join(BUNDLE_META_FILE);
        let json = serde_json::to_string_pretty(version)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// The id the marker currently names, if any.
    pub fn current_id(&self) -> Result<Option<BundleId>, BundleError> {
        self.read_marker(&self.home.current_marker())
    }

    /// The currently-active bundle version record.
    pub fn current_bundle(&self) -> Result<Option<BundleVersion>, BundleError> {
        match self.current_id()? {
            Some(id) => self.read_meta(&id),
            None => Ok(None),
        }
    }

    /// Directory the host application should boot from, if a bundle is
    /// active. Reading the marker is a single small-file read; the writer
    /// only ever replaces it atomically.
    pub fn current_bundle_url(&self) -> Option<PathBuf> {
        let id = self.current_id().ok().flatten()?;
        let dir = self.home.bundle_dir(id.as_str());
        dir.exists().then_some(dir)
    }

    /// Move `staged_dir` into the store as bundle `id` and make it current.
    ///
    /// The staging directory must live under the store's tmp dir (same
    /// volume) so the move is a rename. The previous active id is recorded
    /// as the rollback target before the marker is repointed.
    pub fn activate(
        &self,
        staged_dir: &Path,
        id: &BundleId,
    ) -> Result<BundleVersion, BundleError> {
        if let Some(meta) = self.read_meta(id)? {
            if meta.status == BundleStatus::Corrupt {
                return Err(BundleError::CorruptTarget(id.clone()));
            }
        }

        let dest = self.home.bundle_dir(id.as_str());
        if dest.exists() {
            // Re-activation of an installed, non-corrupt version: drop the
            // fresh copy and switch to what is already on disk.
            std::fs::remove_dir_all(staged_dir)?;
        } else {
            std::fs::rename(staged_dir, &dest)?;
        }

        let version = BundleVersion {
            id: id.clone(),
            path: dest,
            activated_at: Some(Utc::now()),
            status: BundleStatus::Active,
        };
        self.write_meta(&version)?;

        let previous = self.current_id()?;
        if let Some(prev) = &previous {
            if prev != id {
                self.write_marker(&self.home.previous_marker(), prev)?;
                if let Some(mut meta) = self.read_meta(prev)? {
                    // Superseded, not rolled back: it stays eligible for
                    // reactivation.
                    meta.status = BundleStatus::Staged;
                    self.write_meta(&meta)?;
                }
            }
        }

        // The single atomic repoint.
        self.write_marker(&self.home.current_marker(), id)?;
        tracing::info!(bundle = %id, previous = ?previous, "activated bundle");

        Ok(version)
    }

    /// Revert the marker to the previous version. With `condemn` the
    /// deactivated bundle is marked corrupt and excluded from future
    /// activations; without it (a cancelled run, not a boot failure) the
    /// bundle stays eligible for reactivation.
    pub fn rollback(&self, reason: &str, condemn: bool) -> Result<BundleVersion, BundleError> {
        let failed = self
            .current_id()?
            .ok_or(BundleError::NothingToRollBack)?;
        let target = self
            .read_marker(&self.home.previous_marker())?
            .ok_or(BundleError::NothingToRollBack)?;

        let target_dir = self.home.bundle_dir(target.as_str());
        if !target_dir.exists() {
            return Err(BundleError::MissingBundle(target));
        }

        self.write_marker(&self.home.current_marker(), &target)?;
        // A second rollback without a fresh activation has no target.
        let _ = std::fs::remove_file(self.home.previous_marker());

        if let Some(mut meta) = self.read_meta(&failed)? {
            meta.status = if condemn {
                BundleStatus::Corrupt
            } else {
                BundleStatus::RolledBack
            };
            self.write_meta(&meta)?;
        }
        let restored = match self.read_meta(&target)? {
            Some(mut meta) => {
                meta.status = BundleStatus::Active;
                self.write_meta(&meta)?;
                meta
            }
            None => BundleVersion {
                id: target.clone(),
                path: target_dir,
                activated_at: None,
                status: BundleStatus::Active,
            },
        };

        self.append_rollback_log(&failed, &target, reason);
        tracing::warn!(from = %failed, to = %target, reason, "rolled back bundle");

        Ok(restored)
    }

    fn append_rollback_log(&self, from: &BundleId, to: &BundleId, reason: &str) {
        let record = RollbackRecord {
            at: Utc::now(),
            from: from.clone(),
            to: to.clone(),
            reason: reason.to_string(),
        };
        // Diagnostics only; never fail an operation over the log.
        if let Ok(line) = serde_json::to_string(&record) {
            use std::io::Write;
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.home.rollback_log())
            {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    /// List every installed bundle version that has a metadata record.
    pub fn installed(&self) -> Result<Vec<BundleVersion>, BundleError> {
        let mut versions = Vec::new();
        let entries = match std::fs::read_dir(self.home.bundles_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(id) = BundleId::new(entry.file_name().to_string_lossy()) else {
                continue;
            };
            if let Some(meta) = self.read_meta(&id)? {
                versions.push(meta);
            }
        }
        Ok(versions)
    }

    /// Delete inactive bundles beyond the retention count, oldest first.
    /// Never deletes the active bundle, and keeps the rollback target while
    /// a rollback window is still open.
    pub fn prune(&self, rollback_window_open: bool) -> Result<usize, BundleError> {
        let active = self.current_id()?;
        let previous = if rollback_window_open {
            self.read_marker(&self.home.previous_marker())?
        } else {
            None
        };

        let mut candidates: Vec<BundleVersion> = self
            .installed()?
            .into_iter()
            .filter(|v| Some(&v.id) != active.as_ref() && Some(&v.id) != previous.as_ref())
            .collect();
        // Oldest first; never-activated bundles sort before any activated one.
        candidates.sort_by_key(|v| v.activated_at);

        let mut removed = 0;
        while candidates.len() > self.retention {
            let victim = candidates.remove(0);
            tracing::info!(bundle = %victim.id, "pruning old bundle");
            std::fs::remove_dir_all(&victim.path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// First-boot bootstrap: install a seed archive shipped with the host
    /// application and make it current without a confirmation window.
    ///
    /// No-op if a bundle is already active. The seed's id is derived from
    /// the archive digest, mirroring how the artifact cache is keyed.
    pub fn import_seed(
        &self,
        archive: &Path,
        password: Option<&str>,
    ) -> Result<Option<BundleVersion>, BundleError> {
        if self.current_id()?.is_some() {
            return Ok(None);
        }

        let digest: Sha256Digest = crate::verify::hash_file(archive)?;
        let id = BundleId::new(format!("seed-{}", &digest.as_str()[..16]))
            .map_err(|e| BundleError::InvalidMarker(e.to_string()))?;

        let staging = tempfile::Builder::new()
            .prefix("seed-")
            .tempdir_in(self.home.tmp_dir())?;
        let options = ExtractOptions {
            overwrite: true,
            password: password.map(str::to_string),
            ..ExtractOptions::default()
        };
        extract(archive, staging.path(), &options, &NullReporter)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        // Keep the directory; activation renames it into the store.
        let staged = staging.keep();
        let version = self.activate(&staged, &id)?;
        tracing::info!(bundle = %id, "imported seed bundle");
        Ok(Some(version))
    }
}
