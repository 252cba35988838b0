//! On-disk layout of the update store.
//!
//! Everything lives under a single root so that staging directories and the
//! bundle store share a volume, keeping `rename` atomic.

use std::path::{Path, PathBuf};

use dirs::home_dir;

/// Root of the persisted update state for one application.
///
/// ```text
/// <root>/bundles/<bundle-id>/          one directory per installed bundle
/// <root>/current                       marker file naming the active id
/// <root>/previous                      marker naming the rollback target
/// <root>/tmp/                          staging + partial downloads
/// <root>/rollbacks.log                 JSON-lines diagnostics
/// ```
#[derive(Debug, Clone)]
pub struct OtaHome {
    root: PathBuf,
}

impl OtaHome {
    /// Create a home rooted at an explicit directory (the host application's
    /// sandbox or data directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the default home: `$OTA_HOME` if set, otherwise
    /// `~/.ota/<app_id>`. Returns `None` if the user's home cannot be
    /// resolved.
    pub fn try_default(app_id: &str) -> Option<Self> {
        if let Ok(val) = std::env::var("OTA_HOME") {
            return Some(Self::new(PathBuf::from(val).join(app_id)));
        }
        home_dir().map(|h| Self::new(h.join(".ota").join(app_id)))
    }

    /// The root directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subdirectory per installed bundle version.
    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("bundles")
    }

    /// Directory of a specific bundle version.
    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        self.bundles_dir().join(id)
    }

    /// Marker file naming the currently-active bundle id.
    pub fn current_marker(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Marker file naming the rollback target (the previously-active id).
    pub fn previous_marker(&self) -> PathBuf {
        self.root.join("previous")
    }

    /// Scratch space for partial downloads and staging directories.
    /// Guaranteed same volume as the bundle store.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Diagnostics log of recent rollbacks (JSON lines).
    pub fn rollback_log(&self) -> PathBuf {
        self.root.join("rollbacks.log")
    }

    /// Create the directory skeleton if it does not exist yet.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.bundles_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }
}
