//! The update manifest: the server's descriptor of the latest available
//! bundle for an application.
//!
//! Fetched as JSON from the bundle server's `check` endpoint and immutable
//! once parsed. Validation of the digest and version id happens at
//! deserialization time via the newtypes.

use crate::hash::Sha256Digest;
use crate::types::BundleId;
use serde::{Deserialize, Serialize};

/// Remote descriptor of an available bundle update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Target bundle version id.
    pub version: BundleId,

    /// Download URL of the bundle archive.
    pub url: String,

    /// Expected SHA-256 digest of the archive.
    pub sha256: Sha256Digest,

    /// Whether the archive entries are password protected.
    #[serde(default)]
    pub encrypted: bool,

    /// Detached signature over the archive, if the server provides one.
    /// Carried but not verified; see DESIGN.md.
    #[serde(default)]
    pub signature: Option<String>,

    /// Minimum host application version this bundle supports.
    #[serde(default)]
    pub min_app_version: Option<String>,
}

impl UpdateManifest {
    /// Parse a manifest from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON or fails field
    /// validation (bad digest, unsafe version id, empty URL).
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let manifest: Self = serde_json::from_str(body)?;
        if manifest.url.is_empty() {
            return Err(serde::de::Error::custom("manifest url must not be empty"));
        }
        Ok(manifest)
    }
}
