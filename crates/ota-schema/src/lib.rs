//! Shared types for the OTA update pipeline: validated hashes, bundle
//! identifiers and status records, and the server-provided update manifest.

pub mod hash;
pub mod manifest;
pub mod types;

// Re-exports
pub use hash::Sha256Digest;
pub use manifest::UpdateManifest;
pub use types::{BundleId, BundleStatus, BundleVersion};

/// Name of the per-bundle metadata record written next to its contents.
pub const BUNDLE_META_FILE: &str = ".ota-meta.json";
