//! OTA bundle update pipeline.
//!
//! The pipeline fetches a versioned manifest from a bundle server, downloads
//! and verifies the package, extracts it into a staging directory, and
//! atomically switches the running application to the new bundle with
//! rollback on failure. The host application shell drives it through
//! [`controller::OtaController`] and observes it through
//! [`reporter::UpdateReporter`].

pub mod bundle;
pub mod controller;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod paths;
pub mod reporter;
pub mod verify;

pub use controller::{OtaConfig, OtaController, PipelineState};
pub use error::{ErrorKind, OtaError};
pub use paths::OtaHome;
pub use reporter::{NullReporter, UpdateReporter};

/// User Agent string for update checks and downloads.
pub const USER_AGENT: &str = concat!("ota-core/", env!("CARGO_PKG_VERSION"));
