//! Reporter trait for dependency injection.
//!
//! The pipeline reports progress and lifecycle events without being coupled
//! to the host application shell. Implementations must be fire-and-forget:
//! the pipeline worker calls these methods inline, so a listener that needs
//! to do real work should queue the event and return immediately.
//! Extraction progress arrives in increasing entry-index order.

use ota_schema::{BundleId, UpdateManifest};

use crate::controller::PipelineState;
use crate::error::ErrorKind;
use crate::extract::ExtractProgress;

/// Observer of pipeline lifecycle events, progress and outcomes.
pub trait UpdateReporter: Send + Sync {
    /// The pipeline state machine moved to a new state.
    fn state_changed(&self, state: PipelineState);

    /// A check found a newer bundle than the one currently active.
    fn update_available(&self, manifest: &UpdateManifest);

    /// A check completed and the active bundle is already the latest.
    fn no_update(&self);

    /// Download progress in bytes.
    fn downloading(&self, received: u64, total: Option<u64>);

    /// Extraction progress, one event per archive entry.
    fn extracting(&self, progress: &ExtractProgress<'_>);

    /// A newly activated bundle was confirmed and committed.
    fn committed(&self, id: &BundleId);

    /// An activation was reverted to the previous bundle.
    fn rolled_back(&self, from: &BundleId, to: &BundleId);

    /// The pipeline run terminated with an error.
    fn failed(&self, kind: ErrorKind, detail: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: UpdateReporter + ?Sized> UpdateReporter for std::sync::Arc<T> {
    fn state_changed(&self, state: PipelineState) {
        (**self).state_changed(state);
    }
    fn update_available(&self, manifest: &UpdateManifest) {
        (**self).update_available(manifest);
    }
    fn no_update(&self) {
        (**self).no_update();
    }
    fn downloading(&self, received: u64, total: Option<u64>) {
        (**self).downloading(received, total);
    }
    fn extracting(&self, progress: &ExtractProgress<'_>) {
        (**self).extracting(progress);
    }
    fn committed(&self, id: &BundleId) {
        (**self).committed(id);
    }
    fn rolled_back(&self, from: &BundleId, to: &BundleId) {
        (**self).rolled_back(from, to);
    }
    fn failed(&self, kind: ErrorKind, detail: &str) {
        (**self).failed(kind, detail);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., seed import, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl UpdateReporter for NullReporter {
    fn state_changed(&self, _: PipelineState) {}
    fn update_available(&self, _: &UpdateManifest) {}
    fn no_update(&self) {}
    fn downloading(&self, _: u64, _: Option<u64>) {}
    fn extracting(&self, _: &ExtractProgress<'_>) {}
    fn committed(&self, _: &BundleId) {}
    fn rolled_back(&self, _: &BundleId, _: &BundleId) {}
    fn failed(&self, _: ErrorKind, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
}
