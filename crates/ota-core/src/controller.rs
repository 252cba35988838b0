//! Pipeline orchestration: check, download, verify, extract, activate,
//! await confirmation, commit or roll back.
//!
//! One background worker drives a run sequentially; the caller never blocks.
//! Cancellation is observed at the checkpoint between steps. The worker is
//! the only writer of the marker and the bundle set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use ota_schema::{BundleId, BundleVersion};

use crate::bundle::BundleManager;
use crate::error::OtaError;
use crate::extract::{EntryFilter, ExtractOptions};
use crate::fetch::{ServerConfig, UpdateFetcher};
use crate::paths::OtaHome;
use crate::reporter::UpdateReporter;

/// States of one pipeline run.
///
/// Forward transitions require the prior step's success; any failure goes
/// directly to [`Failed`](Self::Failed). After a terminal state the
/// controller returns to [`Idle`](Self::Idle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No run in progress.
    Idle,
    /// Asking the server for a manifest.
    Checking,
    /// Streaming the artifact to disk.
    Downloading,
    /// Re-hashing the artifact against the manifest digest.
    Verifying,
    /// Unpacking into a staging directory.
    Extracting,
    /// Moving the staged bundle into the store and repointing the marker.
    Activating,
    /// Activated; waiting for the host shell to confirm a successful boot.
    AwaitingConfirmation,
    /// Confirmed within the grace period; the new bundle is permanent.
    Committed,
    /// Confirmation missed or refused; the previous bundle was restored.
    RolledBack,
    /// The run aborted before any activation occurred.
    Failed,
    /// The run was cancelled at a step boundary.
    Cancelled,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::Activating => "activating",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Process-wide configuration, set once before the first run and immutable
/// thereafter (reconfiguration requires a fresh controller).
#[derive(Clone)]
pub struct OtaConfig {
    /// Application identifier sent with update checks.
    pub app_id: String,
    /// Passphrase for encrypted bundle archives.
    pub passphrase: Option<String>,
    /// Which server this installation talks to.
    pub server: ServerConfig,
    /// Root directory of the persisted update state.
    pub root: PathBuf,
    /// Per-network-operation timeout.
    pub network_timeout: Duration,
    /// Grace period for `confirm_boot_success` after an activation.
    pub confirmation_timeout: Duration,
    /// Bounded retry count for transient network failures.
    pub max_retries: u32,
    /// Inactive bundle versions kept after pruning.
    pub retention: usize,
    /// Queue one follow-up run instead of rejecting checks while busy.
    pub queue_checks: bool,
    /// Optional per-entry extraction predicate.
    pub extract_filter: Option<EntryFilter>,
}

impl OtaConfig {
    /// Configuration with production defaults.
    pub fn new(app_id: impl Into<String>, server: ServerConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            app_id: app_id.into(),
            passphrase: None,
            server,
            root: root.into(),
            network_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(30),
            max_retries: 3,
            retention: 2,
            queue_checks: false,
            extract_filter: None,
        }
    }

    /// Configuration rooted at the default per-application store:
    /// `$OTA_HOME/<app_id>` if set, otherwise `~/.ota/<app_id>`.
    /// Returns `None` if no home directory can be resolved.
    pub fn with_default_root(app_id: impl Into<String>, server: ServerConfig) -> Option<Self> {
        let app_id = app_id.into();
        let home = OtaHome::try_default(&app_id)?;
        let root = home.root().to_path_buf();
        Some(Self::new(app_id, server, root))
    }
}

impl std::fmt::Debug for OtaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaConfig")
            .field("app_id", &self.app_id)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("server", &self.server)
            .field("root", &self.root)
            .field("network_timeout", &self.network_timeout)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("max_retries", &self.max_retries)
            .field("retention", &self.retention)
            .field("queue_checks", &self.queue_checks)
            .field("extract_filter", &self.extract_filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

struct Inner {
    config: OtaConfig,
    fetcher: UpdateFetcher,
    bundles: BundleManager,
    reporter: Arc<dyn UpdateReporter>,
    state: Mutex<PipelineState>,
    queued: AtomicBool,
    confirm_tx: Mutex<Option<oneshot::Sender<()>>>,
    run_cancel: Mutex<CancellationToken>,
}

/// Drives the update pipeline for one application installation.
pub struct OtaController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OtaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaController")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}

impl OtaController {
    /// Build a controller from immutable configuration.
    pub fn new(
        config: OtaConfig,
        reporter: Arc<dyn UpdateReporter>,
    ) -> Result<Self, OtaError> {
        let home = OtaHome::new(&config.root);
        let bundles = BundleManager::open(home.clone(), config.retention)?;

        let client = reqwest::Client::builder()
            .timeout(config.network_timeout)
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(crate::fetch::FetchError::Http)?;
        let fetcher = UpdateFetcher::new(
            client,
            config.server.clone(),
            config.app_id.clone(),
            home.tmp_dir(),
            config.max_retries,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                bundles,
                reporter,
                state: Mutex::new(PipelineState::Idle),
                queued: AtomicBool::new(false),
                confirm_tx: Mutex::new(None),
                run_cancel: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// The state of the current (or last) run.
    pub fn state(&self) -> PipelineState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// Directory the host shell should boot from, if a bundle is active.
    /// Safe to call concurrently with a run: the marker is only ever
    /// replaced atomically.
    pub fn current_bundle_url(&self) -> Option<PathBuf> {
        self.inner.bundles.current_bundle_url()
    }

    /// Id of the active bundle, if any.
    pub fn last_hash(&self) -> Option<BundleId> {
        self.inner.bundles.current_id().ok().flatten()
    }

    /// First-boot bootstrap from an archive shipped with the application.
    /// No-op when a bundle is already active.
    pub fn bootstrap_from_archive(
        &self,
        archive: &std::path::Path,
    ) -> Result<Option<BundleVersion>, OtaError> {
        Ok(self
            .inner
            .bundles
            .import_seed(archive, self.inner.config.passphrase.as_deref())?)
    }

    /// Confirm that the host shell booted the newly activated bundle.
    /// Outside a confirmation window this is a no-op.
    pub fn confirm_boot_success(&self) {
        let tx = self
            .inner
            .confirm_tx
            .lock()
            .expect("confirm lock poisoned")
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Request cancellation of the in-flight run. Observed at the next
    /// step boundary; a committed bundle is never touched.
    pub fn cancel(&self) {
        self.inner
            .run_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    /// Start a pipeline run on a background worker.
    ///
    /// Returns immediately. While a run is in progress another request is
    /// rejected with [`OtaError::Busy`], or queued (at most one) when
    /// `queue_checks` is configured.
    ///
    /// Must be called from within a tokio runtime.
    pub fn check_for_update(&self) -> Result<(), OtaError> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state != PipelineState::Idle {
                if self.inner.config.queue_checks {
                    self.inner.queued.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                return Err(OtaError::Busy);
            }
            *state = PipelineState::Checking;
        }
        self.inner.reporter.state_changed(PipelineState::Checking);

        let cancel = CancellationToken::new();
        *self.inner.run_cancel.lock().expect("cancel lock poisoned") = cancel.clone();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut cancel = cancel;
            loop {
                let result = run_once(&inner, &cancel).await;
                match result {
                    Ok(()) => {}
                    Err(OtaError::Cancelled) => {
                        set_state(&inner, PipelineState::Cancelled);
                        inner.reporter.info("update run cancelled");
                    }
                    Err(e) => {
                        let kind = e.kind();
                        tracing::error!(%kind, "pipeline run failed: {e}");
                        set_state(&inner, PipelineState::Failed);
                        inner.reporter.failed(kind, &e.to_string());
                    }
                }

                // Hand off under the state lock: consuming the queued flag
                // and leaving Idle must be a single step, or a caller could
                // claim the worker slot while this loop also continues.
                let follow_up = {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    if inner.queued.swap(false, Ordering::SeqCst) {
                        *state = PipelineState::Checking;
                        true
                    } else {
                        *state = PipelineState::Idle;
                        false
                    }
                };
                let next = if follow_up {
                    PipelineState::Checking
                } else {
                    PipelineState::Idle
                };
                tracing::debug!(state = %next, "pipeline state changed");
                inner.reporter.state_changed(next);
                if !follow_up {
                    break;
                }

                // Each run gets its own cancellation scope.
                cancel = CancellationToken::new();
                *inner.run_cancel.lock().expect("cancel lock poisoned") = cancel.clone();
            }
        });

        Ok(())
    }
}

fn set_state(inner: &Inner, state: PipelineState) {
    *inner.state.lock().expect("state lock poisoned") = state;
    tracing::debug!(%state, "pipeline state changed");
    inner.reporter.state_changed(state);
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), OtaError> {
    if cancel.is_cancelled() {
        return Err(OtaError::Cancelled);
    }
    Ok(())
}

/// One full pipeline run. The caller owns terminal-state bookkeeping for
/// `Failed` and `Cancelled`; this function reports the other states.
async fn run_once(inner: &Arc<Inner>, cancel: &CancellationToken) -> Result<(), OtaError> {
    // Checking was already entered by the claim in check_for_update; a
    // queued follow-up run re-enters it via the worker loop.
    let current = inner.bundles.current_id()?;
    let manifest = inner.fetcher.check_for_update(current.as_ref()).await?;
    let Some(manifest) = manifest else {
        tracing::info!("no update available");
        inner.reporter.no_update();
        return Ok(());
    };
    tracing::info!(version = %manifest.version, url = %manifest.url, "update available");
    inner.reporter.update_available(&manifest);
    checkpoint(cancel)?;

    set_state(inner, PipelineState::Downloading);
    let artifact = inner.fetcher.download(&manifest, &inner.reporter).await?;
    if cancel.is_cancelled() {
        artifact.discard();
        return Err(OtaError::Cancelled);
    }

    set_state(inner, PipelineState::Verifying);
    {
        let path = artifact.path.clone();
        let expected = manifest.sha256.clone();
        tokio::task::spawn_blocking(move || crate::verify::verify(&path, &expected))
            .await
            .map_err(std::io::Error::other)??;
    }
    checkpoint(cancel)?;

    set_state(inner, PipelineState::Extracting);
    let staging = tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(inner.bundles.home().tmp_dir())?;
    let extract_result = {
        let archive = artifact.path.clone();
        let dest = staging.path().to_path_buf();
        let options = ExtractOptions {
            preserve_attributes: true,
            overwrite: true,
            password: manifest
                .encrypted
                .then(|| inner.config.passphrase.clone())
                .flatten(),
            filter: inner.config.extract_filter.clone(),
        };
        let reporter = Arc::clone(&inner.reporter);
        tokio::task::spawn_blocking(move || {
            crate::extract::extract(&archive, &dest, &options, &reporter)
        })
        .await
        .map_err(std::io::Error::other)?
    };
    // The artifact is spent once extraction ran, whatever the outcome.
    artifact.discard();
    let extraction = extract_result?;
    if !extraction.skipped.is_empty() {
        tracing::debug!(count = extraction.skipped.len(), "entries skipped during extraction");
    }
    // On cancel the staging TempDir drop cleans up the partial bundle.
    checkpoint(cancel)?;

    set_state(inner, PipelineState::Activating);
    let staged = staging.keep();
    let version = match inner.bundles.activate(&staged, &manifest.version) {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staged);
            // The marker repoint is the last step of activation, so a failed
            // activation never leaves the new bundle current; there is
            // nothing to roll back.
            return Err(e.into());
        }
    };

    let (tx, rx) = oneshot::channel();
    *inner.confirm_tx.lock().expect("confirm lock poisoned") = Some(tx);
    // The window must be open before the state event fires: a listener may
    // confirm synchronously from state_changed.
    set_state(inner, PipelineState::AwaitingConfirmation);

    let confirmed = tokio::select! {
        result = rx => result.is_ok(),
        () = tokio::time::sleep(inner.config.confirmation_timeout) => false,
        () = cancel.cancelled() => false,
    };
    // Close the window: a late confirm must not leak into a future run.
    inner
        .confirm_tx
        .lock()
        .expect("confirm lock poisoned")
        .take();

    if confirmed {
        set_state(inner, PipelineState::Committed);
        inner.reporter.committed(&version.id);
        tracing::info!(version = %version.id, "bundle committed");
    } else {
        // A cancelled run is not evidence the bundle is bad; only a missed
        // confirmation condemns it.
        let (reason, condemn) = if cancel.is_cancelled() {
            ("cancelled during confirmation window", false)
        } else {
            ("boot not confirmed within grace period", true)
        };
        let restored = inner.bundles.rollback(reason, condemn)?;
        set_state(inner, PipelineState::RolledBack);
        inner.reporter.rolled_back(&version.id, &restored.id);
    }

    if let Err(e) = inner.bundles.prune(false) {
        inner.reporter.warning(&format!("pruning old bundles failed: {e}"));
    }

    Ok(())
}
