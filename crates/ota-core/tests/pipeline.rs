//! End-to-end pipeline scenarios against a mock bundle server: commit,
//! timeout rollback, and integrity failure.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use ota_core::bundle::BundleManager;
use ota_core::controller::{OtaConfig, OtaController, PipelineState};
use ota_core::extract::ExtractProgress;
use ota_core::fetch::ServerConfig;
use ota_core::paths::OtaHome;
use ota_core::reporter::UpdateReporter;
use ota_core::ErrorKind;
use ota_schema::{BundleId, BundleStatus, BundleVersion, UpdateManifest};

/// Reporter that records every event as a line for assertions.
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }

    fn contains(&self, needle: &str) -> bool {
        self.0.lock().unwrap().iter().any(|l| l.contains(needle))
    }

    fn count(&self, needle: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }

    async fn wait_for(&self, needle: &str) {
        self.wait_for_count(needle, 1).await;
    }

    async fn wait_for_count(&self, needle: &str, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.count(needle) < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n}x event '{needle}', saw: {:?}",
                self.0.lock().unwrap()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl UpdateReporter for EventLog {
    fn state_changed(&self, state: PipelineState) {
        self.push(format!("state:{state}"));
    }
    fn update_available(&self, manifest: &UpdateManifest) {
        self.push(format!("update-available:{}", manifest.version));
    }
    fn no_update(&self) {
        self.push("no-update".to_string());
    }
    fn downloading(&self, _: u64, _: Option<u64>) {}
    fn extracting(&self, progress: &ExtractProgress<'_>) {
        self.push(format!("extracting:{}", progress.entry));
    }
    fn committed(&self, id: &BundleId) {
        self.push(format!("committed:{id}"));
    }
    fn rolled_back(&self, from: &BundleId, to: &BundleId) {
        self.push(format!("rolled-back:{from}->{to}"));
    }
    fn failed(&self, kind: ErrorKind, detail: &str) {
        self.push(format!("failed:{kind}:{detail}"));
    }
    fn info(&self, msg: &str) {
        self.push(format!("info:{msg}"));
    }
    fn warning(&self, msg: &str) {
        self.push(format!("warning:{msg}"));
    }
}

/// Reporter standing in for a host shell that confirms the moment it sees
/// the confirmation window open.
struct EagerConfirm {
    log: Arc<EventLog>,
    controller: Mutex<Option<Arc<OtaController>>>,
}

impl UpdateReporter for EagerConfirm {
    fn state_changed(&self, state: PipelineState) {
        self.log.state_changed(state);
        if state == PipelineState::AwaitingConfirmation {
            if let Some(controller) = self.controller.lock().unwrap().as_ref() {
                controller.confirm_boot_success();
            }
        }
    }
    fn update_available(&self, manifest: &UpdateManifest) {
        self.log.update_available(manifest);
    }
    fn no_update(&self) {
        self.log.no_update();
    }
    fn downloading(&self, received: u64, total: Option<u64>) {
        self.log.downloading(received, total);
    }
    fn extracting(&self, progress: &ExtractProgress<'_>) {
        self.log.extracting(progress);
    }
    fn committed(&self, id: &BundleId) {
        self.log.committed(id);
    }
    fn rolled_back(&self, from: &BundleId, to: &BundleId) {
        self.log.rolled_back(from, to);
    }
    fn failed(&self, kind: ErrorKind, detail: &str) {
        self.log.failed(kind, detail);
    }
    fn info(&self, msg: &str) {
        self.log.info(msg);
    }
    fn warning(&self, msg: &str) {
        self.log.warning(msg);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn bundle_zip(marker: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("main.jsbundle", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(marker.as_bytes()).unwrap();
    writer
        .start_file("assets/app.json", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"{}").unwrap();
    writer.finish().unwrap().into_inner()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn manifest_body(server_url: &str, version: &str, sha256: &str) -> String {
    format!(r#"{{"version":"{version}","url":"{server_url}/{version}.zip","sha256":"{sha256}"}}"#)
}

fn test_config(root: &Path, server_url: &str) -> OtaConfig {
    let mut config = OtaConfig::new(
        "app.example",
        ServerConfig::Production {
            base_url: server_url.to_string(),
        },
        root,
    );
    config.confirmation_timeout = Duration::from_secs(10);
    config.max_retries = 1;
    config
}

/// Install a v1 bundle directly through the bundle manager, standing in for
/// an earlier committed update.
fn preinstall_v1(root: &Path) -> PathBuf {
    let mgr = BundleManager::open(OtaHome::new(root), 2).unwrap();
    let staged = tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(mgr.home().tmp_dir())
        .unwrap()
        .keep();
    std::fs::write(staged.join("main.jsbundle"), "v1 code").unwrap();
    let version = mgr
        .activate(&staged, &BundleId::new("v1").unwrap())
        .unwrap();
    version.path
}

fn read_meta(root: &Path, id: &str) -> BundleVersion {
    let path = root.join("bundles").join(id).join(".ota-meta.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn full_update_commits_after_confirmation() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    let v1_path = preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let log = EventLog::new();
    let controller =
        OtaController::new(test_config(root.path(), &server.url()), log.clone()).unwrap();
    assert_eq!(controller.current_bundle_url().unwrap(), v1_path);

    controller.check_for_update().unwrap();

    log.wait_for("state:awaiting-confirmation").await;
    // The boot-path reader already observes the activated v2; it only ever
    // sees a fully-populated directory, old or new.
    let observed = controller.current_bundle_url().unwrap();
    assert!(observed.ends_with("bundles/v2"));

    controller.confirm_boot_success();
    log.wait_for("committed:v2").await;
    log.wait_for("state:idle").await;

    let url = controller.current_bundle_url().unwrap();
    assert!(url.ends_with("bundles/v2"));
    assert_eq!(
        std::fs::read_to_string(url.join("main.jsbundle")).unwrap(),
        "v2 code"
    );
    assert_eq!(controller.last_hash().unwrap().as_str(), "v2");
    assert!(log.contains("extracting:main.jsbundle"));
    // The downloaded artifact was consumed.
    assert!(!root.path().join("tmp").join(&digest).exists());
}

#[tokio::test]
async fn synchronous_confirmation_from_state_event_commits() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let log = EventLog::new();
    let reporter = Arc::new(EagerConfirm {
        log: log.clone(),
        controller: Mutex::new(None),
    });
    let mut config = test_config(root.path(), &server.url());
    // Short window: if the inline confirmation were dropped, the run would
    // roll back quickly and the assertions below would catch it.
    config.confirmation_timeout = Duration::from_secs(1);
    let controller = Arc::new(OtaController::new(config, reporter.clone()).unwrap());
    *reporter.controller.lock().unwrap() = Some(Arc::clone(&controller));

    controller.check_for_update().unwrap();
    log.wait_for("committed:v2").await;
    log.wait_for("state:idle").await;
    assert!(!log.contains("rolled-back"));
    assert!(controller.current_bundle_url().unwrap().ends_with("bundles/v2"));
}

#[tokio::test]
async fn missing_confirmation_rolls_back_to_previous_bundle() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let log = EventLog::new();
    let mut config = test_config(root.path(), &server.url());
    config.confirmation_timeout = Duration::from_millis(200);
    let controller = OtaController::new(config, log.clone()).unwrap();

    controller.check_for_update().unwrap();
    // Never confirm; the window must expire and restore v1.
    log.wait_for("rolled-back:v2->v1").await;
    log.wait_for("state:idle").await;

    let url = controller.current_bundle_url().unwrap();
    assert!(url.ends_with("bundles/v1"));
    assert_eq!(read_meta(root.path(), "v2").status, BundleStatus::Corrupt);
    assert_eq!(read_meta(root.path(), "v1").status, BundleStatus::Active);
    // Diagnostics log recorded the rollback.
    let diag = std::fs::read_to_string(root.path().join("rollbacks.log")).unwrap();
    assert!(diag.contains("\"from\":\"v2\""));
}

#[tokio::test]
async fn tampered_download_fails_without_touching_active_bundle() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    // Serve different bytes than the manifest promises.
    let mut tampered = archive;
    tampered[10] ^= 0x01;
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(tampered)
        .create_async()
        .await;

    let log = EventLog::new();
    let controller =
        OtaController::new(test_config(root.path(), &server.url()), log.clone()).unwrap();

    controller.check_for_update().unwrap();
    log.wait_for("failed:integrity-mismatch").await;
    log.wait_for("state:idle").await;

    // No v2 bundle exists and v1 is untouched.
    assert!(!root.path().join("bundles/v2").exists());
    let url = controller.current_bundle_url().unwrap();
    assert!(url.ends_with("bundles/v1"));
    assert_eq!(read_meta(root.path(), "v1").status, BundleStatus::Active);
}

#[tokio::test]
async fn no_update_returns_to_idle() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();

    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(204)
        .create_async()
        .await;

    let log = EventLog::new();
    let controller =
        OtaController::new(test_config(root.path(), &server.url()), log.clone()).unwrap();
    controller.check_for_update().unwrap();

    log.wait_for("no-update").await;
    log.wait_for("state:idle").await;
    assert!(controller.current_bundle_url().is_none());
}

#[tokio::test]
async fn cancellation_between_steps_aborts_the_run() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let log = EventLog::new();
    let mut config = test_config(root.path(), &server.url());
    config.confirmation_timeout = Duration::from_secs(30);
    let controller = OtaController::new(config, log.clone()).unwrap();

    controller.check_for_update().unwrap();
    log.wait_for("state:awaiting-confirmation").await;
    // Cancelling inside the window reverts the unconfirmed activation.
    controller.cancel();
    log.wait_for("rolled-back:v2->v1").await;
    log.wait_for("state:idle").await;

    let url = controller.current_bundle_url().unwrap();
    assert!(url.ends_with("bundles/v1"));
    // Cancellation is not a boot failure: v2 is not condemned.
    assert_eq!(read_meta(root.path(), "v2").status, BundleStatus::RolledBack);
}

#[tokio::test]
async fn queued_check_runs_after_current_run() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();

    let mock = server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(204)
        .expect(2)
        .create_async()
        .await;

    let log = EventLog::new();
    let mut config = test_config(root.path(), &server.url());
    config.queue_checks = true;
    let controller = OtaController::new(config, log.clone()).unwrap();

    // The second request lands while the first run is (usually) still in
    // flight; queueing must guarantee it runs exactly once either way.
    controller.check_for_update().unwrap();
    controller.check_for_update().unwrap();

    log.wait_for_count("no-update", 2).await;
    log.wait_for("state:idle").await;
    mock.assert_async().await;
}

#[tokio::test]
async fn cancellation_does_not_leak_into_queued_run() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();
    preinstall_v1(root.path());

    let archive = bundle_zip("v2 code");
    let digest = sha256_hex(&archive);
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(manifest_body(&server.url(), "v2", &digest))
        .create_async()
        .await;
    server
        .mock("GET", "/v2.zip")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let log = EventLog::new();
    let mut config = test_config(root.path(), &server.url());
    config.queue_checks = true;
    let controller = OtaController::new(config, log.clone()).unwrap();

    controller.check_for_update().unwrap();
    log.wait_for("state:awaiting-confirmation").await;
    // Queue a follow-up behind the in-flight run, then cancel that run.
    controller.check_for_update().unwrap();
    controller.cancel();
    log.wait_for("rolled-back:v2->v1").await;

    // The queued run gets its own cancellation scope: it must reach its
    // confirmation window instead of dying at the first checkpoint.
    log.wait_for_count("state:awaiting-confirmation", 2).await;
    controller.confirm_boot_success();
    log.wait_for("committed:v2").await;
    log.wait_for("state:idle").await;
    assert!(controller.current_bundle_url().unwrap().ends_with("bundles/v2"));
}

#[tokio::test]
async fn malformed_manifest_surfaces_as_failed() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();

    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body("{\"version\": 42}")
        .create_async()
        .await;

    let log = EventLog::new();
    let controller =
        OtaController::new(test_config(root.path(), &server.url()), log.clone()).unwrap();
    controller.check_for_update().unwrap();

    log.wait_for("failed:manifest-invalid").await;
    log.wait_for("state:idle").await;
}

#[tokio::test]
async fn seed_bootstrap_then_update_check() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let root = tempfile::tempdir().unwrap();

    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(204)
        .create_async()
        .await;

    let log = EventLog::new();
    let controller =
        OtaController::new(test_config(root.path(), &server.url()), log.clone()).unwrap();

    // Ship a seed bundle with the app and install it on first boot.
    let seed = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(seed.path(), bundle_zip("seed code")).unwrap();
    let version = controller
        .bootstrap_from_archive(seed.path())
        .unwrap()
        .unwrap();
    assert!(version.id.as_str().starts_with("seed-"));
    assert!(controller.current_bundle_url().is_some());

    controller.check_for_update().unwrap();
    log.wait_for("no-update").await;
    assert!(!log.contains("failed:"));
}
