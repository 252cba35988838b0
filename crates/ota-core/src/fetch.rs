//! Talking to the bundle server: update checks and artifact downloads.
//!
//! Downloads stream to a `.part` file under the store's tmp directory with
//! the SHA-256 computed on the fly. Transient failures are retried with
//! exponential backoff, and a resumed attempt re-hashes every byte already
//! on disk before asking the server for the remainder, so the final digest
//! always covers exactly what was written.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ota_schema::{BundleId, Sha256Digest, UpdateManifest};

use crate::error::ErrorKind;
use crate::reporter::UpdateReporter;

/// Which endpoint this installation talks to. Production bundle server and
/// development package server are mutually exclusive; only the configured
/// one is ever queried.
#[derive(Debug, Clone)]
pub enum ServerConfig {
    /// Production bundle server.
    Production {
        /// Base URL, e.g. `https://cdn.example/bundle`.
        base_url: String,
    },
    /// Development package server used by debug builds.
    Development {
        /// Base URL of the dev packager.
        base_url: String,
    },
}

impl ServerConfig {
    /// The base URL of the selected endpoint.
    pub fn base_url(&self) -> &str {
        match self {
            Self::Production { base_url } | Self::Development { base_url } => base_url,
        }
    }
}

/// A downloaded, hash-verified package sitting in the tmp directory.
///
/// Owned by the fetcher's caller until handed to extraction; deleted via
/// [`discard`](Self::discard) regardless of the extraction outcome.
#[derive(Debug)]
pub struct DownloadArtifact {
    /// Location of the verified file.
    pub path: PathBuf,
    /// Digest the file was verified against.
    pub sha256: Sha256Digest,
    /// Size in bytes.
    pub size: u64,
}

impl DownloadArtifact {
    /// Delete the artifact file, ignoring errors (it lives under tmp).
    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Errors produced by update checks and downloads.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server's manifest could not be parsed or failed validation.
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    /// The downloaded artifact did not hash to the manifest's digest.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Digest the manifest promised.
        expected: Sha256Digest,
        /// Digest computed from the downloaded bytes.
        actual: Sha256Digest,
    },
}

impl FetchError {
    /// Classify for the `failed` event taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) => ErrorKind::Network,
            Self::Io(_) => ErrorKind::Disk,
            Self::ManifestInvalid(_) => ErrorKind::ManifestInvalid,
            Self::HashMismatch { .. } => ErrorKind::IntegrityMismatch,
        }
    }

    /// Whether the fetcher may retry after this error.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.status().is_none_or(|s| s.is_server_error()),
            _ => false,
        }
    }
}

/// Client for the bundle server: resolves the current manifest and
/// downloads artifacts.
#[derive(Debug)]
pub struct UpdateFetcher {
    client: Client,
    server: ServerConfig,
    app_id: String,
    tmp_dir: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
}

impl UpdateFetcher {
    /// Create a fetcher for one application against one endpoint.
    pub fn new(
        client: Client,
        server: ServerConfig,
        app_id: impl Into<String>,
        tmp_dir: impl Into<PathBuf>,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            server,
            app_id: app_id.into(),
            tmp_dir: tmp_dir.into(),
            max_retries,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Override the base retry delay (doubled per attempt, plus jitter).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Ask the server whether a newer bundle than `current` exists.
    ///
    /// `Ok(None)` is the normal "no update" outcome: the server answered
    /// 204/304, or the advertised version is the one already active.
    pub async fn check_for_update(
        &self,
        current: Option<&BundleId>,
    ) -> Result<Option<UpdateManifest>, FetchError> {
        let url = format!("{}/check", self.server.base_url().trim_end_matches('/'));
        let current_str = current.map(BundleId::as_str).unwrap_or_default();

        let response = self
            .with_retries(|| async {
                let resp = self
                    .client
                    .get(&url)
                    .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
                    .query(&[("app_id", self.app_id.as_str()), ("current", current_str)])
                    .send()
                    .await?;
                if resp.status().is_server_error() {
                    return Err(FetchError::Http(
                        resp.error_for_status().expect_err("status checked above"),
                    ));
                }
                Ok(resp)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let response = response.error_for_status()?;

        let body = response.text().await?;
        let manifest =
            UpdateManifest::from_json(&body).map_err(|e| FetchError::ManifestInvalid(e.to_string()))?;

        if current == Some(&manifest.version) {
            tracing::debug!(version = %manifest.version, "server version matches active bundle");
            return Ok(None);
        }

        Ok(Some(manifest))
    }

    /// Download the manifest's artifact into the tmp directory, verifying
    /// its digest. The returned artifact is named by its hash so repeated
    /// downloads of the same bundle are served from disk.
    pub async fn download<R: UpdateReporter + ?Sized>(
        &self,
        manifest: &UpdateManifest,
        reporter: &R,
    ) -> Result<DownloadArtifact, FetchError> {
        tokio::fs::create_dir_all(&self.tmp_dir).await?;

        let final_path = self.tmp_dir.join(manifest.sha256.as_str());
        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            if crate::verify::verify(&final_path, &manifest.sha256).is_ok() {
                tracing::info!(path = %final_path.display(), "artifact already downloaded");
                return Ok(DownloadArtifact {
                    path: final_path,
                    sha256: manifest.sha256.clone(),
                    size: meta.len(),
                });
            }
            tokio::fs::remove_file(&final_path).await.ok();
        }

        let part_path = self.tmp_dir.join(format!("{}.part", manifest.sha256));
        let (digest, size) = self
            .with_retries(|| self.download_attempt(&manifest.url, &part_path, reporter))
            .await?;

        if digest != manifest.sha256 {
            tokio::fs::remove_file(&part_path).await.ok();
            return Err(FetchError::HashMismatch {
                expected: manifest.sha256.clone(),
                actual: digest,
            });
        }

        tokio::fs::rename(&part_path, &final_path).await?;
        Ok(DownloadArtifact {
            path: final_path,
            sha256: manifest.sha256.clone(),
            size,
        })
    }

    /// One download attempt: re-hash whatever partial data survives from a
    /// previous attempt, then request the remainder with a Range header.
    /// A plain 200 response truncates and restarts from byte zero.
    async fn download_attempt<R: UpdateReporter + ?Sized>(
        &self,
        url: &str,
        part_path: &Path,
        reporter: &R,
    ) -> Result<(Sha256Digest, u64), FetchError> {
        let mut hasher = Sha256::new();
        let mut offset = 0u64;

        if tokio::fs::try_exists(part_path).await? {
            let mut existing = tokio::fs::File::open(part_path).await?;
            let mut buffer = [0u8; 8192];
            loop {
                let count = existing.read(&mut buffer).await?;
                if count == 0 {
                    break;
                }
                hasher.update(&buffer[..count]);
                offset += count as u64;
            }
        }

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();

        // Range fully satisfied earlier; the partial file is the whole artifact.
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Ok((Sha256Digest::from_bytes(&hasher.finalize()), offset));
        }

        let response = response.error_for_status()?;

        let mut file = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await?
        } else {
            // Server ignored the range; start over.
            hasher = Sha256::new();
            offset = 0;
            tokio::fs::File::create(part_path).await?
        };

        let total = response.content_length().map(|len| offset + len);
        reporter.downloading(offset, total);

        let mut received = offset;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            reporter.downloading(received, total);
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok((Sha256Digest::from_bytes(&hasher.finalize()), received))
    }

    /// Run `op` with bounded retries and exponential backoff on transient
    /// failures. Non-retryable errors surface immediately.
    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.retry_delay * 2u32.saturating_pow(attempt);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..=100));
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.max_retries,
                        delay_ms = (backoff + jitter).as_millis() as u64,
                        "transient fetch failure, retrying: {e}"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
