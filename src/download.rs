//! Artifact download with retries, progress tracking and a verified download cache

use crate::manifest::Manifest;
use crate::verify;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::{StatusCode, Url};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Upper bound on buffer space reserved from an untrusted `Content-Length`
const MAX_PREALLOCATION: u64 = 64 << 20;

/// Source of artifact bytes. Retrying is the fetcher's business; an error means
/// its retry policy is exhausted.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, manifest: &Manifest) -> Result<Vec<u8>>;
}

/// Fetches `http(s)://` URLs with reqwest and reads `file://` URLs from disk
pub struct HttpFetcher {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
    max_attempts: u32,
    progress: Option<MultiProgress>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("casket/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            cache_dir: None,
            max_attempts: DEFAULT_ATTEMPTS,
            progress: None,
        })
    }

    /// Reuse previously downloaded artifacts whose checksum still matches
    pub fn with_cache(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    fn cache_path(&self, manifest: &Manifest) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}--{}--{}",
                manifest.identifier,
                manifest.version,
                manifest.artifact_file_name()
            ))
        })
    }

    async fn cached(&self, manifest: &Manifest) -> Option<Vec<u8>> {
        let path = self.cache_path(manifest)?;
        let bytes = fs::read(&path).await.ok()?;

        if verify::verify(&bytes, &manifest.content_hash).is_ok() {
            tracing::debug!(path = %path.display(), "using cached download");
            return Some(bytes);
        }

        // Stale or corrupt, download again
        let _ = fs::remove_file(&path).await;
        None
    }

    async fn store(&self, manifest: &Manifest, bytes: &[u8]) {
        let Some(path) = self.cache_path(manifest) else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, bytes).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to cache download");
        }
    }

    async fn download(&self, url: &Url, label: &str) -> Result<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match self.download_once(url, label).await {
                Ok(bytes) => return Ok(bytes),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) if attempt >= self.max_attempts => {
                    return Err(e.context(format!("giving up after {} attempts", attempt)));
                }
                Err(Attempt::Retry(e)) => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tracing::warn!(%url, attempt, error = %e, "download failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn download_once(&self, url: &Url, label: &str) -> std::result::Result<Vec<u8>, Attempt> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("Failed to send request")
            .map_err(Attempt::Retry)?;

        let status = response.status();
        if !status.is_success() {
            let err = anyhow!("HTTP {}", status);
            return Err(if is_retryable(status) {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        let pb = self.progress.as_ref().map(|mp| {
            let pb = mp.add(ProgressBar::new(response.content_length().unwrap_or(0)));
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb.set_message(format!("⬇ {}", label));
            pb
        });

        let reserve = response.content_length().unwrap_or(0).min(MAX_PREALLOCATION);
        let mut bytes = Vec::with_capacity(reserve as usize);
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    if let Some(pb) = &pb {
                        pb.abandon();
                    }
                    return Err(Attempt::Retry(anyhow!(e).context("Connection interrupted")));
                }
            };
            bytes.extend_from_slice(&chunk);
            if let Some(pb) = &pb {
                pb.set_position(bytes.len() as u64);
            }
        }

        if let Some(pb) = &pb {
            pb.finish_with_message(format!("✓ {}", label));
        }

        Ok(bytes)
    }
}

enum Attempt {
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let url = Url::parse(&manifest.source_url)
            .with_context(|| format!("Invalid URL: {}", manifest.source_url))?;

        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("Invalid file URL: {}", url))?;
            return fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()));
        }

        if !matches!(url.scheme(), "http" | "https") {
            bail!("Unsupported URL scheme: {}", url.scheme());
        }

        if let Some(bytes) = self.cached(manifest).await {
            return Ok(bytes);
        }

        let bytes = self.download(&url, &manifest.identifier).await?;
        self.store(manifest, &bytes).await;
        Ok(bytes)
    }
}
