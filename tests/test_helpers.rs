// Test helpers for isolated lifecycle testing
// Every environment lives in its own temporary directory, so nothing touches
// the real prefix or /Applications.

#![allow(dead_code)]

use async_trait::async_trait;
use casket::controller::{BUNDLE_DIGEST_FILE, CASK_METADATA_FILE};
use casket::{CancelToken, Controller, Fetcher, Layout, Ledger, Manifest, Stager, verify};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Barrier;

/// Isolated install root, removed when dropped
///
/// ```text
/// temp/
///   Applications/   (final bundle location)
///   Caskroom/       (retained manifests and artifacts)
///   var/casket/     (ledger and staging)
/// ```
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub layout: Layout,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let layout = Layout::rooted(temp_dir.path());
        Self { temp_dir, layout }
    }

    pub fn controller(
        &self,
        ledger: Arc<dyn Ledger>,
        fetcher: Arc<dyn Fetcher>,
        stager: Arc<dyn Stager>,
    ) -> Controller {
        Controller::new(self.layout.clone(), ledger, fetcher, stager)
    }

    pub fn app_path(&self, bundle: &str) -> PathBuf {
        self.layout.app_path(bundle)
    }

    /// Entries currently in the application directory
    pub fn apps(&self) -> Vec<String> {
        names_in(&self.layout.appdir)
    }

    /// Leftover staging directories
    pub fn staging_leftovers(&self) -> Vec<String> {
        names_in(&self.layout.staging_dir())
    }

    /// Version directories retained in the Caskroom for `identifier`
    pub fn caskroom_versions(&self, identifier: &str) -> Vec<String> {
        names_in(&self.layout.cask_dir(identifier))
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Manifest whose hash matches `bytes`
pub fn manifest_for(identifier: &str, version: &str, app: &str, bytes: &[u8]) -> Manifest {
    Manifest {
        identifier: identifier.to_string(),
        version: version.to_string(),
        content_hash: verify::digest(bytes),
        source_url: format!("https://example.com/{}/{}/{}.bin", identifier, version, identifier),
        display_name: identifier.to_string(),
        homepage: None,
        app_bundle_name: app.to_string(),
    }
}

/// Serves fixed bytes per URL and counts calls
#[derive(Default)]
pub struct StubFetcher {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    barrier: Option<Arc<Barrier>>,
    fail: Mutex<bool>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serving(manifest: &Manifest, bytes: &[u8]) -> Self {
        let fetcher = Self::new();
        fetcher.serve(manifest, bytes);
        fetcher
    }

    pub fn serve(&self, manifest: &Manifest, bytes: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(manifest.source_url.clone(), bytes.to_vec());
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every fetch waits until `n` fetches are in flight at once
    pub fn with_barrier(mut self, n: usize) -> Self {
        self.barrier = Some(Arc::new(Barrier::new(n)));
        self
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, manifest: &Manifest) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock().unwrap() {
            anyhow::bail!("connection refused after 3 attempts");
        }
        self.payloads
            .lock()
            .unwrap()
            .get(&manifest.source_url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404 Not Found"))
    }
}

/// Builds a directory bundle `<app>/Contents/payload` from the artifact,
/// so lifecycle tests do not depend on archive tools or macOS.
#[derive(Default)]
pub struct StubStager {
    cancel_during: Option<CancelToken>,
    fail: bool,
}

impl StubStager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip `token` while staging
    pub fn cancelling(token: CancelToken) -> Self {
        Self {
            cancel_during: Some(token),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            cancel_during: None,
            fail: true,
        }
    }
}

#[async_trait]
impl Stager for StubStager {
    async fn stage(&self, artifact: &Path, staging: &Path, manifest: &Manifest) -> anyhow::Result<PathBuf> {
        if let Some(token) = &self.cancel_during {
            token.cancel();
        }
        if self.fail {
            anyhow::bail!("Artifact does not contain {}", manifest.app_bundle_name);
        }
        let bundle = staging.join(&manifest.app_bundle_name);
        std::fs::create_dir_all(bundle.join("Contents"))?;
        std::fs::copy(artifact, bundle.join("Contents/payload"))?;
        Ok(bundle)
    }
}

/// Contents of the payload inside an installed stub bundle
pub fn installed_payload(env: &TestEnvironment, bundle: &str) -> Option<Vec<u8>> {
    std::fs::read(env.app_path(bundle).join("Contents/payload")).ok()
}

/// Leave a Caskroom version directory for `manifest` the way the first
/// promotion step does, without touching the application directory
pub fn promote_caskroom_only(env: &TestEnvironment, manifest: &Manifest, bytes: &[u8]) {
    let scratch = env.temp_dir.path().join("scratch").join(&manifest.version);
    let bundle = scratch.join(&manifest.app_bundle_name);
    std::fs::create_dir_all(bundle.join("Contents")).unwrap();
    std::fs::write(bundle.join("Contents/payload"), bytes).unwrap();

    let dir = env
        .layout
        .cask_version_dir(&manifest.identifier, &manifest.version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(manifest.artifact_file_name()), bytes).unwrap();
    std::fs::write(
        dir.join(CASK_METADATA_FILE),
        serde_json::to_vec_pretty(manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join(BUNDLE_DIGEST_FILE),
        verify::digest_tree_blocking(&bundle).unwrap(),
    )
    .unwrap();
}
