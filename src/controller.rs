//! Install lifecycle controller.
//!
//! Drives one cask through
//!
//! ```text
//! Idle → Fetching → Verifying → Staging → Installing → Installed
//!                                                        │
//!                                  Idle ← Uninstalling ←─┘
//! ```
//!
//! with `Failed(stage)` reachable from every non-terminal state. Work on one
//! identifier is serialized by a per-identifier async lock; distinct identifiers
//! proceed in parallel.
//!
//! # Crash safety
//!
//! Nothing is written to the final location until the artifact has been
//! verified and unpacked into a private staging directory. Promotion then
//! happens in a fixed order:
//!
//! 1. the Caskroom version directory (manifest + verified artifact) is renamed into place
//! 2. any bundle already at the final path is moved aside
//! 3. the staged bundle is renamed into the final path
//! 4. the ledger record is written
//!
//! A failure in steps 1-3 is rolled back. A crash or ledger failure after step 3
//! leaves files without a record; [`Controller::repair`] re-hashes the retained
//! artifact and completes step 4, but only when the bundle at the final path
//! digests to the tree recorded next to that artifact. A crash between steps 2
//! and 3 leaves the previous bundle in a hidden sibling, which repair moves back.
//! Uninstall removes files before the record, so an interrupted uninstall leaves
//! a record whose bundle is gone, which repair finishes off.

use crate::cancel::CancelToken;
use crate::download::Fetcher;
use crate::error::{CasketError, Result, Stage};
use crate::extract::{self, Stager};
use crate::layout::Layout;
use crate::ledger::{InstalledRecord, Ledger};
use crate::manifest::{self, Manifest};
use crate::verify;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Name of the serialized manifest kept in each Caskroom version directory
pub const CASK_METADATA_FILE: &str = "manifest.json";

/// Digest of the staged bundle tree, kept beside the artifact
pub const BUNDLE_DIGEST_FILE: &str = "bundle.sha256";

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Lifecycle state of one identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Idle,
    Fetching,
    Verifying,
    Staging,
    Installing,
    Installed,
    Uninstalling,
    Repairing,
    Failed(Stage),
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallState::Idle => f.write_str("idle"),
            InstallState::Fetching => f.write_str("fetching"),
            InstallState::Verifying => f.write_str("verifying"),
            InstallState::Staging => f.write_str("staging"),
            InstallState::Installing => f.write_str("installing"),
            InstallState::Installed => f.write_str("installed"),
            InstallState::Uninstalling => f.write_str("uninstalling"),
            InstallState::Repairing => f.write_str("repairing"),
            InstallState::Failed(stage) => write!(f, "failed while {}", stage),
        }
    }
}

/// Result of `install` / `upgrade`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Fresh install
    Installed(InstalledRecord),
    /// Replaced a different version or content hash
    Upgraded {
        from_version: String,
        record: InstalledRecord,
    },
    /// The same identifier, version and hash was already recorded; nothing fetched
    AlreadyInstalled(InstalledRecord),
}

impl InstallOutcome {
    pub fn record(&self) -> &InstalledRecord {
        match self {
            InstallOutcome::Installed(record)
            | InstallOutcome::AlreadyInstalled(record)
            | InstallOutcome::Upgraded { record, .. } => record,
        }
    }
}

/// Result of `uninstall`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub identifier: String,
    pub version: String,
    pub removed_path: PathBuf,
}

/// Result of `repair`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Ledger and disk already agreed
    Healthy(InstalledRecord),
    /// Installed files were verified and the missing ledger write completed
    Recorded(InstalledRecord),
    /// An interrupted uninstall was finished and the record deleted
    Removed { version: String },
}

/// Callback invoked on every state transition
pub type Reporter = Arc<dyn Fn(&str, InstallState) + Send + Sync>;

pub struct Controller {
    layout: Layout,
    ledger: Arc<dyn Ledger>,
    fetcher: Arc<dyn Fetcher>,
    stager: Arc<dyn Stager>,
    locks: LockMap,
    states: Mutex<HashMap<String, InstallState>>,
    reporter: Option<Reporter>,
}

/// Bookkeeping for steps 1-3 so they can be undone
struct Promotion {
    version_dir: PathBuf,
    displaced_version_dir: Option<PathBuf>,
    placed_version: bool,
    final_path: PathBuf,
    displaced_app: Option<PathBuf>,
    placed_app: bool,
}

impl Controller {
    pub fn new(
        layout: Layout,
        ledger: Arc<dyn Ledger>,
        fetcher: Arc<dyn Fetcher>,
        stager: Arc<dyn Stager>,
    ) -> Self {
        Self {
            layout,
            ledger,
            fetcher,
            stager,
            locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    /// Last state observed for `identifier` in this process. Identifiers that
    /// returned to `Idle` are not tracked.
    pub fn state(&self, identifier: &str) -> InstallState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identifier)
            .copied()
            .unwrap_or(InstallState::Idle)
    }

    /// All installed records
    pub async fn list(&self) -> Result<Vec<InstalledRecord>> {
        self.ledger.list_all().await
    }

    /// Install `manifest`, upgrading any different recorded version.
    pub async fn install(&self, manifest: &Manifest, cancel: &CancelToken) -> Result<InstallOutcome> {
        let _guard = self.lock(&manifest.identifier).await;
        self.install_locked(manifest, cancel).await
    }

    /// Like [`install`](Self::install) but the identifier must already be installed.
    pub async fn upgrade(&self, manifest: &Manifest, cancel: &CancelToken) -> Result<InstallOutcome> {
        let _guard = self.lock(&manifest.identifier).await;
        if self.lookup(&manifest.identifier, Stage::Installing).await?.is_none() {
            return Err(CasketError::NotInstalled(manifest.identifier.clone()));
        }
        self.install_locked(manifest, cancel).await
    }

    async fn install_locked(
        &self,
        manifest: &Manifest,
        cancel: &CancelToken,
    ) -> Result<InstallOutcome> {
        let id = manifest.identifier.as_str();
        let previous = self.lookup(id, Stage::Installing).await?;

        if let Some(record) = previous.as_ref()
            && record.matches(manifest)
        {
            debug!(identifier = id, version = %record.version, "already installed");
            self.transition(id, InstallState::Installed);
            return Ok(InstallOutcome::AlreadyInstalled(record.clone()));
        }

        match self.run_install(manifest, previous.as_ref(), cancel).await {
            Ok(record) => {
                self.transition(id, InstallState::Installed);
                info!(identifier = id, version = %record.version, "installed");
                Ok(match previous {
                    Some(old) => InstallOutcome::Upgraded {
                        from_version: old.version,
                        record,
                    },
                    None => InstallOutcome::Installed(record),
                })
            }
            Err(err) => {
                self.fail(id, &err);
                Err(err)
            }
        }
    }

    async fn run_install(
        &self,
        manifest: &Manifest,
        previous: Option<&InstalledRecord>,
        cancel: &CancelToken,
    ) -> Result<InstalledRecord> {
        let id = manifest.identifier.as_str();

        self.transition(id, InstallState::Fetching);
        check_cancel(cancel, Stage::Fetching)?;
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CasketError::Cancelled.at(Stage::Fetching)),
            fetched = self.fetcher.fetch(manifest) => {
                fetched.map_err(|e| CasketError::transport(e).at(Stage::Fetching))?
            }
        };

        self.transition(id, InstallState::Verifying);
        verify::verify(&bytes, &manifest.content_hash)
            .map_err(|e| CasketError::from(e).at(Stage::Verifying))?;
        check_cancel(cancel, Stage::Verifying)?;

        self.transition(id, InstallState::Staging);
        // Dropping this removes everything left in staging, on every exit path
        let staging = self.staging_dir(id).await.map_err(|e| e.at(Stage::Staging))?;
        let cask_meta = staging.path().join("caskroom");
        let artifact = cask_meta.join(manifest.artifact_file_name());
        write_cask_metadata(&cask_meta, manifest, &bytes)
            .await
            .map_err(|e| CasketError::from(e).at(Stage::Staging))?;
        drop(bytes);

        let bundle = self
            .stager
            .stage(&artifact, &staging.path().join("unpack"), manifest)
            .await
            .map_err(|e| CasketError::staging(e).at(Stage::Staging))?;
        let bundle_digest = verify::digest_tree(&bundle)
            .await
            .map_err(|e| CasketError::from(e).at(Stage::Staging))?;
        fs::write(cask_meta.join(BUNDLE_DIGEST_FILE), &bundle_digest)
            .await
            .map_err(|e| CasketError::from(e).at(Stage::Staging))?;
        check_cancel(cancel, Stage::Staging)?;

        self.transition(id, InstallState::Installing);
        let promotion = self
            .promote(manifest, &cask_meta, &bundle, staging.path())
            .await
            .map_err(|e| e.at(Stage::Installing))?;

        // Last point at which cancellation is honored
        if cancel.is_cancelled() {
            promotion.rollback().await;
            return Err(CasketError::Cancelled.at(Stage::Installing));
        }

        let record = InstalledRecord::new(manifest, promotion.final_path.clone());
        if let Err(err) = self.ledger.put(&record).await {
            // Files stay in place for repair; only the displaced bundle goes
            promotion.discard_displaced().await;
            return Err(err.at(Stage::Installing));
        }

        promotion.discard_displaced().await;
        self.remove_stale(manifest, previous).await;
        Ok(record)
    }

    /// Steps 1-3: Caskroom metadata, displace old bundle, place new bundle
    async fn promote(
        &self,
        manifest: &Manifest,
        cask_meta: &Path,
        bundle: &Path,
        staging: &Path,
    ) -> Result<Promotion> {
        let version_dir = self
            .layout
            .cask_version_dir(&manifest.identifier, &manifest.version);
        let final_path = self.layout.app_path(&manifest.app_bundle_name);

        let mut promotion = Promotion {
            version_dir: version_dir.clone(),
            displaced_version_dir: None,
            placed_version: false,
            final_path: final_path.clone(),
            displaced_app: None,
            placed_app: false,
        };

        let result = async {
            fs::create_dir_all(self.layout.cask_dir(&manifest.identifier)).await?;
            if path_exists(&version_dir).await {
                // Same version re-installed with a different artifact
                let aside = staging.join("displaced-caskroom");
                fs::rename(&version_dir, &aside).await?;
                promotion.displaced_version_dir = Some(aside);
            }
            fs::rename(cask_meta, &version_dir).await?;
            promotion.placed_version = true;

            fs::create_dir_all(&self.layout.appdir).await?;
            if path_exists(&final_path).await {
                let aside = sibling(&final_path, "old");
                fs::rename(&final_path, &aside).await?;
                promotion.displaced_app = Some(aside);
            }

            place(bundle, &final_path).await?;
            promotion.placed_app = true;
            debug!(path = %final_path.display(), "bundle placed");
            Ok::<_, CasketError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(promotion),
            Err(err) => {
                promotion.rollback().await;
                Err(err)
            }
        }
    }

    /// Post-commit cleanup: other Caskroom versions and a renamed-away old bundle.
    /// Failures only leave stale files behind, which repair tidies.
    async fn remove_stale(&self, manifest: &Manifest, previous: Option<&InstalledRecord>) {
        let cask_dir = self.layout.cask_dir(&manifest.identifier);
        for (version, dir) in list_version_dirs(&cask_dir).await {
            if version != manifest.version
                && let Err(e) = remove_path(&dir).await
            {
                warn!(dir = %dir.display(), error = %e, "failed to remove stale Caskroom version");
            }
        }

        if let Some(old) = previous
            && old.install_path != self.layout.app_path(&manifest.app_bundle_name)
            && let Err(e) = remove_path(&old.install_path).await
        {
            warn!(path = %old.install_path.display(), error = %e, "failed to remove previous bundle");
        }
    }

    /// Remove an installed cask: bundle first, then Caskroom, then the record.
    pub async fn uninstall(
        &self,
        identifier: &str,
        cancel: &CancelToken,
    ) -> Result<UninstallOutcome> {
        manifest::validate_identifier(identifier)?;
        let _guard = self.lock(identifier).await;

        let record = self
            .lookup(identifier, Stage::Uninstalling)
            .await?
            .ok_or_else(|| CasketError::NotInstalled(identifier.to_string()))?;

        check_cancel(cancel, Stage::Uninstalling)?;
        self.transition(identifier, InstallState::Uninstalling);

        match self.remove_installed(&record).await {
            Ok(()) => {
                self.transition(identifier, InstallState::Idle);
                info!(identifier, version = %record.version, "uninstalled");
                Ok(UninstallOutcome {
                    identifier: record.identifier,
                    version: record.version,
                    removed_path: record.install_path,
                })
            }
            Err(err) => {
                let err = err.at(Stage::Uninstalling);
                self.fail(identifier, &err);
                Err(err)
            }
        }
    }

    async fn remove_installed(&self, record: &InstalledRecord) -> Result<()> {
        remove_path(&record.install_path).await?;
        remove_path(&self.layout.cask_dir(&record.identifier)).await?;
        self.ledger.delete(&record.identifier).await
    }

    /// Reconcile the ledger with what is on disk for one identifier.
    pub async fn repair(&self, identifier: &str) -> Result<RepairOutcome> {
        manifest::validate_identifier(identifier)?;
        let _guard = self.lock(identifier).await;
        self.transition(identifier, InstallState::Repairing);

        match self.run_repair(identifier).await {
            Ok(outcome) => {
                let state = match outcome {
                    RepairOutcome::Removed { .. } => InstallState::Idle,
                    _ => InstallState::Installed,
                };
                self.transition(identifier, state);
                info!(identifier, ?outcome, "repaired");
                Ok(outcome)
            }
            Err(err @ CasketError::NotInstalled(_)) => {
                self.transition(identifier, InstallState::Idle);
                Err(err)
            }
            Err(err) => {
                let err = err.at(Stage::Repairing);
                self.transition(identifier, InstallState::Failed(Stage::Repairing));
                Err(err)
            }
        }
    }

    async fn run_repair(&self, identifier: &str) -> Result<RepairOutcome> {
        let record = self.ledger.get(identifier).await?;
        let recorded_version = record.as_ref().map(|r| r.version.as_str());

        // Versions promoted into the Caskroom without a matching ledger write, newest first
        let pending = self.pending_versions(identifier, recorded_version).await;

        let mut bundle_paths: Vec<PathBuf> = pending
            .iter()
            .map(|p| self.layout.app_path(&p.manifest.app_bundle_name))
            .chain(record.as_ref().map(|r| r.install_path.clone()))
            .collect();
        bundle_paths.sort();
        bundle_paths.dedup();
        for path in &bundle_paths {
            restore_displaced(path).await?;
        }

        let recorded_at = record.as_ref().map(|r| SystemTime::from(r.installed_at));
        for pending in pending {
            let final_path = self.layout.app_path(&pending.manifest.app_bundle_name);

            // Staged before the current record was written: leftover from cleanup.
            // A bundle that does not match never finished promotion.
            let superseded = recorded_at.is_some_and(|at| pending.modified <= at);
            if superseded || !bundle_matches(&pending.dir, &final_path).await {
                debug!(dir = %pending.dir.display(), "discarding stale Caskroom version");
                remove_path(&pending.dir).await?;
                continue;
            }

            self.check_retained(&pending.dir, &pending.manifest).await?;

            let new_record = InstalledRecord::new(&pending.manifest, final_path);
            self.ledger.put(&new_record).await?;
            self.remove_stale(&pending.manifest, record.as_ref()).await;
            return Ok(RepairOutcome::Recorded(new_record));
        }

        let Some(record) = record else {
            return Err(CasketError::NotInstalled(identifier.to_string()));
        };

        if !path_exists(&record.install_path).await {
            // Bundle gone but record kept: an uninstall that did not finish
            remove_path(&self.layout.cask_dir(identifier)).await?;
            self.ledger.delete(identifier).await?;
            return Ok(RepairOutcome::Removed {
                version: record.version,
            });
        }

        let version_dir = self.layout.cask_version_dir(identifier, &record.version);
        match read_cask_metadata(&version_dir).await {
            Some(manifest) => {
                self.check_retained(&version_dir, &manifest).await?;
                if !record.matches(&manifest) {
                    // Same version re-promoted with a new artifact, record never updated
                    if bundle_matches(&version_dir, &record.install_path).await {
                        let new_record =
                            InstalledRecord::new(&manifest, record.install_path.clone());
                        self.ledger.put(&new_record).await?;
                        return Ok(RepairOutcome::Recorded(new_record));
                    }
                    warn!(identifier, "retained artifact does not belong to the installed bundle");
                }
            }
            None => warn!(identifier, "no retained artifact to re-verify"),
        }

        Ok(RepairOutcome::Healthy(record))
    }

    /// Re-hash the artifact retained in a Caskroom version directory
    async fn check_retained(&self, dir: &Path, manifest: &Manifest) -> Result<()> {
        let artifact = dir.join(manifest.artifact_file_name());
        verify::verify_file(&artifact, &manifest.content_hash).await??;
        Ok(())
    }

    async fn pending_versions(
        &self,
        identifier: &str,
        recorded_version: Option<&str>,
    ) -> Vec<PendingVersion> {
        let mut pending = Vec::new();
        for (version, dir) in list_version_dirs(&self.layout.cask_dir(identifier)).await {
            if Some(version.as_str()) == recorded_version {
                continue;
            }
            let Some(manifest) = read_cask_metadata(&dir).await else {
                warn!(dir = %dir.display(), "Caskroom version without metadata");
                continue;
            };
            if manifest.identifier != identifier {
                continue;
            }
            let modified = fs::metadata(&dir)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            pending.push(PendingVersion {
                manifest,
                dir,
                modified,
            });
        }
        pending.sort_by(|a, b| b.modified.cmp(&a.modified));
        pending
    }

    /// Path of the verified artifact kept for an installed record
    pub async fn retained_artifact(&self, record: &InstalledRecord) -> Option<PathBuf> {
        let dir = self
            .layout
            .cask_version_dir(&record.identifier, &record.version);
        let manifest = read_cask_metadata(&dir).await?;
        Some(dir.join(manifest.artifact_file_name()))
    }

    async fn staging_dir(&self, identifier: &str) -> Result<tempfile::TempDir> {
        let root = self.layout.staging_dir();
        fs::create_dir_all(&root).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", identifier))
            .tempdir_in(&root)?;
        Ok(dir)
    }

    /// Ledger read for an operation already under way
    async fn lookup(&self, identifier: &str, stage: Stage) -> Result<Option<InstalledRecord>> {
        match self.ledger.get(identifier).await {
            Ok(record) => Ok(record),
            Err(err) => {
                let err = err.at(stage);
                self.fail(identifier, &err);
                Err(err)
            }
        }
    }

    async fn lock(&self, identifier: &str) -> IdentifierGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(identifier.to_string()).or_default().clone()
        };
        IdentifierGuard {
            locks: &self.locks,
            identifier: identifier.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn transition(&self, identifier: &str, state: InstallState) {
        debug!(identifier, %state, "state transition");
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if state == InstallState::Idle {
                states.remove(identifier);
            } else {
                states.insert(identifier.to_string(), state);
            }
        }
        if let Some(reporter) = &self.reporter {
            reporter(identifier, state);
        }
    }

    /// Terminal state after a failed operation. Cancellation returns to `Idle`.
    fn fail(&self, identifier: &str, err: &CasketError) {
        let state = match (err.root(), err.stage()) {
            (CasketError::Cancelled, _) | (_, None) => InstallState::Idle,
            (_, Some(stage)) => InstallState::Failed(stage),
        };
        warn!(identifier, error = %err, "operation failed");
        self.transition(identifier, state);
    }
}

struct PendingVersion {
    manifest: Manifest,
    dir: PathBuf,
    modified: SystemTime,
}

/// Exclusive hold on one identifier. Releasing it drops the lock entry once
/// nobody else is waiting on it.
struct IdentifierGuard<'a> {
    locks: &'a LockMap,
    identifier: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentifierGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.identifier)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.identifier);
        }
    }
}

impl Promotion {
    /// Undo steps 1-3 in reverse order, best effort
    async fn rollback(self) {
        if self.placed_app
            && let Err(e) = remove_path(&self.final_path).await
        {
            warn!(path = %self.final_path.display(), error = %e, "rollback: failed to remove placed bundle");
        }
        if let Some(aside) = &self.displaced_app
            && let Err(e) = fs::rename(aside, &self.final_path).await
        {
            warn!(path = %aside.display(), error = %e, "rollback: failed to restore previous bundle");
        }
        if self.placed_version
            && let Err(e) = remove_path(&self.version_dir).await
        {
            warn!(dir = %self.version_dir.display(), error = %e, "rollback: failed to remove Caskroom version");
        }
        if let Some(aside) = &self.displaced_version_dir
            && let Err(e) = fs::rename(aside, &self.version_dir).await
        {
            warn!(dir = %aside.display(), error = %e, "rollback: failed to restore Caskroom version");
        }
    }

    /// Drop the bundle moved aside in step 2
    async fn discard_displaced(&self) {
        if let Some(aside) = &self.displaced_app
            && let Err(e) = remove_path(aside).await
        {
            warn!(path = %aside.display(), error = %e, "failed to remove replaced bundle");
        }
    }
}

fn check_cancel(cancel: &CancelToken, stage: Stage) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CasketError::Cancelled.at(stage));
    }
    Ok(())
}

async fn write_cask_metadata(dir: &Path, manifest: &Manifest, artifact: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    fs::write(dir.join(manifest.artifact_file_name()), artifact).await?;
    let json = serde_json::to_vec_pretty(manifest)?;
    fs::write(dir.join(CASK_METADATA_FILE), json).await
}

async fn read_cask_metadata(dir: &Path) -> Option<Manifest> {
    let raw = fs::read(dir.join(CASK_METADATA_FILE)).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Whether `bundle` digests to the tree recorded in Caskroom version `dir`
async fn bundle_matches(dir: &Path, bundle: &Path) -> bool {
    let Ok(expected) = fs::read_to_string(dir.join(BUNDLE_DIGEST_FILE)).await else {
        warn!(dir = %dir.display(), "no bundle digest recorded");
        return false;
    };
    match verify::digest_tree(bundle).await {
        Ok(actual) => actual == expected.trim(),
        Err(e) => {
            debug!(path = %bundle.display(), error = %e, "bundle not readable");
            false
        }
    }
}

/// Move a bundle an interrupted promotion left aside back to `path` when
/// nothing is there, then remove any other promotion leftovers beside it.
async fn restore_displaced(path: &Path) -> Result<()> {
    let mut leftovers = promotion_leftovers(path).await;
    if !path_exists(path).await
        && let Some(idx) = leftovers.iter().position(|(tag, _)| tag == "old")
    {
        let (_, aside) = leftovers.remove(idx);
        info!(path = %path.display(), from = %aside.display(), "restoring displaced bundle");
        fs::rename(&aside, path).await?;
    }
    for (_, leftover) in leftovers {
        debug!(path = %leftover.display(), "removing promotion leftover");
        remove_path(&leftover).await?;
    }
    Ok(())
}

/// `(tag, path)` of each [`sibling`] of `path`, newest first
async fn promotion_leftovers(path: &Path) -> Vec<(String, PathBuf)> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Vec::new();
    };
    let prefix = format!(".{}.casket-", name.to_string_lossy());
    let Ok(mut entries) = fs::read_dir(parent).await else {
        return Vec::new();
    };

    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some((tag, pid)) = file_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split_once('-'))
        else {
            continue;
        };
        if !matches!(tag, "old" | "new") || pid.parse::<u32>().is_err() {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, tag.to_string(), entry.path()));
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, tag, path)| (tag, path)).collect()
}

/// `(version, path)` for each version directory of one cask
async fn list_version_dirs(cask_dir: &Path) -> Vec<(String, PathBuf)> {
    let mut dirs = Vec::new();
    let Ok(mut entries) = fs::read_dir(cask_dir).await else {
        return dirs;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push((name, entry.path()));
        }
    }
    dirs
}

/// Rename `bundle` to `dest`, copying through a sibling temporary when the
/// rename crosses filesystems.
async fn place(bundle: &Path, dest: &Path) -> Result<()> {
    if fs::rename(bundle, dest).await.is_ok() {
        return Ok(());
    }

    let tmp = sibling(dest, "new");
    let (src, tmp_copy) = (bundle.to_path_buf(), tmp.clone());
    let copied = tokio::task::spawn_blocking(move || extract::copy_tree(&src, &tmp_copy))
        .await
        .map_err(std::io::Error::other)?;

    if let Err(e) = copied {
        let _ = remove_path(&tmp).await;
        return Err(CasketError::staging(e));
    }
    if let Err(e) = fs::rename(&tmp, dest).await {
        let _ = remove_path(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Hidden path next to `path` on the same filesystem
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.casket-{}-{}", name, tag, std::process::id()))
}

async fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

/// Remove a file, symlink or directory tree. Absent paths are fine.
async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(InstallState::Installed.to_string(), "installed");
        assert_eq!(
            InstallState::Failed(Stage::Verifying).to_string(),
            "failed while verifying"
        );
    }

    #[test]
    fn test_sibling_is_hidden_and_adjacent() {
        let s = sibling(Path::new("/Applications/Demo.app"), "old");
        assert_eq!(s.parent(), Some(Path::new("/Applications")));
        assert!(s.file_name().unwrap().to_string_lossy().starts_with(".Demo.app.casket-old-"));
    }

    #[tokio::test]
    async fn test_remove_path_handles_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let tree = dir.path().join("t/inner");
        std::fs::create_dir_all(&tree).unwrap();

        remove_path(&file).await.unwrap();
        remove_path(&dir.path().join("t")).await.unwrap();
        remove_path(&dir.path().join("missing")).await.unwrap();
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    fn test_controller(root: &Path) -> Controller {
        Controller::new(
            Layout::rooted(root),
            Arc::new(crate::ledger::MemoryLedger::new()),
            Arc::new(crate::download::HttpFetcher::new().unwrap()),
            Arc::new(extract::ArchiveStager),
        )
    }

    #[tokio::test]
    async fn test_lock_entries_are_pruned_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let controller = test_controller(dir.path());

        let first = controller.lock("demo").await;
        assert_eq!(controller.locks.lock().unwrap().len(), 1);

        let ((), second) = tokio::join!(
            async move {
                tokio::task::yield_now().await;
                drop(first);
            },
            controller.lock("demo")
        );
        // The waiter still holds the entry
        assert_eq!(controller.locks.lock().unwrap().len(), 1);

        drop(second);
        assert!(controller.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_idle_identifiers_are_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let controller = test_controller(dir.path());

        controller.transition("demo", InstallState::Installed);
        assert_eq!(controller.states.lock().unwrap().len(), 1);
        controller.transition("demo", InstallState::Idle);
        assert!(controller.states.lock().unwrap().is_empty());
        assert_eq!(controller.state("demo"), InstallState::Idle);
    }

    #[tokio::test]
    async fn test_restore_displaced_prefers_old_bundle_and_sweeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        std::fs::create_dir_all(dir.path().join(".Demo.app.casket-old-17")).unwrap();
        std::fs::create_dir_all(dir.path().join(".Demo.app.casket-new-17")).unwrap();
        std::fs::create_dir_all(dir.path().join(".Other.app.casket-old-17")).unwrap();

        restore_displaced(&app).await.unwrap();

        assert!(app.is_dir());
        assert!(!dir.path().join(".Demo.app.casket-new-17").exists());
        assert!(dir.path().join(".Other.app.casket-old-17").exists());
    }

    #[tokio::test]
    async fn test_list_version_dirs_skips_hidden_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("1.0")).unwrap();
        std::fs::create_dir_all(dir.path().join(".metadata")).unwrap();
        std::fs::write(dir.path().join("notes"), b"").unwrap();

        let versions: Vec<_> = list_version_dirs(dir.path())
            .await
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(versions, vec!["1.0"]);
    }
}
