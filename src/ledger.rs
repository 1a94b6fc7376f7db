//! Installed-state ledger: the durable record of which casks are installed.
//!
//! The ledger is the only component that owns [`InstalledRecord`] lifetimes.
//! A record is written after an install has placed its files and deleted after
//! an uninstall has removed them, so the ledger never claims more than is on disk
//! except across a crash, which `repair` resolves.
//!
//! [`FileLedger`] stores one JSON file per identifier:
//! ```text
//! <prefix>/var/casket/ledger/
//!   hv-kb390l-config.json
//! ```
//! Each write goes to a temporary file that is synced, renamed over the record
//! and followed by a directory sync, so a successful return means the record
//! survives a crash. [`MemoryLedger`] is the in-memory substitute used in tests.

use crate::error::{CasketError, Result};
use crate::manifest::Manifest;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// One installed cask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub identifier: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    /// Digest verified at install time
    pub content_hash: String,
    pub app_bundle_name: String,
    /// Absolute path of the installed bundle
    pub install_path: PathBuf,
}

impl InstalledRecord {
    pub fn new(manifest: &Manifest, install_path: PathBuf) -> Self {
        Self {
            identifier: manifest.identifier.clone(),
            version: manifest.version.clone(),
            installed_at: Utc::now(),
            content_hash: manifest.content_hash.clone(),
            app_bundle_name: manifest.app_bundle_name.clone(),
            install_path,
        }
    }

    /// Same identifier, version and content hash
    pub fn matches(&self, manifest: &Manifest) -> bool {
        self.identifier == manifest.identifier
            && self.version == manifest.version
            && self.content_hash.eq_ignore_ascii_case(&manifest.content_hash)
    }
}

/// Durable key-value store of installed records, keyed by identifier.
///
/// Implementations must make `put` and `delete` durable before returning and
/// must give read-your-writes consistency per identifier.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>>;

    /// Create or replace the record for `record.identifier`
    async fn put(&self, record: &InstalledRecord) -> Result<()>;

    /// Remove a record. Removing an absent identifier succeeds.
    async fn delete(&self, identifier: &str) -> Result<()>;

    /// All records, sorted by identifier
    async fn list_all(&self) -> Result<Vec<InstalledRecord>>;
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ledger backed by one JSON file per identifier
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, identifier: &str) -> PathBuf {
        self.root.join(format!("{}.json", identifier))
    }

    async fn read_record(path: &Path) -> anyhow::Result<Option<InstalledRecord>> {
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let record = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    async fn write_record(&self, record: &InstalledRecord) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create ledger directory: {}", self.root.display()))?;

        let json =
            serde_json::to_vec_pretty(record).context("Failed to serialize installed record")?;

        let tmp_path = self.root.join(format!(
            ".{}.{}.{}.partial",
            record.identifier,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let final_path = self.record_path(&record.identifier);

        let result = async {
            let mut file = fs::File::create(&tmp_path)
                .await
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(&json).await?;
            file.sync_all()
                .await
                .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
            drop(file);

            fs::rename(&tmp_path, &final_path).await.with_context(|| {
                format!(
                    "Failed to move record into place ({} -> {})",
                    tmp_path.display(),
                    final_path.display()
                )
            })?;
            anyhow::Ok(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result?;

        fsync_dir(&self.root).await;
        Ok(())
    }

    async fn remove_record(&self, identifier: &str) -> anyhow::Result<()> {
        let path = self.record_path(identifier);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
        fsync_dir(&self.root).await;
        Ok(())
    }

    async fn read_all(&self) -> anyhow::Result<Vec<InstalledRecord>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read ledger: {}", self.root.display()));
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();

            // Skip in-flight temporaries and anything that isn't a record
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }

            if let Some(record) = Self::read_record(&entry.path()).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>> {
        Self::read_record(&self.record_path(identifier))
            .await
            .map_err(CasketError::ledger)
    }

    async fn put(&self, record: &InstalledRecord) -> Result<()> {
        self.write_record(record).await.map_err(CasketError::ledger)?;
        tracing::debug!(identifier = %record.identifier, version = %record.version, "ledger record written");
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.remove_record(identifier)
            .await
            .map_err(CasketError::ledger)?;
        tracing::debug!(identifier, "ledger record deleted");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<InstalledRecord>> {
        self.read_all().await.map_err(CasketError::ledger)
    }
}

/// Directory sync so a rename or unlink is durable. Not supported everywhere, so
/// failures are only logged.
async fn fsync_dir(dir: &Path) {
    let result = async { fs::File::open(dir).await?.sync_all().await }.await;
    if let Err(e) = result {
        tracing::debug!(dir = %dir.display(), error = %e, "directory sync skipped");
    }
}

/// In-memory ledger with failure injection
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<BTreeMap<String, InstalledRecord>>>,
    fail_writes: Arc<Mutex<Vec<String>>>,
    fail_reads: Arc<Mutex<Vec<String>>>,
    writes: Arc<AtomicU64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `put`/`delete` fail for `identifier` until cleared
    pub fn inject_failure(&self, identifier: impl Into<String>) {
        if let Ok(mut fail) = self.fail_writes.lock() {
            fail.push(identifier.into());
        }
    }

    /// Make `get` fail for `identifier` until cleared
    pub fn inject_read_failure(&self, identifier: impl Into<String>) {
        if let Ok(mut fail) = self.fail_reads.lock() {
            fail.push(identifier.into());
        }
    }

    pub fn clear_failures(&self) {
        for list in [&self.fail_writes, &self.fail_reads] {
            if let Ok(mut fail) = list.lock() {
                fail.clear();
            }
        }
    }

    /// Number of successful writes (puts and deletes)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self, identifier: &str) -> Result<()> {
        let fail = self
            .fail_writes
            .lock()
            .map_err(|_| CasketError::ledger("ledger lock poisoned"))?;
        if fail.iter().any(|id| id == identifier) {
            return Err(CasketError::ledger(format!(
                "injected write failure for {}",
                identifier
            )));
        }
        Ok(())
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, InstalledRecord>>> {
        self.records
            .lock()
            .map_err(|_| CasketError::ledger("ledger lock poisoned"))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>> {
        let unreadable = self
            .fail_reads
            .lock()
            .map_err(|_| CasketError::ledger("ledger lock poisoned"))?
            .iter()
            .any(|id| id == identifier);
        if unreadable {
            return Err(CasketError::ledger(format!(
                "injected read failure for {}",
                identifier
            )));
        }
        Ok(self.records()?.get(identifier).cloned())
    }

    async fn put(&self, record: &InstalledRecord) -> Result<()> {
        self.check_writable(&record.identifier)?;
        self.records()?
            .insert(record.identifier.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.check_writable(identifier)?;
        self.records()?.remove(identifier);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<InstalledRecord>> {
        Ok(self.records()?.values().cloned().collect())
    }
}
