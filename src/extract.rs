//! Artifact staging: unpacking a verified download into an isolated directory.
//!
//! The stager never writes outside the staging directory it is given. Supported
//! artifact kinds, chosen by file name:
//! - **`.tar.gz` / `.tgz` / `.tar`**: unpacked with `tar` + `flate2`
//! - **`.zip`**: unpacked with the system `unzip`
//! - **`.dmg`**: mounted with `hdiutil` (macOS only), bundle copied out, image detached
//! - **anything else**: the artifact itself is the bundle
//!
//! After unpacking, the bundle named by the manifest's `app` stanza is located
//! (it may sit a couple of directories deep inside an archive).

use crate::manifest::Manifest;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tar::Archive;
use walkdir::WalkDir;

/// How deep inside an unpacked archive the bundle may be
const BUNDLE_SEARCH_DEPTH: usize = 3;

/// Unpacks artifacts into a staging directory
#[async_trait]
pub trait Stager: Send + Sync {
    /// Unpack `artifact` under `staging` and return the path of the bundle
    /// named `manifest.app_bundle_name`.
    async fn stage(&self, artifact: &Path, staging: &Path, manifest: &Manifest) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    TarGz,
    Tar,
    Zip,
    Dmg,
    Plain,
}

impl ArtifactKind {
    pub fn detect(file_name: &str) -> Self {
        let name = file_name.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArtifactKind::TarGz
        } else if name.ends_with(".tar") {
            ArtifactKind::Tar
        } else if name.ends_with(".zip") {
            ArtifactKind::Zip
        } else if name.ends_with(".dmg") {
            ArtifactKind::Dmg
        } else {
            ArtifactKind::Plain
        }
    }
}

/// Default stager for the artifact kinds listed in the module docs
#[derive(Debug, Clone, Default)]
pub struct ArchiveStager;

#[async_trait]
impl Stager for ArchiveStager {
    async fn stage(&self, artifact: &Path, staging: &Path, manifest: &Manifest) -> Result<PathBuf> {
        let artifact = artifact.to_path_buf();
        let staging = staging.to_path_buf();
        let bundle = manifest.app_bundle_name.clone();

        tokio::task::spawn_blocking(move || stage_blocking(&artifact, &staging, &bundle))
            .await
            .context("Staging task panicked")?
    }
}

fn stage_blocking(artifact: &Path, staging: &Path, bundle: &str) -> Result<PathBuf> {
    let contents = staging.join("contents");
    fs::create_dir_all(&contents)
        .with_context(|| format!("Failed to create {}", contents.display()))?;

    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    match ArtifactKind::detect(&file_name) {
        ArtifactKind::TarGz => {
            let file = fs::File::open(artifact)
                .with_context(|| format!("Failed to open archive: {}", artifact.display()))?;
            Archive::new(GzDecoder::new(file))
                .unpack(&contents)
                .with_context(|| format!("Failed to extract {}", file_name))?;
        }
        ArtifactKind::Tar => {
            let file = fs::File::open(artifact)
                .with_context(|| format!("Failed to open archive: {}", artifact.display()))?;
            Archive::new(file)
                .unpack(&contents)
                .with_context(|| format!("Failed to extract {}", file_name))?;
        }
        ArtifactKind::Zip => extract_zip(artifact, &contents)?,
        ArtifactKind::Dmg => copy_from_dmg(artifact, &contents, bundle)?,
        ArtifactKind::Plain => {
            fs::copy(artifact, contents.join(bundle))
                .with_context(|| format!("Failed to stage {}", file_name))?;
        }
    }

    find_bundle(&contents, bundle)
}

/// Locate `bundle` under `root`, shallowest match first
pub fn find_bundle(root: &Path, bundle: &str) -> Result<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(BUNDLE_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy() == bundle)
        .min_by_key(|entry| entry.depth())
        .map(|entry| entry.into_path())
        .with_context(|| format!("Artifact does not contain {}", bundle))
}

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let status = Command::new("unzip")
        .args(["-q", "-o"]) // quiet, overwrite
        .arg(zip_path)
        .arg("-d")
        .arg(dest)
        .status()
        .context("Failed to run unzip")?;

    if !status.success() {
        bail!("Failed to extract ZIP file");
    }
    Ok(())
}

fn copy_from_dmg(dmg_path: &Path, dest: &Path, bundle: &str) -> Result<()> {
    if !cfg!(target_os = "macos") {
        bail!("Disk images can only be staged on macOS");
    }

    let mount_point = mount_dmg(dmg_path)?;
    let copied = copy_tree(&mount_point.join(bundle), &dest.join(bundle));

    if let Err(e) = unmount_dmg(&mount_point) {
        tracing::warn!(mount = %mount_point.display(), error = %e, "failed to detach disk image");
    }
    copied
}

/// Mount a DMG file and return the mount point
fn mount_dmg(dmg_path: &Path) -> Result<PathBuf> {
    let output = Command::new("hdiutil")
        .args(["attach", "-nobrowse", "-readonly"])
        .arg(dmg_path)
        .output()
        .context("Failed to run hdiutil")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Failed to mount DMG: {}", stderr);
    }

    // Output format: /dev/diskX<tab>filesystem<tab>/Volumes/Name
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_mount_point(&stdout).context("Could not find mount point in hdiutil output")
}

fn parse_mount_point(hdiutil_output: &str) -> Option<PathBuf> {
    hdiutil_output
        .lines()
        .filter_map(|line| line.split('\t').map(str::trim).find(|p| p.starts_with("/Volumes/")))
        .next()
        .map(PathBuf::from)
}

fn unmount_dmg(mount_point: &Path) -> Result<()> {
    let output = Command::new("hdiutil")
        .args(["detach", "-quiet"])
        .arg(mount_point)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Failed to unmount DMG: {}", stderr);
    }
    Ok(())
}

/// Recursive copy preserving symlinks, as app bundles contain them
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to read {}", src.display()))?;

    if meta.is_file() {
        fs::copy(src, dest).with_context(|| format!("Failed to copy {}", src.display()))?;
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(&link, dest)
        .with_context(|| format!("Failed to create symlink {}", dest.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)?;
    Ok(())
}
