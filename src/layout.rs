//! Filesystem layout: prefix, Caskroom, application directory, staging and ledger paths.
//!
//! ```text
//! <prefix>/
//!   Caskroom/<token>/<version>/   manifest.json + verified artifact
//!   var/casket/ledger/            one <token>.json record per installed cask
//!   var/casket/staging/           per-operation temporary directories
//! <appdir>/<App>.app              final install location
//! ```
//!
//! Staging lives under the prefix so promoting a staged bundle into the
//! Caskroom is a same-filesystem rename.

use std::path::{Path, PathBuf};

/// Detect the install prefix on this system
pub fn detect_prefix() -> PathBuf {
    // First check environment variable
    if let Some(prefix) = std::env::var_os("CASKET_PREFIX") {
        return PathBuf::from(prefix);
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        PathBuf::from("/opt/homebrew")
    }
    #[cfg(all(target_os = "macos", not(target_arch = "aarch64")))]
    {
        PathBuf::from("/usr/local")
    }
    #[cfg(not(target_os = "macos"))]
    {
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".casket"),
            None => PathBuf::from(".casket"),
        }
    }
}

/// Detect where application bundles are installed
pub fn detect_appdir(prefix: &Path) -> PathBuf {
    if let Some(appdir) = std::env::var_os("CASKET_APPDIR") {
        return PathBuf::from(appdir);
    }

    if cfg!(target_os = "macos") {
        PathBuf::from("/Applications")
    } else {
        prefix.join("Applications")
    }
}

/// Download cache directory (~/.cache/casket/downloads or equivalent)
pub fn detect_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CASKET_CACHE") {
        PathBuf::from(dir)
    } else if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("casket/downloads")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/casket/downloads")
    } else {
        PathBuf::from(".cache/casket/downloads")
    }
}

/// Resolved paths for one installation root
#[derive(Debug, Clone)]
pub struct Layout {
    pub prefix: PathBuf,
    pub appdir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Layout {
    /// Layout from the environment, with optional overrides from the command line
    pub fn detect(prefix: Option<PathBuf>, appdir: Option<PathBuf>) -> Self {
        let prefix = prefix.unwrap_or_else(detect_prefix);
        let appdir = appdir.unwrap_or_else(|| detect_appdir(&prefix));
        Self {
            prefix,
            appdir,
            cache_dir: detect_cache_dir(),
        }
    }

    /// Self-contained layout rooted at `root`, used by tests
    pub fn rooted(root: &Path) -> Self {
        Self {
            prefix: root.to_path_buf(),
            appdir: root.join("Applications"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn caskroom(&self) -> PathBuf {
        self.prefix.join("Caskroom")
    }

    /// Caskroom directory holding every version of one cask
    pub fn cask_dir(&self, identifier: &str) -> PathBuf {
        self.caskroom().join(identifier)
    }

    pub fn cask_version_dir(&self, identifier: &str, version: &str) -> PathBuf {
        self.cask_dir(identifier).join(version)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.prefix.join("var/casket/ledger")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.prefix.join("var/casket/staging")
    }

    /// Final location of an application bundle
    pub fn app_path(&self, app_bundle_name: &str) -> PathBuf {
        self.appdir.join(app_bundle_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout() {
        let layout = Layout::rooted(Path::new("/tmp/casket-root"));
        assert_eq!(layout.caskroom(), Path::new("/tmp/casket-root/Caskroom"));
        assert_eq!(
            layout.cask_version_dir("hv-kb390l-config", "1.0.0"),
            Path::new("/tmp/casket-root/Caskroom/hv-kb390l-config/1.0.0")
        );
        assert_eq!(
            layout.app_path("hv-kb390l-config.app"),
            Path::new("/tmp/casket-root/Applications/hv-kb390l-config.app")
        );
        assert!(layout.staging_dir().starts_with(&layout.prefix));
        assert!(layout.ledger_dir().ends_with("ledger"));
    }

    #[test]
    fn test_detect_with_overrides() {
        let layout = Layout::detect(
            Some(PathBuf::from("/p")),
            Some(PathBuf::from("/apps")),
        );
        assert_eq!(layout.prefix, Path::new("/p"));
        assert_eq!(layout.appdir, Path::new("/apps"));
    }
}
