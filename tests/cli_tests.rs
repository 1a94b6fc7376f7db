// End-to-end tests for the casket binary
// Artifacts are served from file:// URLs inside an isolated prefix, so these
// run without network access.

use casket::verify;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn prefix(&self) -> PathBuf {
        self.dir.path().join("prefix")
    }

    fn appdir(&self) -> PathBuf {
        self.dir.path().join("Applications")
    }

    fn casket(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_casket"))
            .arg("--prefix")
            .arg(self.prefix())
            .arg("--appdir")
            .arg(self.appdir())
            .args(args)
            .env("NO_COLOR", "1")
            .env("CASKET_CACHE", self.dir.path().join("cache"))
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to run casket")
    }

    /// Gzipped tarball containing `<app>/Contents/MacOS/tool`
    fn artifact(&self, name: &str, app: &str, body: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/Contents/MacOS/tool", app), body)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn manifest(&self, token: &str, version: &str, artifact: &Path, sha256: &str, app: &str) -> PathBuf {
        let url = Url::from_file_path(artifact).unwrap();
        let body = format!(
            "cask '{token}' do\n  version '{version}'\n  sha256 '{sha256}'\n  url '{url}'\n  name '{token}'\n  app '{app}'\nend\n"
        );
        let path = self.dir.path().join(format!("{}-{}.rb", token, version));
        std::fs::write(&path, body).unwrap();
        path
    }
}

fn digest_of(path: &Path) -> String {
    verify::digest(&std::fs::read(path).unwrap())
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_install_list_uninstall_roundtrip() {
    let sandbox = Sandbox::new();
    let artifact = sandbox.artifact("tool-1.0.tar.gz", "Tool.app", b"#!/bin/sh\necho 1\n");
    let manifest = sandbox.manifest("tool", "1.0", &artifact, &digest_of(&artifact), "Tool.app");

    let output = sandbox.casket(&["install", manifest.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(sandbox.appdir().join("Tool.app/Contents/MacOS/tool").is_file());

    let output = sandbox.casket(&["list", "--verify"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("tool"));

    let output = sandbox.casket(&["uninstall", "tool"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(!sandbox.appdir().join("Tool.app").exists());

    let output = sandbox.casket(&["uninstall", "tool"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_checksum_mismatch_exits_with_integrity_code() {
    let sandbox = Sandbox::new();
    let artifact = sandbox.artifact("tool-1.0.tar.gz", "Tool.app", b"payload");
    let wrong = verify::digest(b"something else");
    let manifest = sandbox.manifest("tool", "1.0", &artifact, &wrong, "Tool.app");

    let output = sandbox.casket(&["install", manifest.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains(&wrong));
    assert!(!sandbox.appdir().join("Tool.app").exists());

    let output = sandbox.casket(&["list"]);
    assert!(stdout(&output).contains("No casks installed"));
}

#[test]
fn test_invalid_manifest_exits_with_validation_code() {
    let sandbox = Sandbox::new();
    let path = sandbox.dir.path().join("broken.rb");
    std::fs::write(&path, "cask 'broken' do\n  version '1.0'\nend\n").unwrap();

    let output = sandbox.casket(&["info", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing required field"));
}

#[test]
fn test_highest_exit_code_wins() {
    let sandbox = Sandbox::new();
    let good = sandbox.artifact("good-1.0.tar.gz", "Good.app", b"good");
    let good_manifest = sandbox.manifest("good", "1.0", &good, &digest_of(&good), "Good.app");
    let bad = sandbox.artifact("bad-1.0.tar.gz", "Bad.app", b"bad");
    let bad_manifest = sandbox.manifest("bad", "1.0", &bad, &verify::digest(b"nope"), "Bad.app");
    let missing = sandbox.dir.path().join("missing.rb");

    let output = sandbox.casket(&[
        "install",
        good_manifest.to_str().unwrap(),
        bad_manifest.to_str().unwrap(),
        missing.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(3));
    assert!(sandbox.appdir().join("Good.app").exists());
    assert!(!sandbox.appdir().join("Bad.app").exists());
}

#[test]
fn test_upgrade_via_cli() {
    let sandbox = Sandbox::new();
    let v1 = sandbox.artifact("tool-1.0.tar.gz", "Tool.app", b"v1");
    let v2 = sandbox.artifact("tool-2.0.tar.gz", "Tool.app", b"v2");
    let m1 = sandbox.manifest("tool", "1.0", &v1, &digest_of(&v1), "Tool.app");
    let m2 = sandbox.manifest("tool", "2.0", &v2, &digest_of(&v2), "Tool.app");

    let output = sandbox.casket(&["upgrade", m2.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));

    assert_eq!(sandbox.casket(&["install", m1.to_str().unwrap()]).status.code(), Some(0));
    let output = sandbox.casket(&["upgrade", m2.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("Upgraded"));
    assert_eq!(
        std::fs::read(sandbox.appdir().join("Tool.app/Contents/MacOS/tool")).unwrap(),
        b"v2"
    );
    assert!(!sandbox.prefix().join("Caskroom/tool/1.0").exists());
}

#[test]
fn test_repair_on_consistent_install() {
    let sandbox = Sandbox::new();
    let artifact = sandbox.artifact("tool-1.0.tar.gz", "Tool.app", b"tool");
    let manifest = sandbox.manifest("tool", "1.0", &artifact, &digest_of(&artifact), "Tool.app");
    sandbox.casket(&["install", manifest.to_str().unwrap()]);

    let output = sandbox.casket(&["repair", "tool"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("consistent"));

    assert_eq!(sandbox.casket(&["repair", "ghost"]).status.code(), Some(1));
}

#[test]
fn test_path_like_identifiers_are_rejected() {
    let sandbox = Sandbox::new();
    let artifact = sandbox.artifact("tool-1.0.tar.gz", "Tool.app", b"tool");
    let manifest = sandbox.manifest("tool", "1.0", &artifact, &digest_of(&artifact), "Tool.app");
    sandbox.casket(&["install", manifest.to_str().unwrap()]);

    assert_eq!(sandbox.casket(&["repair", "../ledger/tool"]).status.code(), Some(1));
    assert_eq!(sandbox.casket(&["uninstall", "../ledger/tool"]).status.code(), Some(1));
    assert!(sandbox.prefix().join("var/casket/ledger/tool.json").exists());
    assert!(sandbox.appdir().join("Tool.app").exists());
}

#[test]
fn test_completions() {
    let sandbox = Sandbox::new();
    let output = sandbox.casket(&["completions", "bash"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("casket"));
}
