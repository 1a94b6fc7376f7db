//! SHA-256 integrity checks for downloaded and retained artifacts.

use crate::error::IntegrityError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of `bytes`
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check `bytes` against `expected` (hex, any case).
///
/// Empty input is rejected before hashing so a truncated download is not
/// reported as a checksum mismatch.
pub fn verify(bytes: &[u8], expected: &str) -> Result<(), IntegrityError> {
    if bytes.is_empty() {
        return Err(IntegrityError::EmptyArtifact);
    }
    compare(digest(bytes), expected)
}

/// Streaming SHA-256 of a file on disk, returning the digest and byte count
pub fn digest_file_blocking(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let total = io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Check a file on disk against `expected`. I/O errors are returned as the outer error.
pub fn verify_file_blocking(path: &Path, expected: &str) -> io::Result<Result<(), IntegrityError>> {
    let (actual, len) = digest_file_blocking(path)?;
    if len == 0 {
        return Ok(Err(IntegrityError::EmptyArtifact));
    }
    Ok(compare(actual, expected))
}

/// Async form of [`verify_file_blocking`], hashing on the blocking pool
pub async fn verify_file(path: &Path, expected: &str) -> io::Result<Result<(), IntegrityError>> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || verify_file_blocking(&path, &expected))
        .await
        .map_err(io::Error::other)?
}

/// Digest of a whole bundle tree: each entry's relative path and kind, plus
/// file contents and symlink targets, walked in name order. Permissions and
/// timestamps are not covered, so a copy digests the same as the original.
pub fn digest_tree_blocking(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let file_type = entry.file_type();

        let kind: &[u8] = if file_type.is_symlink() {
            b"l"
        } else if file_type.is_dir() {
            b"d"
        } else {
            b"f"
        };
        hasher.update(kind);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            let mut file = File::open(entry.path())?;
            hasher.update(file.metadata()?.len().to_le_bytes());
            io::copy(&mut file, &mut hasher)?;
        }
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Async form of [`digest_tree_blocking`]
pub async fn digest_tree(root: &Path) -> io::Result<String> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || digest_tree_blocking(&root))
        .await
        .map_err(io::Error::other)?
}

fn compare(actual: String, expected: &str) -> Result<(), IntegrityError> {
    if digests_equal(&actual, expected) {
        Ok(())
    } else {
        Err(IntegrityError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// Case-insensitive comparison that inspects every byte whatever the position
/// of the first difference.
fn digests_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| {
            acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase())
        })
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        assert_eq!(
            digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest(b"hello").len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_verify_accepts_own_digest_in_any_case() {
        let bytes = b"artifact bytes";
        let hash = digest(bytes);
        assert!(verify(bytes, &hash).is_ok());
        assert!(verify(bytes, &hash.to_uppercase()).is_ok());
    }

    #[test]
    fn test_verify_reports_both_digests() {
        let bytes = b"artifact bytes";
        let other = digest(b"something else");
        match verify(bytes, &other) {
            Err(IntegrityError::HashMismatch { expected, actual }) => {
                assert_eq!(expected, other);
                assert_eq!(actual, digest(bytes));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_rejects_empty() {
        assert_eq!(
            verify(b"", &digest(b"")),
            Err(IntegrityError::EmptyArtifact)
        );
    }

    #[test]
    fn test_digests_equal_length_mismatch() {
        assert!(!digests_equal("abc", "abcd"));
        assert!(digests_equal("ABC", "abc"));
        assert!(!digests_equal("abd", "abc"));
    }

    #[tokio::test]
    async fn test_verify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"on disk").unwrap();

        let (hash, len) = digest_file_blocking(&path).unwrap();
        assert_eq!(hash, digest(b"on disk"));
        assert_eq!(len, 7);
        assert!(verify_file(&path, &hash).await.unwrap().is_ok());
        assert!(matches!(
            verify_file(&path, &digest(b"x")).await.unwrap(),
            Err(IntegrityError::HashMismatch { .. })
        ));

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(
            verify_file(&empty, &hash).await.unwrap(),
            Err(IntegrityError::EmptyArtifact)
        );
    }

    fn bundle(root: &Path, payload: &[u8]) {
        std::fs::create_dir_all(root.join("Contents/MacOS")).unwrap();
        std::fs::write(root.join("Contents/MacOS/demo"), payload).unwrap();
        std::fs::write(root.join("Contents/Info.plist"), b"<plist/>").unwrap();
    }

    #[tokio::test]
    async fn test_digest_tree_tracks_content_not_location() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/Demo.app");
        let b = dir.path().join("b/Demo.app");
        let c = dir.path().join("c/Demo.app");
        bundle(&a, b"v1");
        bundle(&b, b"v1");
        bundle(&c, b"v2");

        let digest_a = digest_tree(&a).await.unwrap();
        assert_eq!(digest_a, digest_tree(&b).await.unwrap());
        assert_ne!(digest_a, digest_tree(&c).await.unwrap());

        std::fs::write(b.join("Contents/extra"), b"").unwrap();
        assert_ne!(digest_a, digest_tree(&b).await.unwrap());
    }

    #[test]
    fn test_digest_tree_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(digest_tree_blocking(&dir.path().join("absent")).is_err());
    }
}
