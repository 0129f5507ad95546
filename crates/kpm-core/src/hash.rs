//! Content addressing for package directories.
//!
//! A package checksum is the SHA-256 over the raw contents of every regular
//! file under the directory, visited in lexicographic order of the full
//! path, encoded as standard base64.
//!
//! Two properties are load-bearing for compatibility with existing lock
//! files and must not change:
//!
//! - paths containing `.git` are skipped, so clones of the same repository
//!   taken at different times hash identically;
//! - file names are not mixed into the digest, only file contents in walk
//!   order.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Errors that can occur while hashing a directory.
#[derive(Error, Debug)]
pub enum HashError {
    #[error("failed to read package contents: {0}")]
    Io(#[from] io::Error),

    #[error("failed to walk package directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Compute the checksum of a directory.
///
/// # Errors
///
/// Any I/O error aborts and propagates; there is no partial digest.
pub fn hash_dir(dir: impl AsRef<Path>) -> Result<String, HashError> {
    let mut hasher = Sha256::new();

    let walk = WalkDir::new(dir.as_ref()).sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for entry in walk {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().to_string_lossy().contains(".git") {
            continue;
        }

        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut hasher)?;
    }

    Ok(BASE64.encode(hasher.finalize()))
}

/// Whether a directory matches an expected checksum.
///
/// An empty expected sum never matches, and a directory that cannot be
/// hashed never matches.
#[must_use]
pub fn check_sum(expected: &str, dir: impl AsRef<Path>) -> bool {
    if expected.is_empty() {
        return false;
    }

    match hash_dir(dir) {
        Ok(sum) => sum == expected,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn hash_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.k", "a = 1\n");
        write(tmp.path(), "sub/b.k", "b = 2\n");

        assert_eq!(hash_dir(tmp.path()).unwrap(), hash_dir(tmp.path()).unwrap());
    }

    #[test]
    fn hash_survives_copy_to_new_path() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src, "a.k", "a = 1\n");
        write(&src, "sub/b.k", "b = 2\n");
        write(&dst, "a.k", "a = 1\n");
        write(&dst, "sub/b.k", "b = 2\n");

        assert_eq!(hash_dir(&src).unwrap(), hash_dir(&dst).unwrap());
    }

    #[test]
    fn git_metadata_does_not_affect_hash() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("plain");
        let cloned = tmp.path().join("cloned");
        write(&plain, "a.k", "a = 1\n");
        write(&cloned, "a.k", "a = 1\n");
        write(&cloned, ".git/HEAD", "ref: refs/heads/main\n");
        write(&cloned, ".git/objects/aa/bb", "blob");

        assert_eq!(hash_dir(&plain).unwrap(), hash_dir(&cloned).unwrap());
    }

    #[test]
    fn file_names_are_not_part_of_the_hash() {
        // Lock-file compatibility: only contents are hashed, in walk order.
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");
        write(&one, "main.k", "x = 1\n");
        write(&two, "renamed.k", "x = 1\n");

        assert_eq!(hash_dir(&one).unwrap(), hash_dir(&two).unwrap());
    }

    #[test]
    fn contents_change_the_hash() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");
        write(&one, "main.k", "x = 1\n");
        write(&two, "main.k", "x = 2\n");

        assert_ne!(hash_dir(&one).unwrap(), hash_dir(&two).unwrap());
    }

    #[test]
    fn check_sum_rejects_empty_expectation() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.k", "a = 1\n");

        assert!(!check_sum("", tmp.path()));

        let sum = hash_dir(tmp.path()).unwrap();
        assert!(check_sum(&sum, tmp.path()));
        assert!(!check_sum("bogus", tmp.path()));
    }

    #[test]
    fn hash_of_missing_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(hash_dir(tmp.path().join("absent")).is_err());
    }
}
