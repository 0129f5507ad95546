//! TAR packing and unpacking for package artifacts.
//!
//! Packages travel as plain uncompressed `*.tar` files. Packing skips any
//! path containing `.git` or `.tar`, so VCS metadata and previously built
//! artifacts never end up inside a new artifact.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

/// Path fragments excluded from packed archives.
const TAR_IGNORES: &[&str] = &[".git", ".tar"];

/// Errors that can occur while packing or unpacking an archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to read or write archive: {0}")]
    Io(#[from] io::Error),

    #[error("failed to walk source directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Pack a directory into a plain TAR file at `tar_path`.
///
/// # Errors
///
/// Returns an error if the source cannot be walked or the archive cannot be
/// written.
pub fn tar_dir(src: &Path, tar_path: &Path) -> Result<(), ArchiveError> {
    let file = File::create(tar_path)?;
    let mut builder = tar::Builder::new(file);

    let walk = WalkDir::new(src)
        .min_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for entry in walk {
        let entry = entry?;
        let path = entry.path();
        let lossy = path.to_string_lossy();
        if TAR_IGNORES.iter().any(|ignore| lossy.contains(ignore)) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };

        if entry.file_type().is_dir() {
            builder.append_dir(rel, path)?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(path, rel)?;
        }
        // Symbolic links are not packed.
    }

    builder.finish()?;
    Ok(())
}

/// Unpack a TAR file into a directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or entries cannot be
/// written.
pub fn untar_dir(tar_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest)?;
    let file = File::open(tar_path)?;
    let mut archive = tar::Archive::new(file);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn tar_round_trip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write(&src, "kcl.mod", "[package]\nname = \"demo\"\n");
        write(&src, "sub/main.k", "a = 1\n");

        let tar_path = tmp.path().join("demo.tar");
        tar_dir(&src, &tar_path).unwrap();

        let out = tmp.path().join("out");
        untar_dir(&tar_path, &out).unwrap();

        assert_eq!(
            fs::read_to_string(out.join("kcl.mod")).unwrap(),
            "[package]\nname = \"demo\"\n"
        );
        assert_eq!(fs::read_to_string(out.join("sub/main.k")).unwrap(), "a = 1\n");
    }

    #[test]
    fn git_and_tar_paths_are_excluded() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write(&src, "main.k", "a = 1\n");
        write(&src, ".git/HEAD", "ref: refs/heads/main\n");
        write(&src, "old.tar", "stale artifact");

        let tar_path = tmp.path().join("demo.tar");
        tar_dir(&src, &tar_path).unwrap();

        let out = tmp.path().join("out");
        untar_dir(&tar_path, &out).unwrap();

        assert!(out.join("main.k").exists());
        assert!(!out.join(".git").exists());
        assert!(!out.join("old.tar").exists());
    }

    #[test]
    fn untar_creates_destination() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write(&src, "main.k", "a = 1\n");

        let tar_path = tmp.path().join("demo.tar");
        tar_dir(&src, &tar_path).unwrap();

        let out = tmp.path().join("deeply/nested/out");
        untar_dir(&tar_path, &out).unwrap();
        assert!(out.join("main.k").exists());
    }
}
