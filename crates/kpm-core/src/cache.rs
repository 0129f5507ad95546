//! The global package cache under the kpm home directory.
//!
//! The cache holds one subdirectory per resolved `(name, version)` pair,
//! named by the dependency `full_name`. Mutation is serialized across
//! processes by an advisory file lock; reads observe whatever state the
//! last lock-holder left.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use fs2::FileExt;

use crate::hash;
use crate::manifest::Dependency;
use crate::reporter::{Event, Reporter};

/// Lock file name under the cache root.
const CACHE_LOCK_FILE: &str = "package-cache.lock";

/// Errors that can occur while operating on the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to access the package cache: {0}")]
    Io(#[from] io::Error),
}

/// The content-addressed package cache.
#[derive(Debug, Clone)]
pub struct PackageCache {
    home: PathBuf,
}

impl PackageCache {
    /// A cache rooted at the given kpm home directory.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The cache root.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The cache entry directory for a `full_name`.
    #[must_use]
    pub fn path(&self, full_name: &str) -> PathBuf {
        self.home.join(full_name)
    }

    /// Whether the cache holds a directory for this dependency that hashes
    /// to its locked checksum. An empty checksum never matches.
    #[must_use]
    pub fn exists_and_matches(&self, dep: &Dependency) -> bool {
        let entry = self.path(&dep.full_name);
        entry.exists() && hash::check_sum(&dep.sum, &entry)
    }

    /// Remove a cache entry before a re-fetch. Missing entries are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing entry cannot be deleted.
    pub fn remove(&self, full_name: &str) -> Result<(), CacheError> {
        let entry = self.path(full_name);
        if entry.exists() {
            fs::remove_dir_all(entry)?;
        }
        Ok(())
    }

    /// Acquire the exclusive cache lock, blocking until it is free.
    ///
    /// Held for the full duration of any cache-mutating resolution. A
    /// contended acquisition is reported before blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub fn acquire_lock(&self, reporter: &Reporter) -> Result<CacheLock, CacheError> {
        fs::create_dir_all(&self.home)?;
        let lock_path = self.home.join(CACHE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if file.try_lock_exclusive().is_err() {
            reporter.report(&Event::WaitingForLock(lock_path.display().to_string()));
            file.lock_exclusive()?;
        }

        Ok(CacheLock { _file: file })
    }
}

/// An exclusive, non-reentrant hold on the package cache.
///
/// The lock is released when the guard is dropped and the descriptor
/// closes.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Source;
    use tempfile::TempDir;

    fn dep_with_sum(name: &str, version: &str, sum: &str) -> Dependency {
        let mut dep = Dependency::new(
            name,
            version,
            Source::Oci {
                reg: "ghcr.io".to_string(),
                repo: format!("kcl-lang/{name}"),
                tag: version.to_string(),
            },
        );
        dep.sum = sum.to_string();
        dep
    }

    #[test]
    fn path_is_home_joined_with_full_name() {
        let cache = PackageCache::new("/cache");
        assert_eq!(cache.path("k8s_1.27"), PathBuf::from("/cache/k8s_1.27"));
    }

    #[test]
    fn exists_and_matches_requires_matching_sum() {
        let tmp = TempDir::new().unwrap();
        let cache = PackageCache::new(tmp.path());

        let entry = cache.path("k8s_1.27");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("main.k"), "a = 1\n").unwrap();
        let sum = hash::hash_dir(&entry).unwrap();

        assert!(cache.exists_and_matches(&dep_with_sum("k8s", "1.27", &sum)));
        assert!(!cache.exists_and_matches(&dep_with_sum("k8s", "1.27", "other")));
        // Empty sums never match, even when the directory exists.
        assert!(!cache.exists_and_matches(&dep_with_sum("k8s", "1.27", "")));
        // Missing directories never match.
        assert!(!cache.exists_and_matches(&dep_with_sum("k8s", "1.28", &sum)));
    }

    #[test]
    fn remove_deletes_entry_and_tolerates_absence() {
        let tmp = TempDir::new().unwrap();
        let cache = PackageCache::new(tmp.path());

        let entry = cache.path("k8s_1.27");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("main.k"), "a = 1\n").unwrap();

        cache.remove("k8s_1.27").unwrap();
        assert!(!entry.exists());

        cache.remove("k8s_1.27").unwrap();
    }

    #[test]
    fn lock_can_be_acquired_and_reacquired() {
        let tmp = TempDir::new().unwrap();
        let cache = PackageCache::new(tmp.path());
        let reporter = Reporter::silent();

        let guard = cache.acquire_lock(&reporter).unwrap();
        drop(guard);
        let _guard = cache.acquire_lock(&reporter).unwrap();
    }
}
