//! In-memory package state: manifest, lock, and home path.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::lockfile::{self, LockError};
use crate::manifest::{Dependencies, ManifestError, ModFile};

/// Name of the project-local vendor directory.
pub const VENDOR_DIR: &str = "vendor";

/// Errors that can occur while loading or persisting a package.
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("could not load 'kcl.mod': {0}")]
    Manifest(#[from] ManifestError),

    #[error("could not load 'kcl.mod.lock': {0}")]
    Lock(#[from] LockError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("'$KPM_HOME' cannot point at the current package root '{}'", .0.display())]
    CacheInsidePackage(PathBuf),
}

/// A loaded package: manifest intent plus locked state, rooted at a
/// directory.
#[derive(Debug, Clone)]
pub struct Package {
    /// The parsed manifest.
    pub mod_file: ModFile,

    /// The locked dependencies.
    pub deps: Dependencies,

    /// Project root; the manifest and lock files live directly under it.
    pub home_path: PathBuf,

    /// Whether resolution materializes into the project-local vendor tree.
    vendor: bool,
}

impl Package {
    /// Assemble a package from already-parsed parts.
    #[must_use]
    pub fn new(mod_file: ModFile, deps: Dependencies, home_path: impl Into<PathBuf>) -> Self {
        Self {
            mod_file,
            deps,
            home_path: home_path.into(),
            vendor: false,
        }
    }

    /// Read manifest and lock from a package root.
    ///
    /// A missing lock file yields an empty lock; a missing or malformed
    /// manifest is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be loaded or an existing
    /// lock file is malformed.
    pub fn read(home_path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let home_path = home_path.as_ref();
        let mod_file = ModFile::load(home_path)?;
        let deps = lockfile::load_lock_deps(home_path)?;
        Ok(Self::new(mod_file, deps, home_path))
    }

    /// The package `<name>_<version>` identifier.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.mod_file.package.name, self.mod_file.package.version)
    }

    /// The project-local vendor directory.
    #[must_use]
    pub fn vendor_path(&self) -> PathBuf {
        self.home_path.join(VENDOR_DIR)
    }

    /// Whether vendor mode is active.
    #[must_use]
    pub fn is_vendor_mode(&self) -> bool {
        self.vendor
    }

    /// Switch vendor mode on or off for this resolution.
    pub fn set_vendor_mode(&mut self, vendor: bool) {
        self.vendor = vendor;
    }

    /// Default artifact path, `<home>/<name>-<version>.tar`.
    #[must_use]
    pub fn default_tar_path(&self) -> PathBuf {
        self.home_path.join(format!(
            "{}-{}.tar",
            self.mod_file.package.name, self.mod_file.package.version
        ))
    }

    /// Persist manifest and lock from the current in-memory state.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub fn save(&self) -> Result<(), PackageError> {
        self.mod_file.store()?;
        self.store_lock()?;
        Ok(())
    }

    /// Persist only the lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be written.
    pub fn store_lock(&self) -> Result<(), PackageError> {
        lockfile::store_lock_deps(&self.home_path, &self.deps)?;
        Ok(())
    }

    /// Refuse to operate on a package whose root is the cache root itself.
    ///
    /// # Errors
    ///
    /// Returns an error if `kpm_home` resolves to the package root.
    pub fn validate_kpm_home(&self, kpm_home: &Path) -> Result<(), PackageError> {
        let home = self.home_path.canonicalize().unwrap_or_else(|_| self.home_path.clone());
        let cache = kpm_home.canonicalize().unwrap_or_else(|_| kpm_home.to_path_buf());
        if home == cache {
            return Err(PackageError::CacheInsidePackage(self.home_path.clone()));
        }
        Ok(())
    }
}
