//! Client configuration.
//!
//! All configuration is an explicit value threaded through the client
//! constructor; there is no process-wide singleton.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// The registry used when a dependency does not name one.
pub const DEFAULT_OCI_REGISTRY: &str = "ghcr.io";

/// The repository namespace used when a dependency does not name one.
pub const DEFAULT_OCI_REPO: &str = "kcl-lang";

/// OCI manifest annotation carrying the package checksum.
pub const OCI_MANIFEST_SUM_ANNOTATION: &str = "org.kcllang.sum";

/// Environment variable selecting the package cache root.
pub const KPM_HOME_ENV: &str = "KPM_HOME";

/// Default cache directory name under the user home.
const DEFAULT_HOME_DIR: &str = ".kpm";

/// Errors that can occur while assembling the settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("cannot determine the user home directory")]
    NoUserHome,

    #[error("failed to create the package cache directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Client configuration: cache root and registry defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of the global package cache.
    pub kpm_home: PathBuf,

    /// Registry host used for dependencies without an explicit registry.
    pub default_oci_registry: String,

    /// Repository namespace used for dependencies without an explicit repo.
    pub default_oci_repo: String,
}

impl Settings {
    /// Assemble settings from the environment.
    ///
    /// `$KPM_HOME` selects the cache root; otherwise `<user_home>/.kpm` is
    /// used and created on demand.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined or the cache
    /// root cannot be created.
    pub fn from_env() -> Result<Self, SettingsError> {
        let kpm_home = match std::env::var_os(KPM_HOME_ENV) {
            Some(home) if !home.is_empty() => PathBuf::from(home),
            _ => dirs::home_dir()
                .ok_or(SettingsError::NoUserHome)?
                .join(DEFAULT_HOME_DIR),
        };

        Self::with_home(kpm_home)
    }

    /// Settings rooted at an explicit cache directory, created on demand.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or made absolute.
    pub fn with_home(kpm_home: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let kpm_home = kpm_home.into();
        std::fs::create_dir_all(&kpm_home)?;
        let kpm_home = kpm_home.canonicalize()?;

        Ok(Self {
            kpm_home,
            default_oci_registry: DEFAULT_OCI_REGISTRY.to_string(),
            default_oci_repo: DEFAULT_OCI_REPO.to_string(),
        })
    }

    /// The cache root.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.kpm_home
    }

    /// The default repository path for a package name, `<repo>/<name>`.
    #[must_use]
    pub fn default_repo_for(&self, name: &str) -> String {
        format!("{}/{}", self.default_oci_repo, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn with_home_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("cache");

        let settings = Settings::with_home(&home).unwrap();

        assert!(home.is_dir());
        assert!(settings.home().is_absolute());
        assert_eq!(settings.default_oci_registry, DEFAULT_OCI_REGISTRY);
    }

    #[test]
    fn default_repo_joins_namespace_and_name() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::with_home(tmp.path()).unwrap();
        assert_eq!(settings.default_repo_for("k8s"), "kcl-lang/k8s");
    }
}
