//! Lock file (`kcl.mod.lock`) parsing and serialization.
//!
//! The lock file records the concrete resolution of the manifest: for every
//! dependency its resolved tag, checksum, and cache basename. A missing lock
//! file is not an error; it reads as an empty lock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::manifest::{Dependencies, Dependency, Source};

/// The lock filename.
pub const LOCK_FILE: &str = "kcl.mod.lock";

/// Errors that can occur when working with lock files.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to read lock file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse lock file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize lock file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to serialize dependency metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialized shape of one locked dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LockedDep {
    name: String,
    full_name: String,

    #[serde(default)]
    version: String,

    #[serde(default)]
    sum: String,

    // OCI source fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oci_tag: Option<String>,

    // Git source fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_tag: Option<String>,

    // Local source field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

impl From<&Dependency> for LockedDep {
    fn from(dep: &Dependency) -> Self {
        let mut locked = Self {
            name: dep.name.clone(),
            full_name: dep.full_name.clone(),
            version: dep.version.clone(),
            sum: dep.sum.clone(),
            ..Self::default()
        };
        match &dep.source {
            Source::Oci { reg, repo, tag } => {
                locked.reg = Some(reg.clone());
                locked.repo = Some(repo.clone());
                locked.oci_tag = Some(tag.clone());
            }
            Source::Git { url, tag } => {
                locked.url = Some(url.clone());
                locked.git_tag = Some(tag.clone());
            }
            Source::Local { path } => {
                locked.path = Some(path.to_string_lossy().into_owned());
            }
        }
        locked
    }
}

impl LockedDep {
    fn into_dependency(self) -> Dependency {
        let source = if let Some(path) = self.path {
            Source::Local { path: path.into() }
        } else if let Some(url) = self.url {
            Source::Git {
                url,
                tag: self.git_tag.unwrap_or_default(),
            }
        } else {
            Source::Oci {
                reg: self.reg.unwrap_or_default(),
                repo: self.repo.unwrap_or_default(),
                tag: self.oci_tag.unwrap_or_default(),
            }
        };
        Dependency {
            name: self.name,
            version: self.version,
            full_name: self.full_name,
            sum: self.sum,
            local_full_path: None,
            source,
        }
    }
}

/// Serialized shape of the lock file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockToml {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    dependencies: BTreeMap<String, LockedDep>,
}

/// Path of the lock file for a package root.
#[must_use]
pub fn lock_file_path(pkg_path: &Path) -> PathBuf {
    pkg_path.join(LOCK_FILE)
}

/// Load the locked dependencies of a package.
///
/// A missing lock file yields an empty collection.
///
/// # Errors
///
/// Returns an error if an existing lock file is unreadable or malformed.
pub fn load_lock_deps(pkg_path: &Path) -> Result<Dependencies, LockError> {
    let path = lock_file_path(pkg_path);
    if !path.exists() {
        return Ok(Dependencies::default());
    }

    let content = std::fs::read_to_string(path)?;
    let raw: LockToml = toml::from_str(&content)?;
    let mut deps = Dependencies::default();
    for (name, locked) in raw.dependencies {
        let mut dep = locked.into_dependency();
        dep.name = name;
        deps.insert(dep);
    }
    Ok(deps)
}

/// Write the locked dependencies of a package.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn store_lock_deps(pkg_path: &Path, deps: &Dependencies) -> Result<(), LockError> {
    std::fs::write(lock_file_path(pkg_path), to_lock_toml_string(deps)?)?;
    Ok(())
}

/// Render dependencies in the lock file format.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_lock_toml_string(deps: &Dependencies) -> Result<String, LockError> {
    let raw = LockToml {
        dependencies: deps
            .deps
            .iter()
            .map(|(name, dep)| (name.clone(), LockedDep::from(dep)))
            .collect(),
    };
    Ok(toml::to_string(&raw)?)
}

/// Render dependencies as the JSON metadata consumed by external tooling.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_metadata_json(deps: &Dependencies) -> Result<String, LockError> {
    let raw: BTreeMap<String, LockedDep> = deps
        .deps
        .iter()
        .map(|(name, dep)| (name.clone(), LockedDep::from(dep)))
        .collect();
    Ok(serde_json::to_string(&raw)?)
}
