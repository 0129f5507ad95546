//! Option types and reference parsing for the client surface.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while parsing OCI references and urls.
#[derive(Error, Debug)]
pub enum OptError {
    #[error("'{0}' is not a valid reference, expected '<name>' or '<name>:<tag>'")]
    IsNotRef(String),

    #[error("'{0}' is not a url")]
    IsNotUrl(String),

    #[error("the url scheme of '{0}' must be 'oci'")]
    UrlSchemeNotOci(String),
}

/// Coordinates of an OCI artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciOptions {
    /// Registry host.
    pub reg: String,
    /// Repository path within the registry.
    pub repo: String,
    /// Artifact tag; empty selects the latest tag at fetch time.
    pub tag: String,
}

impl OciOptions {
    /// A storage directory for this artifact under `base`:
    /// `<base>/<reg>/<repo>[/<tag>]`.
    #[must_use]
    pub fn storage_path(&self, base: &Path) -> PathBuf {
        let mut path = base.join(&self.reg).join(&self.repo);
        if !self.tag.is_empty() {
            path = path.join(&self.tag);
        }
        path
    }
}

/// Parse a full OCI url, `oci://<registry>/<repo>`.
///
/// The tag is never part of the url; callers supply it separately.
///
/// # Errors
///
/// Returns an error if the input has no scheme or a scheme other than
/// `oci`.
pub fn parse_oci_url(url: &str) -> Result<OciOptions, OptError> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(OptError::IsNotUrl(url.to_string()));
    };
    if scheme != "oci" {
        return Err(OptError::UrlSchemeNotOci(url.to_string()));
    }

    let (reg, repo) = match rest.split_once('/') {
        Some((host, path)) => (host, path.trim_matches('/')),
        None => (rest, ""),
    };
    if reg.is_empty() {
        return Err(OptError::IsNotUrl(url.to_string()));
    }

    Ok(OciOptions {
        reg: reg.to_string(),
        repo: repo.to_string(),
        tag: String::new(),
    })
}

/// Parse a short reference, `<name>` or `<name>:<tag>`, against registry
/// defaults.
///
/// # Errors
///
/// Returns an error if the reference has more than one `:` separator.
pub fn parse_oci_ref(
    oci_ref: &str,
    default_reg: &str,
    default_repo: &str,
) -> Result<OciOptions, OptError> {
    let parts: Vec<&str> = oci_ref.split(':').collect();
    match parts.as_slice() {
        [name] => Ok(OciOptions {
            reg: default_reg.to_string(),
            repo: format!("{default_repo}/{name}"),
            tag: String::new(),
        }),
        [name, tag] => Ok(OciOptions {
            reg: default_reg.to_string(),
            repo: format!("{default_repo}/{name}"),
            tag: (*tag).to_string(),
        }),
        _ => Err(OptError::IsNotRef(oci_ref.to_string())),
    }
}

/// Options for compiling a package.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Package root to compile.
    pub pkg_path: PathBuf,

    /// Entry source files; when empty, the manifest profile decides.
    pub entries: Vec<String>,

    /// Resolve dependencies into the project-local vendor tree.
    pub vendor: bool,
}

impl CompileOptions {
    /// Options for a package root with defaults otherwise.
    #[must_use]
    pub fn new(pkg_path: impl Into<PathBuf>) -> Self {
        Self {
            pkg_path: pkg_path.into(),
            ..Self::default()
        }
    }

    /// Set entry files.
    #[must_use]
    pub fn with_entries(mut self, entries: Vec<String>) -> Self {
        self.entries = entries;
        self
    }

    /// Set vendor mode.
    #[must_use]
    pub fn with_vendor(mut self, vendor: bool) -> Self {
        self.vendor = vendor;
        self
    }
}
