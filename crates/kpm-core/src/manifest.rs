//! Package manifest (`kcl.mod`) parsing and serialization.
//!
//! The manifest declares intent: project metadata plus one entry per wanted
//! dependency. The concrete resolved state lives in the lock file
//! (`kcl.mod.lock`, see [`crate::lockfile`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The manifest filename.
pub const MOD_FILE: &str = "kcl.mod";

/// Default entry source filename created by `init`.
pub const DEFAULT_KCL_FILE: &str = "main.k";

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Where a dependency comes from. Exactly one variant per dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// An artifact in an OCI registry.
    Oci {
        reg: String,
        repo: String,
        tag: String,
    },
    /// A git repository at a ref (branch, tag, or commit).
    Git { url: String, tag: String },
    /// A directory on the local filesystem, absolute or manifest-relative.
    Local { path: PathBuf },
}

/// A single dependency: a named requirement plus its resolved state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Name, unique within its parent manifest.
    pub name: String,

    /// Opaque tag string; empty means "latest" at fetch time.
    pub version: String,

    /// `<name>_<version>`, the on-disk basename under cache and vendor.
    pub full_name: String,

    /// Content checksum of the materialized directory; empty until hashed.
    pub sum: String,

    /// Absolute directory after acquisition.
    pub local_full_path: Option<PathBuf>,

    /// The source this dependency is acquired from.
    pub source: Source,
}

impl Dependency {
    /// A fresh dependency with its `full_name` derived from name and version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, source: Source) -> Self {
        let name = name.into();
        let version = version.into();
        let full_name = Self::full_name_of(&name, &version);
        Self {
            name,
            version,
            full_name,
            sum: String::new(),
            local_full_path: None,
            source,
        }
    }

    /// The derived `<name>_<version>` identifier.
    #[must_use]
    pub fn full_name_of(name: &str, version: &str) -> String {
        format!("{name}_{version}")
    }

    /// Re-derive `full_name` after a version change.
    pub fn sync_full_name(&mut self) {
        self.full_name = Self::full_name_of(&self.name, &self.version);
    }

    /// Whether this dependency comes from the local filesystem.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.source, Source::Local { .. })
    }

    /// The on-disk location of this dependency.
    ///
    /// Local sources resolve their declared path against the package home;
    /// everything else reports the bound acquisition path, which may still
    /// be empty before the dependency was resolved.
    #[must_use]
    pub fn resolved_path(&self, home: &Path) -> PathBuf {
        if let Source::Local { path } = &self.source {
            if path.is_absolute() {
                return path.clone();
            }
            return home.join(path);
        }
        self.local_full_path.clone().unwrap_or_default()
    }
}

/// A keyed collection of dependencies.
///
/// Used both for manifest intent and for locked state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Dependencies keyed by name. Inserting an existing name overwrites.
    pub deps: BTreeMap<String, Dependency>,
}

impl Dependencies {
    /// Insert a dependency under its own name.
    pub fn insert(&mut self, dep: Dependency) {
        self.deps.insert(dep.name.clone(), dep);
    }

    /// Look up a dependency by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.deps.get(name)
    }

    /// Whether no dependencies are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

/// Package metadata section of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSection {
    /// Package name.
    pub name: String,

    /// KCL language edition.
    #[serde(default = "default_edition")]
    pub edition: String,

    /// Package version.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_edition() -> String {
    String::from("0.0.1")
}

fn default_version() -> String {
    String::from("0.0.1")
}

/// Compile profile: entry files handed to the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Entry source files, relative to the package root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
}

/// The parsed `kcl.mod` manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ModFile {
    /// Directory the manifest was loaded from. Not serialized.
    pub home_path: PathBuf,

    /// Project metadata.
    pub package: PackageSection,

    /// Optional compile profile.
    pub profile: Option<Profile>,

    /// Declared dependencies.
    pub deps: Dependencies,
}

/// On-disk dependency form: either a bare tag or a detailed table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    /// `k8s = "1.27"`, an OCI dependency on the default registry.
    Simple(String),

    /// `{ path = ".." }`, `{ git = "..", tag = ".." }`, or `{ version = ".." }`.
    Detailed(DetailedSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

impl DependencySpec {
    fn into_dependency(self, name: &str) -> Dependency {
        match self {
            Self::Simple(tag) => Dependency::new(
                name,
                tag.clone(),
                Source::Oci {
                    reg: String::new(),
                    repo: String::new(),
                    tag,
                },
            ),
            Self::Detailed(spec) => {
                if let Some(path) = spec.path {
                    Dependency::new(name, "", Source::Local { path: path.into() })
                } else if let Some(url) = spec.git {
                    let tag = spec.tag.unwrap_or_default();
                    Dependency::new(name, tag.clone(), Source::Git { url, tag })
                } else {
                    let tag = spec.version.unwrap_or_default();
                    Dependency::new(
                        name,
                        tag.clone(),
                        Source::Oci {
                            reg: String::new(),
                            repo: String::new(),
                            tag,
                        },
                    )
                }
            }
        }
    }
}

impl From<&Dependency> for DependencySpec {
    fn from(dep: &Dependency) -> Self {
        match &dep.source {
            // Registry coordinates live in the lock file, never here.
            Source::Oci { tag, .. } => Self::Simple(tag.clone()),
            Source::Git { url, tag } => Self::Detailed(DetailedSpec {
                git: Some(url.clone()),
                tag: (!tag.is_empty()).then(|| tag.clone()),
                ..DetailedSpec::default()
            }),
            Source::Local { path } => Self::Detailed(DetailedSpec {
                path: Some(path.to_string_lossy().into_owned()),
                ..DetailedSpec::default()
            }),
        }
    }
}

/// Serialized shape of the manifest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModFileToml {
    package: PackageSection,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    dependencies: BTreeMap<String, DependencySpec>,
}

impl ModFile {
    /// A fresh manifest for a new package rooted at `home_path`.
    #[must_use]
    pub fn new(name: impl Into<String>, home_path: impl Into<PathBuf>) -> Self {
        Self {
            home_path: home_path.into(),
            package: PackageSection {
                name: name.into(),
                edition: default_edition(),
                version: default_version(),
            },
            profile: None,
            deps: Dependencies::default(),
        }
    }

    /// Load a manifest from `<pkg_path>/kcl.mod`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is absent, unreadable, or malformed.
    pub fn load(pkg_path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let pkg_path = pkg_path.as_ref();
        let content = std::fs::read_to_string(pkg_path.join(MOD_FILE))?;
        let mut mod_file = Self::parse(&content)?;
        mod_file.home_path = pkg_path.to_path_buf();
        Ok(mod_file)
    }

    /// Parse a manifest from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let raw: ModFileToml = toml::from_str(content)?;
        let mut deps = Dependencies::default();
        for (name, spec) in raw.dependencies {
            deps.insert(spec.into_dependency(&name));
        }
        Ok(Self {
            home_path: PathBuf::new(),
            package: raw.package,
            profile: raw.profile,
            deps,
        })
    }

    /// Serialize the manifest to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ManifestError> {
        let raw = ModFileToml {
            package: self.package.clone(),
            profile: self.profile.clone(),
            dependencies: self
                .deps
                .deps
                .iter()
                .map(|(name, dep)| (name.clone(), DependencySpec::from(dep)))
                .collect(),
        };
        Ok(toml::to_string(&raw)?)
    }

    /// Write the manifest to `<home_path>/kcl.mod`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn store(&self) -> Result<(), ManifestError> {
        let content = self.to_toml_string()?;
        std::fs::write(self.file_path(), content)?;
        Ok(())
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.home_path.join(MOD_FILE)
    }

    /// Entry source files from the compile profile.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        self.profile.as_ref().map_or(&[], |p| p.entries.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_manifest() {
        let toml = r#"
[package]
name = "demo"
edition = "0.0.1"
version = "0.0.1"
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        assert_eq!(mod_file.package.name, "demo");
        assert_eq!(mod_file.package.version, "0.0.1");
        assert!(mod_file.deps.is_empty());
    }

    #[test]
    fn parse_simple_dependency_is_oci_with_blank_registry() {
        let toml = r#"
[package]
name = "demo"

[dependencies]
k8s = "1.27"
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        let dep = mod_file.deps.get("k8s").unwrap();
        assert_eq!(dep.version, "1.27");
        assert_eq!(dep.full_name, "k8s_1.27");
        assert_eq!(
            dep.source,
            Source::Oci {
                reg: String::new(),
                repo: String::new(),
                tag: "1.27".to_string(),
            }
        );
    }

    #[test]
    fn parse_git_dependency() {
        let toml = r#"
[package]
name = "demo"

[dependencies]
konfig = { git = "https://github.com/kcl-lang/konfig.git", tag = "v0.4.0" }
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        let dep = mod_file.deps.get("konfig").unwrap();
        assert_eq!(dep.version, "v0.4.0");
        assert!(matches!(
            &dep.source,
            Source::Git { url, tag }
                if url == "https://github.com/kcl-lang/konfig.git" && tag == "v0.4.0"
        ));
    }

    #[test]
    fn parse_local_dependency() {
        let toml = r#"
[package]
name = "demo"

[dependencies]
helper = { path = "../helper" }
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        let dep = mod_file.deps.get("helper").unwrap();
        assert!(dep.is_local());
        assert_eq!(dep.version, "");
        assert_eq!(dep.full_name, "helper_");
    }

    #[test]
    fn parse_profile_entries() {
        let toml = r#"
[package]
name = "demo"

[profile]
entries = ["main.k", "extra.k"]
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        assert_eq!(mod_file.entries(), ["main.k", "extra.k"]);
    }

    #[test]
    fn serialization_round_trips() {
        let toml = r#"
[package]
name = "demo"
edition = "0.0.1"
version = "0.1.0"

[dependencies]
helper = { path = "../helper" }
k8s = "1.27"
konfig = { git = "https://example.com/konfig.git", tag = "v1" }
"#;
        let mod_file = ModFile::parse(toml).unwrap();
        let rendered = mod_file.to_toml_string().unwrap();
        let reparsed = ModFile::parse(&rendered).unwrap();
        assert_eq!(mod_file.package, reparsed.package);
        assert_eq!(mod_file.deps, reparsed.deps);
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        assert!(matches!(
            ModFile::parse("this is not toml ["),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(ModFile::load(tmp.path()), Err(ManifestError::Io(_))));
    }

    #[test]
    fn inserting_same_name_overwrites() {
        let mut deps = Dependencies::default();
        deps.insert(Dependency::new(
            "k8s",
            "1.27",
            Source::Oci {
                reg: String::new(),
                repo: String::new(),
                tag: "1.27".to_string(),
            },
        ));
        deps.insert(Dependency::new(
            "k8s",
            "1.28",
            Source::Oci {
                reg: String::new(),
                repo: String::new(),
                tag: "1.28".to_string(),
            },
        ));
        assert_eq!(deps.deps.len(), 1);
        assert_eq!(deps.get("k8s").unwrap().full_name, "k8s_1.28");
    }

    #[test]
    fn resolved_path_joins_relative_local_sources() {
        let dep = Dependency::new(
            "helper",
            "",
            Source::Local {
                path: PathBuf::from("../helper"),
            },
        );
        assert_eq!(
            dep.resolved_path(Path::new("/proj")),
            PathBuf::from("/proj/../helper")
        );

        let abs = Dependency::new(
            "helper",
            "",
            Source::Local {
                path: PathBuf::from("/abs/helper"),
            },
        );
        assert_eq!(abs.resolved_path(Path::new("/proj")), PathBuf::from("/abs/helper"));
    }
}
