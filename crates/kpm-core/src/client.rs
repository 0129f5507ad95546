//! The kpm client: the facade orchestrating loading, resolution, vendoring,
//! packaging, and registry traffic.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::archive::{self, ArchiveError};
use crate::cache::{CacheError, CacheLock, PackageCache};
use crate::git::GitError;
use crate::hash::{self, HashError};
use crate::lockfile::LockError;
use crate::manifest::{ManifestError, Source, DEFAULT_KCL_FILE, MOD_FILE};
use crate::oci::{self, DistributionProvider, OciError, OciProvider};
use crate::opts::{self, CompileOptions, OciOptions, OptError};
use crate::package::{Package, PackageError};
use crate::reporter::{Event, Reporter};
use crate::runner::{CompileError, Compiler, CompilerInput};
use crate::settings::{Settings, SettingsError, OCI_MANIFEST_SUM_ANNOTATION};

/// Contents of the entry file created by `init`.
const DEFAULT_KCL_PROGRAM: &str = "The_first_kcl_program = 'Hello World!'\n";

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("failed to hash the package: {0}")]
    Hash(#[from] HashError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Oci(#[from] OciError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Opt(#[from] OptError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("dependency '{name}' not found in '{}'", .path.display())]
    DependencyNotFound { name: String, path: PathBuf },

    #[error("checksum for '{name}' changed in the lock file")]
    ChecksumMismatch { name: String },

    #[error("invalid dependency: the dependency name cannot be empty")]
    InvalidDependency,

    #[error("failed to find the package tar in '{}'", .path.display())]
    InvalidPkg { path: PathBuf },

    #[error("failed to vendor dependency '{name}'")]
    VendorFailed {
        name: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("failed to package '{name}'")]
    PackageFailed {
        name: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("package version '{tag}' already exists")]
    TagExists { tag: String },

    #[error("an oci url or package reference must be specified")]
    PullSourceUnspecified,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// The kpm client.
///
/// One client per invocation; resolution is sequential and deterministic.
/// Concurrent invocations against the same cache are serialized by the
/// cache lock.
pub struct Client {
    settings: Settings,
    cache: PackageCache,
    reporter: Reporter,
    oci: Box<dyn OciProvider>,
}

impl Client {
    /// A client configured from the environment, logging to stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root or registry client cannot be set
    /// up.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_settings(Settings::from_env()?)
    }

    /// A client with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry client cannot be constructed.
    pub fn with_settings(settings: Settings) -> Result<Self, ClientError> {
        let oci = DistributionProvider::new(settings.home())?;
        Ok(Self {
            cache: PackageCache::new(settings.home()),
            reporter: Reporter::stdout(),
            oci: Box::new(oci),
            settings,
        })
    }

    /// Replace the event sink.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the registry provider. Used by embedders and tests.
    #[must_use]
    pub fn with_oci_provider(mut self, oci: Box<dyn OciProvider>) -> Self {
        self.oci = oci;
        self
    }

    /// The client settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The global package cache.
    #[must_use]
    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    pub(crate) fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub(crate) fn oci(&self) -> &dyn OciProvider {
        self.oci.as_ref()
    }

    /// Take the exclusive package cache lock, blocking until free.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub(crate) fn acquire_cache_lock(&self) -> Result<CacheLock, ClientError> {
        Ok(self.cache.acquire_lock(&self.reporter)?)
    }

    /// Load a package from a directory: manifest, lock, and registry
    /// defaults for dependencies that do not name a registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is absent or malformed, or an
    /// existing lock file cannot be parsed.
    pub fn load_package(&self, pkg_path: impl AsRef<Path>) -> Result<Package, ClientError> {
        let pkg_path = absolutize(pkg_path.as_ref())?;
        let mut pkg = Package::read(&pkg_path)?;
        self.fill_dependencies_info(&mut pkg)?;
        Ok(pkg)
    }

    /// Load a package only if a manifest is present at `path`.
    ///
    /// Dependencies are not required to be packages themselves.
    ///
    /// # Errors
    ///
    /// Returns an error if a present manifest fails to load.
    pub(crate) fn load_package_if_present(
        &self,
        path: &Path,
    ) -> Result<Option<Package>, ClientError> {
        if !path.join(MOD_FILE).exists() {
            return Ok(None);
        }
        Ok(Some(self.load_package(path)?))
    }

    /// Fill registry defaults for every manifest dependency that needs
    /// them.
    fn fill_dependencies_info(&self, pkg: &mut Package) -> Result<(), ClientError> {
        let names: Vec<String> = pkg.mod_file.deps.deps.keys().cloned().collect();
        for name in names {
            let locked_sum = pkg
                .deps
                .get(&name)
                .map(|dep| dep.sum.clone())
                .unwrap_or_default();
            if let Some(dep) = pkg.mod_file.deps.deps.get_mut(&name) {
                let (needs_fill, tag) = match &dep.source {
                    Source::Oci { reg, tag, .. } if reg.is_empty() => (true, tag.clone()),
                    _ => (false, String::new()),
                };
                if !needs_fill {
                    continue;
                }

                let reg = self.settings.default_oci_registry.clone();
                let repo = self.settings.default_repo_for(&dep.name);

                // A checksum already pinned by the lock file (or a still
                // floating tag) makes the registry round-trip unnecessary:
                // the annotation only seeds the first resolution of a
                // fresh clone.
                if locked_sum.is_empty() && !tag.is_empty() {
                    let handle = self.oci.open(&reg, &repo)?;
                    let manifest_json = handle.fetch_manifest(&tag)?;
                    if let Some(sum) =
                        oci::manifest_annotation(&manifest_json, OCI_MANIFEST_SUM_ANNOTATION)?
                    {
                        dep.sum = sum;
                    }
                }

                dep.source = Source::Oci { reg, repo, tag };
            }
        }
        Ok(())
    }

    /// Initialize an empty package: manifest, lock, and a default entry
    /// file, each created only if absent. Existing files are reported and
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if a missing file cannot be created.
    pub fn init_empty_pkg(&self, pkg: &Package) -> Result<(), ClientError> {
        self.create_if_absent(&pkg.mod_file.file_path(), || {
            pkg.mod_file.store().map_err(ClientError::from)
        })?;
        self.create_if_absent(&crate::lockfile::lock_file_path(&pkg.home_path), || {
            pkg.store_lock().map_err(ClientError::from)
        })?;
        let main_path = pkg.home_path.join(DEFAULT_KCL_FILE);
        self.create_if_absent(&main_path, || {
            fs::write(&main_path, DEFAULT_KCL_PROGRAM).map_err(ClientError::from)
        })?;
        Ok(())
    }

    fn create_if_absent(
        &self,
        path: &Path,
        store: impl FnOnce() -> Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        if path.exists() {
            self.reporter
                .report(&Event::FileExists(path.display().to_string()));
            return Ok(());
        }
        self.reporter
            .report(&Event::Creating(path.display().to_string()));
        store()
    }

    /// Produce the package artifact at `tar_path`, vendoring first when
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns an error if vendoring or archiving fails.
    pub fn package(
        &self,
        pkg: &mut Package,
        tar_path: &Path,
        vendor: bool,
    ) -> Result<(), ClientError> {
        if vendor {
            let _lock = self.acquire_cache_lock()?;
            self.vendor_deps(pkg)?;
        }
        archive::tar_dir(&pkg.home_path, tar_path).map_err(|err| ClientError::PackageFailed {
            name: pkg.mod_file.package.name.clone(),
            source: Box::new(err.into()),
        })
    }

    /// Produce the package artifact at its default path,
    /// `<home>/<name>-<version>.tar`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package root is the cache root or archiving
    /// fails.
    pub fn package_pkg(&self, pkg: &mut Package, vendor: bool) -> Result<PathBuf, ClientError> {
        pkg.validate_kpm_home(self.settings.home())?;
        let tar_path = pkg.default_tar_path();
        self.package(pkg, &tar_path, vendor)?;
        Ok(tar_path)
    }

    /// Package and push to a registry, failing fast when the tag already
    /// exists.
    ///
    /// An empty tag defaults to the package version. The pushed manifest
    /// carries the package checksum as an annotation so consumers can seed
    /// their first resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag exists or any upload fails.
    pub fn push(
        &self,
        pkg: &mut Package,
        opts: &OciOptions,
        vendor: bool,
    ) -> Result<(), ClientError> {
        let tag = if opts.tag.is_empty() {
            pkg.mod_file.package.version.clone()
        } else {
            opts.tag.clone()
        };

        let handle = self.oci.open(&opts.reg, &opts.repo)?;
        if handle.contains_tag(&tag)? {
            return Err(ClientError::TagExists { tag });
        }

        pkg.validate_kpm_home(self.settings.home())?;
        if vendor {
            let _lock = self.acquire_cache_lock()?;
            self.vendor_deps(pkg)?;
        }

        // Consumers hash the unpacked artifact, which excludes `.git` and
        // `.tar` paths; the annotation has to be taken after vendoring and
        // before the tar lands inside the package root.
        let sum = hash::hash_dir(&pkg.home_path)?;
        let tar_path = pkg.default_tar_path();
        self.package(pkg, &tar_path, false)?;

        self.reporter.report(&Event::Pushing {
            repo: opts.repo.clone(),
            tag: tag.clone(),
        });
        let annotations = BTreeMap::from([(OCI_MANIFEST_SUM_ANNOTATION.to_string(), sum)]);
        handle.push(&tar_path, &tag, &annotations)?;
        Ok(())
    }

    /// Pull a package artifact from a registry and unpack it under
    /// `local_path`.
    ///
    /// Returns the directory the package was unpacked into,
    /// `<local_path>/<reg>/<repo>/<tag>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is empty, the artifact cannot be
    /// fetched, or it does not contain exactly one tar.
    pub fn pull(&self, local_path: &Path, source: &str, tag: &str) -> Result<PathBuf, ClientError> {
        if source.is_empty() {
            return Err(ClientError::PullSourceUnspecified);
        }
        self.reporter
            .report(&Event::PullingStarted(source.to_string()));

        let opts = self.parse_oci_option(source, tag)?;

        // Pull into a temporary directory that is removed on every exit
        // path, then unpack into the target.
        let tmp = tempfile::tempdir()?;
        let (tar_path, opts) = self.pull_tar_from_oci(&opts.storage_path(tmp.path()), opts)?;

        let target = opts.storage_path(&absolutize(local_path)?);
        archive::untar_dir(&tar_path, &target)?;

        self.reporter.report(&Event::PullingFinished {
            source: source.to_string(),
            path: target.display().to_string(),
        });
        Ok(target)
    }

    /// Pull the artifact tar for `opts` into `local_path`, resolving an
    /// empty tag to the latest one. Returns the tar path and the resolved
    /// options.
    pub(crate) fn pull_tar_from_oci(
        &self,
        local_path: &Path,
        mut opts: OciOptions,
    ) -> Result<(PathBuf, OciOptions), ClientError> {
        let handle = self.oci.open(&opts.reg, &opts.repo)?;
        if opts.tag.is_empty() {
            opts.tag = handle.latest_tag()?;
            self.reporter
                .report(&Event::SelectLatestTag(opts.tag.clone()));
        }

        self.reporter.report(&Event::DownloadingFromOci {
            registry: opts.reg.clone(),
            repo: opts.repo.clone(),
            tag: opts.tag.clone(),
        });
        handle.pull(local_path, &opts.tag)?;

        let tar_path = single_tar_in(local_path)?;
        Ok((tar_path, opts))
    }

    /// Store registry credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be persisted.
    pub fn login(&self, hostname: &str, username: &str, password: &str) -> Result<(), ClientError> {
        Ok(self.oci.login(hostname, username, password)?)
    }

    /// Discard registry credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be persisted.
    pub fn logout(&self, hostname: &str) -> Result<(), ClientError> {
        Ok(self.oci.logout(hostname)?)
    }

    /// Interpret a package source as either a full OCI url or a
    /// `<name>[:<tag>]` reference against the default registry.
    ///
    /// When the reference form already carries a tag, it wins over the
    /// separate `tag` argument and an advisory is logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the source parses as neither form.
    pub fn parse_oci_option(&self, source: &str, tag: &str) -> Result<OciOptions, ClientError> {
        match opts::parse_oci_url(source) {
            Ok(mut url_opts) => {
                url_opts.tag = tag.to_string();
                Ok(url_opts)
            }
            Err(OptError::IsNotUrl(_) | OptError::UrlSchemeNotOci(_)) => {
                let ref_opts = opts::parse_oci_ref(
                    source,
                    &self.settings.default_oci_registry,
                    &self.settings.default_oci_repo,
                )?;
                if !tag.is_empty() {
                    self.reporter.report(&Event::InvalidFlag(
                        "the version is taken from the reference '<name>:<tag>'".to_string(),
                    ));
                    self.reporter.report(&Event::InvalidFlag(
                        "arg '--tag' is invalid for a package reference".to_string(),
                    ));
                }
                Ok(ref_opts)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve dependencies and invoke the compiler on the package.
    ///
    /// Entry selection: explicit entries win; otherwise the manifest
    /// profile; otherwise the package root itself.
    ///
    /// # Errors
    ///
    /// Returns an error if loading, resolution, or compilation fails.
    pub fn compile_with_opts(
        &self,
        opts: &CompileOptions,
        compiler: &dyn Compiler,
    ) -> Result<String, ClientError> {
        let pkg_path = absolutize(&opts.pkg_path)?;
        let mut pkg = self.load_package(&pkg_path)?;
        pkg.set_vendor_mode(opts.vendor);
        pkg.validate_kpm_home(self.settings.home())?;

        let entries: Vec<PathBuf> = if !opts.entries.is_empty() {
            opts.entries
                .iter()
                .map(|entry| abs_or_join(entry, &pkg_path))
                .collect()
        } else if !pkg.mod_file.entries().is_empty() {
            pkg.mod_file
                .entries()
                .iter()
                .map(|entry| abs_or_join(entry, &pkg_path))
                .collect()
        } else {
            vec![pkg_path.clone()]
        };

        let dep_map = self.resolve_deps_into_map(&mut pkg)?;

        Ok(compiler.compile(&CompilerInput {
            entries,
            work_dir: pkg_path,
            dep_map,
        })?)
    }

    /// Unpack a package artifact next to itself and compile it.
    ///
    /// `xxx/test.tar` unpacks into `xxx/test`, which becomes the package
    /// root.
    ///
    /// # Errors
    ///
    /// Returns an error if unpacking or compilation fails.
    pub fn compile_tar_pkg(
        &self,
        tar_path: &Path,
        opts: &CompileOptions,
        compiler: &dyn Compiler,
    ) -> Result<String, ClientError> {
        let tar_path = absolutize(tar_path)?;
        let dest = tar_path.with_extension("");
        archive::untar_dir(&tar_path, &dest)?;

        let mut opts = opts.clone();
        opts.pkg_path = dest;
        self.compile_with_opts(&opts, compiler)
    }

    /// Pull a package from a registry reference and compile it.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull, unpack, or compilation fails.
    pub fn compile_oci_pkg(
        &self,
        source: &str,
        tag: &str,
        opts: &CompileOptions,
        compiler: &dyn Compiler,
    ) -> Result<String, ClientError> {
        let oci_opts = self.parse_oci_option(source, tag)?;

        let tmp = tempfile::tempdir()?;
        let (tar_path, _) = self.pull_tar_from_oci(&oci_opts.storage_path(tmp.path()), oci_opts)?;
        self.compile_tar_pkg(&tar_path, opts, compiler)
    }
}

/// Find the single `*.tar` member of a pulled artifact directory.
pub(crate) fn single_tar_in(dir: &Path) -> Result<PathBuf, ClientError> {
    let mut tars = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tar") {
            tars.push(path);
        }
    }
    if tars.len() != 1 {
        return Err(ClientError::InvalidPkg {
            path: dir.to_path_buf(),
        });
    }
    Ok(tars.remove(0))
}

/// Make a path absolute against the current directory without touching the
/// filesystem.
pub(crate) fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn abs_or_join(entry: &str, base: &Path) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client(tmp: &TempDir) -> Client {
        let settings = Settings::with_home(tmp.path().join("kpm_home")).unwrap();
        Client::with_settings(settings)
            .unwrap()
            .with_reporter(Reporter::silent())
    }

    #[test]
    fn init_empty_pkg_creates_files_once() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("proj");
        fs::create_dir_all(&home).unwrap();

        let client = client(&tmp);
        let pkg = Package::new(
            crate::manifest::ModFile::new("proj", &home),
            crate::manifest::Dependencies::default(),
            &home,
        );

        client.init_empty_pkg(&pkg).unwrap();
        assert!(home.join(MOD_FILE).exists());
        assert!(home.join(crate::lockfile::LOCK_FILE).exists());
        assert_eq!(
            fs::read_to_string(home.join(DEFAULT_KCL_FILE)).unwrap(),
            DEFAULT_KCL_PROGRAM
        );

        // A second init leaves existing files untouched.
        fs::write(home.join(DEFAULT_KCL_FILE), "custom = 1\n").unwrap();
        client.init_empty_pkg(&pkg).unwrap();
        assert_eq!(
            fs::read_to_string(home.join(DEFAULT_KCL_FILE)).unwrap(),
            "custom = 1\n"
        );
    }

    #[test]
    fn parse_oci_option_prefers_reference_tag() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp);

        let opts = client.parse_oci_option("k8s:1.27", "9.99").unwrap();
        assert_eq!(opts.repo, "kcl-lang/k8s");
        assert_eq!(opts.tag, "1.27");
    }

    #[test]
    fn parse_oci_option_accepts_full_url() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp);

        let opts = client
            .parse_oci_option("oci://example.com/acme/pkg", "2.0")
            .unwrap();
        assert_eq!(opts.reg, "example.com");
        assert_eq!(opts.repo, "acme/pkg");
        assert_eq!(opts.tag, "2.0");
    }

    #[test]
    fn parse_oci_option_rejects_malformed_ref() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp);
        assert!(client.parse_oci_option("a:b:c", "").is_err());
    }

    #[test]
    fn pull_requires_a_source() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp);
        assert!(matches!(
            client.pull(tmp.path(), "", ""),
            Err(ClientError::PullSourceUnspecified)
        ));
    }

    #[test]
    fn single_tar_in_requires_exactly_one() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            single_tar_in(tmp.path()),
            Err(ClientError::InvalidPkg { .. })
        ));

        fs::write(tmp.path().join("a.tar"), b"x").unwrap();
        assert!(single_tar_in(tmp.path()).is_ok());

        fs::write(tmp.path().join("b.tar"), b"y").unwrap();
        assert!(matches!(
            single_tar_in(tmp.path()),
            Err(ClientError::InvalidPkg { .. })
        ));
    }
}
