//! Package management core for the KCL configuration language.
//!
//! This crate provides:
//! - Parsing and persistence of `kcl.mod` manifests and `kcl.mod.lock`
//!   lock files
//! - Transitive dependency resolution with a content-addressed global
//!   cache
//! - Pluggable source fetchers for OCI registries, git repositories, and
//!   local paths
//! - A project-local vendor tree and a `*.tar` packager
//! - The client facade consumed by the CLI and the compiler front-end

pub mod archive;
pub mod cache;
pub mod client;
pub mod git;
pub mod hash;
pub mod lockfile;
pub mod manifest;
pub mod oci;
pub mod opts;
pub mod package;
pub mod reporter;
mod resolver;
pub mod runner;
pub mod settings;
mod vendor;

pub use cache::{CacheError, CacheLock, PackageCache};
pub use client::{Client, ClientError};
pub use hash::{check_sum, hash_dir, HashError};
pub use lockfile::{LockError, LOCK_FILE};
pub use manifest::{
    Dependencies, Dependency, ManifestError, ModFile, Source, DEFAULT_KCL_FILE, MOD_FILE,
};
pub use oci::{DistributionProvider, OciError, OciProvider, OciRepository};
pub use opts::{parse_oci_ref, parse_oci_url, CompileOptions, OciOptions, OptError};
pub use package::{Package, PackageError, VENDOR_DIR};
pub use reporter::{Event, Reporter};
pub use runner::{CompileError, Compiler, CompilerInput};
pub use settings::{Settings, SettingsError, OCI_MANIFEST_SUM_ANNOTATION};
