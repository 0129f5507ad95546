//! The vendor engine: a self-contained dependency tree under
//! `<home>/vendor/`.

use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

use crate::client::{Client, ClientError};
use crate::hash;
use crate::manifest::Dependency;
use crate::package::Package;

impl Client {
    /// Materialize every locked dependency into the vendor tree.
    ///
    /// Entries already present with the right checksum are kept; the
    /// global cache and local sources are copied from when they match; and
    /// anything else is re-fetched, after which the whole pass restarts so
    /// that transitive dependencies discovered by the fetch are picked up
    /// by a fresh snapshot of the lock.
    ///
    /// Vendor directories for dependencies no longer in the lock are
    /// removed.
    pub(crate) fn vendor_deps(&self, pkg: &mut Package) -> Result<(), ClientError> {
        let vendor_path = pkg.vendor_path();
        fs::create_dir_all(&vendor_path)?;
        prune_vendor(pkg, &vendor_path)?;

        let lock_deps: Vec<Dependency> = pkg.deps.deps.values().cloned().collect();
        for dep in lock_deps {
            if dep.name.is_empty() {
                return Err(ClientError::InvalidDependency);
            }

            let vendor_full = vendor_path.join(&dep.full_name);
            if vendor_full.exists() && hash::check_sum(&dep.sum, &vendor_full) {
                continue;
            }

            let cache_full = self.cache().path(&dep.full_name);
            let local_full = dep.resolved_path(&pkg.home_path);
            if cache_full.exists() && hash::check_sum(&dep.sum, &cache_full) {
                copy_dir(&cache_full, &vendor_full)
                    .map_err(|err| vendor_failed(&dep.name, err.into()))?;
            } else if !local_full.as_os_str().is_empty()
                && local_full.exists()
                && hash::check_sum(&dep.sum, &local_full)
            {
                copy_dir(&local_full, &vendor_full)
                    .map_err(|err| vendor_failed(&dep.name, err.into()))?;
            } else {
                self.add_dep_to_pkg(pkg, &dep)
                    .map_err(|err| vendor_failed(&dep.name, err))?;
                // The snapshot taken above is stale now; restart over the
                // refreshed lock.
                self.vendor_deps(pkg)?;
                return Ok(());
            }
        }

        Ok(())
    }
}

fn vendor_failed(name: &str, source: ClientError) -> ClientError {
    ClientError::VendorFailed {
        name: name.to_string(),
        source: Box::new(source),
    }
}

/// Remove vendor entries whose dependency left the lock.
fn prune_vendor(pkg: &Package, vendor_path: &Path) -> Result<(), io::Error> {
    for entry in fs::read_dir(vendor_path)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let wanted = pkg.deps.deps.values().any(|dep| dep.full_name == dir_name);
        if !wanted {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Copy a directory tree.
///
/// Regular files are copied with their permissions; file contents behind
/// symbolic links are copied, the links themselves are not recreated.
fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
