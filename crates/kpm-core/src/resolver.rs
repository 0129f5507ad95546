//! Dependency resolution: reconciling the manifest with the lock file and
//! acquiring whatever is missing, transitively.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::client::{single_tar_in, Client, ClientError};
use crate::git;
use crate::hash;
use crate::lockfile;
use crate::manifest::{Dependencies, Dependency, Source};
use crate::package::Package;
use crate::reporter::Event;

impl Client {
    /// Resolve dependencies and return `{name -> absolute directory}` for
    /// the compiler.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails; the lock file on disk is then
    /// left untouched.
    pub fn resolve_deps_into_map(
        &self,
        pkg: &mut Package,
    ) -> Result<BTreeMap<String, PathBuf>, ClientError> {
        let _lock = self.acquire_cache_lock()?;
        self.resolve_pkg_deps(pkg, true)?;

        let mut map = BTreeMap::new();
        for (name, dep) in &pkg.deps.deps {
            let mut path = dep.resolved_path(&pkg.home_path);
            if path.is_relative() {
                path = self.settings().home().join(path);
            }
            map.insert(name.clone(), path);
        }
        Ok(map)
    }

    /// Re-resolve everything, refreshing stale entries, and persist the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns an error if any fetch or verification fails.
    pub fn update_deps(&self, pkg: &mut Package) -> Result<(), ClientError> {
        let _lock = self.acquire_cache_lock()?;
        self.resolve_pkg_deps(pkg, true)
    }

    /// Resolve and serialize the locked dependency metadata to JSON for
    /// external tooling.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution or serialization fails.
    pub fn resolve_deps_metadata_json(
        &self,
        pkg: &mut Package,
        update: bool,
    ) -> Result<String, ClientError> {
        let _lock = self.acquire_cache_lock()?;
        self.resolve_pkg_deps(pkg, update)?;
        Ok(lockfile::to_metadata_json(&pkg.deps)?)
    }

    /// Add one dependency, download the transitive closure, and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if any fetch or verification fails.
    pub fn add_dep(&self, pkg: &mut Package, dep: Dependency) -> Result<(), ClientError> {
        let _lock = self.acquire_cache_lock()?;
        self.reporter().report(&Event::Adding(dep.name.clone()));

        let name = dep.name.clone();
        self.add_dep_to_pkg(pkg, &dep)?;
        pkg.save()?;

        let label = match pkg.deps.get(&name) {
            Some(resolved) if !resolved.version.is_empty() => {
                format!("{}:{}", resolved.name, resolved.version)
            }
            _ => name,
        };
        self.reporter().report(&Event::Added(label));
        Ok(())
    }

    /// Reconcile the lock with the manifest, bind or refresh every entry,
    /// and persist both files.
    ///
    /// With `update == false` this is a pure path-resolution pass: existing
    /// directories are bound, nothing is fetched or verified.
    pub(crate) fn resolve_pkg_deps(
        &self,
        pkg: &mut Package,
        update: bool,
    ) -> Result<(), ClientError> {
        // Reconcile: the lock may only hold names the manifest still wants.
        let lock_names: Vec<String> = pkg.deps.deps.keys().cloned().collect();
        for name in lock_names {
            if !pkg.mod_file.deps.deps.contains_key(&name) {
                self.reporter().report(&Event::RemoveDep(name.clone()));
                pkg.deps.deps.remove(&name);
            }
        }
        let mod_names: Vec<String> = pkg.mod_file.deps.deps.keys().cloned().collect();
        for name in mod_names {
            if !pkg.deps.deps.contains_key(&name) {
                self.reporter().report(&Event::AddDep(name.clone()));
                if let Some(dep) = pkg.mod_file.deps.get(&name) {
                    pkg.deps.insert(dep.clone());
                }
            } else {
                // A version bump in the manifest retargets the lock entry;
                // the lock may only pin the version the manifest asks for.
                let bumped = match (pkg.mod_file.deps.get(&name), pkg.deps.get(&name)) {
                    (Some(wanted), Some(locked)) => wanted.full_name != locked.full_name,
                    _ => false,
                };
                if bumped {
                    if let Some(dep) = pkg.mod_file.deps.get(&name) {
                        pkg.deps.insert(dep.clone());
                    }
                }
            }
        }

        // In vendor mode the vendor tree is materialized first and becomes
        // the search root; otherwise entries are searched in the global
        // cache.
        let search_root = if pkg.is_vendor_mode() {
            self.vendor_deps(pkg)?;
            pkg.vendor_path()
        } else {
            self.settings().home().to_path_buf()
        };

        let names: Vec<String> = pkg.deps.deps.keys().cloned().collect();
        for name in names {
            let dep = pkg
                .deps
                .get(&name)
                .cloned()
                .ok_or(ClientError::Internal("lock entry vanished during resolve"))?;
            let search_path = search_root.join(&dep.full_name);

            if !update {
                if search_path.exists() {
                    bind_path(pkg, &name, search_path);
                }
                continue;
            }

            if search_path.exists() && hash::check_sum(&dep.sum, &search_path) {
                bind_path(pkg, &name, search_path);
                continue;
            }

            if dep.is_local() {
                let local_path = dep.resolved_path(&pkg.home_path);
                if !local_path.exists() {
                    return Err(ClientError::DependencyNotFound {
                        name: dep.name.clone(),
                        path: local_path,
                    });
                }
                // Local sources are never a checksum failure; the lock
                // follows whatever is on disk.
                let sum = hash::hash_dir(&local_path)?;
                if let Some(entry) = pkg.deps.deps.get_mut(&name) {
                    entry.sum = sum;
                    entry.local_full_path = Some(local_path);
                }
                continue;
            }

            // A remote entry is missing or stale: refresh it, then restart
            // the resolution over the now-enlarged lock.
            if pkg.is_vendor_mode() {
                self.vendor_deps(pkg)?;
            } else {
                self.add_dep_to_pkg(pkg, &dep)?;
            }
            self.resolve_pkg_deps(pkg, update)?;
            return Ok(());
        }

        pkg.save()?;
        Ok(())
    }

    /// Record `dep` in the manifest when it differs from the present entry,
    /// then download the transitive closure and merge the delta.
    ///
    /// The delta updates manifest entries in place but adds new names only
    /// to the lock: transitively discovered dependencies are locked state,
    /// not manifest intent.
    pub(crate) fn add_dep_to_pkg(
        &self,
        pkg: &mut Package,
        dep: &Dependency,
    ) -> Result<(), ClientError> {
        if pkg.mod_file.deps.get(&dep.name) != Some(dep) {
            pkg.mod_file.deps.insert(dep.clone());
        }

        let manifest_deps = pkg.mod_file.deps.clone();
        let changed = self.download_deps(&manifest_deps, &mut pkg.deps)?;

        for changed_dep in changed.deps.values() {
            if pkg.mod_file.deps.deps.contains_key(&changed_dep.name) {
                pkg.mod_file.deps.insert(changed_dep.clone());
            }
            pkg.deps.insert(changed_dep.clone());
        }
        Ok(())
    }

    /// Download every manifest dependency that the cache cannot satisfy,
    /// recursing into the manifests of freshly resolved dependencies.
    ///
    /// Returns the delta of concretely resolved dependencies, including
    /// transitive discoveries. Conflicts between transitive requirements
    /// are resolved first-writer-wins: the first resolution of a name is
    /// kept and deeper requirements for it are ignored.
    pub(crate) fn download_deps(
        &self,
        manifest_deps: &Dependencies,
        lock: &mut Dependencies,
    ) -> Result<Dependencies, ClientError> {
        let mut new_deps = Dependencies::default();

        for (name, dep) in &manifest_deps.deps {
            if name.is_empty() {
                return Err(ClientError::InvalidDependency);
            }

            if let Some(lock_dep) = lock.get(name) {
                let cache_path = self.cache().path(&dep.full_name);
                if hash::check_sum(&lock_dep.sum, &cache_path) {
                    new_deps.insert(lock_dep.clone());
                    continue;
                }
            }

            let expected = lock.get(name).map(|d| d.sum.clone()).unwrap_or_default();
            let locked_full_name = lock
                .get(name)
                .map(|d| d.full_name.clone())
                .unwrap_or_default();

            if self.settings().home().as_os_str().is_empty() || dep.full_name.is_empty() {
                return Err(ClientError::Internal(
                    "the cache path of a dependency would be empty",
                ));
            }
            self.cache().remove(&dep.full_name)?;

            let mut fetched = dep.clone();
            self.download(&mut fetched, self.cache().path(&dep.full_name))?;

            // Same full_name means same declared version: differing content
            // is drift, not an upgrade. Local sources are exempt.
            if !fetched.is_local()
                && !expected.is_empty()
                && fetched.sum != expected
                && locked_full_name == dep.full_name
            {
                return Err(ClientError::ChecksumMismatch { name: fetched.name });
            }

            new_deps.insert(fetched.clone());
            lock.insert(fetched);
        }

        // Recurse into the manifests of the resolved dependencies. Not
        // every dependency is a package of its own.
        let resolved: Vec<Dependency> = new_deps.deps.values().cloned().collect();
        for dep in resolved {
            let child_home = dep
                .local_full_path
                .clone()
                .unwrap_or_else(|| self.cache().path(&dep.full_name));
            let Some(child) = self.load_package_if_present(&child_home)? else {
                continue;
            };

            let nested = self.download_deps(&child.mod_file.deps, lock)?;
            for nested_dep in nested.deps.values() {
                if !new_deps.deps.contains_key(&nested_dep.name) {
                    new_deps.insert(nested_dep.clone());
                }
            }
        }

        Ok(new_deps)
    }

    /// Materialize one dependency into `local_path` and compute its
    /// checksum.
    fn download(&self, dep: &mut Dependency, local_path: PathBuf) -> Result<(), ClientError> {
        match dep.source.clone() {
            Source::Git { url, tag } => {
                self.reporter().report(&Event::DownloadingFromGit {
                    url: url.clone(),
                    tag: tag.clone(),
                });
                git::clone(&url, &tag, &local_path)?;
                dep.version = tag;
                dep.local_full_path = Some(local_path);
                dep.sync_full_name();
            }
            Source::Oci { reg, repo, tag } => {
                let (stored, tag) = self.download_from_oci(&reg, &repo, &tag, &local_path)?;
                dep.version = tag.clone();
                dep.source = Source::Oci { reg, repo, tag };
                dep.local_full_path = Some(stored);
                dep.sync_full_name();
            }
            Source::Local { path } => {
                dep.local_full_path = Some(path);
            }
        }

        let stored = dep
            .local_full_path
            .clone()
            .ok_or(ClientError::Internal("a fetched dependency has no path"))?;
        dep.sum = hash::hash_dir(&stored)?;
        Ok(())
    }

    /// Pull an OCI artifact and unpack it in place. Returns the final
    /// storage directory and the resolved tag.
    fn download_from_oci(
        &self,
        reg: &str,
        repo: &str,
        tag: &str,
        local_path: &Path,
    ) -> Result<(PathBuf, String), ClientError> {
        let handle = self.oci().open(reg, repo)?;

        let mut local_path = local_path.to_path_buf();
        let tag = if tag.is_empty() {
            let selected = handle.latest_tag()?;
            self.reporter()
                .report(&Event::SelectLatestTag(selected.clone()));
            // The storage directory is keyed by `<name>_<version>` and the
            // version was unknown until now; concurrent fetches of
            // different versions must not collide.
            local_path = PathBuf::from(format!("{}{}", local_path.display(), selected));
            selected
        } else {
            tag.to_string()
        };

        self.reporter().report(&Event::DownloadingFromOci {
            registry: reg.to_string(),
            repo: repo.to_string(),
            tag: tag.clone(),
        });
        handle.pull(&local_path, &tag)?;

        let tar_path = single_tar_in(&local_path)?;
        archive_unpack_and_discard(&tar_path, &local_path)?;

        Ok((local_path, tag))
    }
}

/// Unpack an artifact tar next to itself, then delete it so the directory
/// hashes over package contents only.
fn archive_unpack_and_discard(tar_path: &Path, dest: &Path) -> Result<(), ClientError> {
    crate::archive::untar_dir(tar_path, dest)?;
    fs::remove_file(tar_path)?;
    Ok(())
}

fn bind_path(pkg: &mut Package, name: &str, path: PathBuf) {
    if let Some(entry) = pkg.deps.deps.get_mut(name) {
        entry.local_full_path = Some(path);
    }
}
