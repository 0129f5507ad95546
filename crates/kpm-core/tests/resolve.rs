//! End-to-end resolution tests against an in-memory registry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kpm_core::{
    archive, hash_dir, lockfile, Client, ClientError, Dependencies, Dependency, OciError,
    OciOptions, OciProvider, OciRepository, Reporter, Settings, Source,
};
use tempfile::TempDir;

/// One published artifact: its tar bytes and its manifest JSON.
#[derive(Clone)]
struct Artifact {
    tar: Vec<u8>,
    manifest_json: String,
}

/// An in-memory registry shared by every repository handle.
#[derive(Clone, Default)]
struct FakeRegistry {
    artifacts: Arc<Mutex<HashMap<(String, String), BTreeMap<String, Artifact>>>>,
    pulls: Arc<AtomicUsize>,
    manifest_fetches: Arc<AtomicUsize>,
}

impl FakeRegistry {
    fn publish(&self, reg: &str, repo: &str, tag: &str, content: &Path, sum_annotation: Option<&str>) {
        let tar = pack(content);
        let manifest_json = manifest_json(sum_annotation);
        self.artifacts
            .lock()
            .unwrap()
            .entry((reg.to_string(), repo.to_string()))
            .or_default()
            .insert(tag.to_string(), Artifact { tar, manifest_json });
    }

    fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn manifest_fetch_count(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    fn tags(&self, reg: &str, repo: &str) -> Vec<String> {
        self.artifacts
            .lock()
            .unwrap()
            .get(&(reg.to_string(), repo.to_string()))
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn pack(dir: &Path) -> Vec<u8> {
    let tmp = TempDir::new().unwrap();
    let tar_path = tmp.path().join("artifact.tar");
    archive::tar_dir(dir, &tar_path).unwrap();
    fs::read(&tar_path).unwrap()
}

fn manifest_json(sum: Option<&str>) -> String {
    let annotations = sum
        .map(|s| format!(r#","annotations":{{"org.kcllang.sum":"{s}"}}"#))
        .unwrap_or_default();
    format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:00","size":2}},"layers":[]{annotations}}}"#
    )
}

struct FakeRepo {
    registry: FakeRegistry,
    key: (String, String),
}

impl FakeRepo {
    fn artifact(&self, tag: &str) -> Result<Artifact, OciError> {
        self.registry
            .artifacts
            .lock()
            .unwrap()
            .get(&self.key)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or(OciError::Api {
                status: 404,
                url: format!("{}/{}:{}", self.key.0, self.key.1, tag),
            })
    }
}

impl OciRepository for FakeRepo {
    fn pull(&self, local_path: &Path, tag: &str) -> Result<(), OciError> {
        let artifact = self.artifact(tag)?;
        fs::create_dir_all(local_path)?;
        fs::write(local_path.join("pkg.tar"), &artifact.tar)?;
        self.registry.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push(
        &self,
        artifact: &Path,
        tag: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), OciError> {
        let tar = fs::read(artifact)?;
        let manifest_json = format!(
            r#"{{"schemaVersion":2,"annotations":{}}}"#,
            serde_json::to_string(annotations).unwrap()
        );
        self.registry
            .artifacts
            .lock()
            .unwrap()
            .entry(self.key.clone())
            .or_default()
            .insert(tag.to_string(), Artifact { tar, manifest_json });
        Ok(())
    }

    fn latest_tag(&self) -> Result<String, OciError> {
        self.registry
            .artifacts
            .lock()
            .unwrap()
            .get(&self.key)
            .and_then(|tags| tags.keys().next_back().cloned())
            .ok_or(OciError::NoTags {
                repo: self.key.1.clone(),
            })
    }

    fn contains_tag(&self, tag: &str) -> Result<bool, OciError> {
        Ok(self.artifact(tag).is_ok())
    }

    fn fetch_manifest(&self, tag: &str) -> Result<String, OciError> {
        self.registry.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.artifact(tag)?.manifest_json)
    }
}

struct FakeProvider {
    registry: FakeRegistry,
}

impl OciProvider for FakeProvider {
    fn open(&self, reg: &str, repo: &str) -> Result<Box<dyn OciRepository>, OciError> {
        Ok(Box::new(FakeRepo {
            registry: self.registry.clone(),
            key: (reg.to_string(), repo.to_string()),
        }))
    }

    fn login(&self, _: &str, _: &str, _: &str) -> Result<(), OciError> {
        Ok(())
    }

    fn logout(&self, _: &str) -> Result<(), OciError> {
        Ok(())
    }
}

struct TestEnv {
    _tmp: TempDir,
    kpm_home: PathBuf,
    project: PathBuf,
    registry: FakeRegistry,
    client: Client,
}

fn env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    fs::create_dir_all(&project).unwrap();

    let registry = FakeRegistry::default();
    let settings = Settings::with_home(tmp.path().join("kpm_home")).unwrap();
    let kpm_home = settings.home().to_path_buf();
    let client = Client::with_settings(settings)
        .unwrap()
        .with_reporter(Reporter::silent())
        .with_oci_provider(Box::new(FakeProvider {
            registry: registry.clone(),
        }));

    TestEnv {
        _tmp: tmp,
        kpm_home,
        project,
        registry,
        client,
    }
}

fn write(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn write_manifest(project: &Path, deps: &str) {
    write(
        project,
        "kcl.mod",
        &format!("[package]\nname = \"demo\"\nversion = \"0.1.0\"\n{deps}"),
    );
}

fn oci_dep(name: &str, tag: &str) -> Dependency {
    Dependency::new(
        name,
        tag,
        Source::Oci {
            reg: "ghcr.io".to_string(),
            repo: format!("kcl-lang/{name}"),
            tag: tag.to_string(),
        },
    )
}

/// Scenario: fresh add of an OCI dependency into an empty lock.
#[test]
fn fresh_add_populates_cache_and_lock() {
    let env = env();
    write_manifest(&env.project, "");

    let content = env._tmp.path().join("content_sub");
    write(&content, "main.k", "x = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &content, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.add_dep(&mut pkg, oci_dep("sub", "1.0.0")).unwrap();

    let cache_entry = env.kpm_home.join("sub_1.0.0");
    assert!(cache_entry.join("main.k").exists());

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    let locked = lock.get("sub").unwrap();
    assert_eq!(locked.full_name, "sub_1.0.0");
    assert!(!locked.sum.is_empty());
    assert_eq!(locked.sum, hash_dir(&cache_entry).unwrap());

    let manifest = fs::read_to_string(env.project.join("kcl.mod")).unwrap();
    assert!(manifest.contains("sub = \"1.0.0\""));
    assert!(manifest.contains("name = \"demo\""));
}

/// Scenario: a re-fetch of the same version yielding different content is
/// checksum drift, and the lock file on disk stays untouched.
#[test]
fn checksum_drift_fails_and_preserves_lock() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsub = \"1.0.0\"\n");

    let mut seeded = Dependencies::default();
    let mut dep = oci_dep("sub", "1.0.0");
    dep.sum = "AAA".to_string();
    seeded.insert(dep);
    lockfile::store_lock_deps(&env.project, &seeded).unwrap();
    let lock_before = fs::read_to_string(env.project.join("kcl.mod.lock")).unwrap();

    let content = env._tmp.path().join("content_sub");
    write(&content, "main.k", "drifted = true\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &content, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    let err = env.client.update_deps(&mut pkg).unwrap_err();
    assert!(matches!(err, ClientError::ChecksumMismatch { name } if name == "sub"));

    let lock_after = fs::read_to_string(env.project.join("kcl.mod.lock")).unwrap();
    assert_eq!(lock_before, lock_after);
}

/// Scenario: bumping the manifest tag is an upgrade, not drift; the lock
/// entry is replaced and the old cache directory stays on disk.
#[test]
fn tag_bump_replaces_lock_without_mismatch() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsub = \"1.0.0\"\n");

    let v1 = env._tmp.path().join("content_v1");
    write(&v1, "main.k", "v = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &v1, None);
    let v2 = env._tmp.path().join("content_v2");
    write(&v2, "main.k", "v = 2\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "2.0.0", &v2, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    assert!(env.kpm_home.join("sub_1.0.0").exists());

    write_manifest(&env.project, "[dependencies]\nsub = \"2.0.0\"\n");
    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    assert_eq!(lock.get("sub").unwrap().full_name, "sub_2.0.0");
    assert!(env.kpm_home.join("sub_2.0.0").join("main.k").exists());
    // The superseded entry is never garbage-collected automatically.
    assert!(env.kpm_home.join("sub_1.0.0").exists());
}

/// Scenario: dependencies of dependencies land in the lock but not in the
/// project manifest.
#[test]
fn transitive_dependencies_land_in_lock_only() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsuba = \"1.0.0\"\n");

    let content_b = env._tmp.path().join("content_b");
    write(&content_b, "main.k", "b = 1\n");
    let sum_b = hash_dir(&content_b).unwrap();
    env.registry
        .publish("ghcr.io", "kcl-lang/subb", "1.0.0", &content_b, Some(sum_b.as_str()));

    let content_a = env._tmp.path().join("content_a");
    write(&content_a, "main.k", "a = 1\n");
    write(
        &content_a,
        "kcl.mod",
        "[package]\nname = \"suba\"\nversion = \"1.0.0\"\n\n[dependencies]\nsubb = \"1.0.0\"\n",
    );
    env.registry
        .publish("ghcr.io", "kcl-lang/suba", "1.0.0", &content_a, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    assert!(lock.get("suba").is_some());
    assert!(lock.get("subb").is_some());
    assert!(env.kpm_home.join("subb_1.0.0").join("main.k").exists());

    let manifest = fs::read_to_string(env.project.join("kcl.mod")).unwrap();
    assert!(manifest.contains("suba"));
    assert!(!manifest.contains("subb"));
}

/// Scenario: a vendored project is materialized from the global cache with
/// no network traffic, and removing a dependency prunes its vendor entry.
#[test]
fn vendor_round_trip_copies_from_cache_and_prunes() {
    let env = env();
    write_manifest(
        &env.project,
        "[dependencies]\nsuba = \"1.0.0\"\nsubb = \"1.0.0\"\n",
    );

    // Populate the global cache directly and pin the matching sums.
    let mut seeded = Dependencies::default();
    for name in ["suba", "subb"] {
        let entry = env.kpm_home.join(format!("{name}_1.0.0"));
        write(&entry, "main.k", &format!("{name} = 1\n"));
        let mut dep = oci_dep(name, "1.0.0");
        dep.sum = hash_dir(&entry).unwrap();
        seeded.insert(dep);
    }
    lockfile::store_lock_deps(&env.project, &seeded).unwrap();

    let mut pkg = env.client.load_package(&env.project).unwrap();
    pkg.set_vendor_mode(true);
    env.client.update_deps(&mut pkg).unwrap();

    let vendor = env.project.join("vendor");
    assert!(vendor.join("suba_1.0.0").join("main.k").exists());
    assert!(vendor.join("subb_1.0.0").join("main.k").exists());
    assert_eq!(env.registry.pull_count(), 0);

    // Dropping a dependency from the manifest drops its lock entry and its
    // vendor directory.
    pkg.mod_file.deps.deps.remove("subb");
    env.client.update_deps(&mut pkg).unwrap();

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    assert!(lock.get("subb").is_none());
    assert!(vendor.join("suba_1.0.0").exists());
    assert!(!vendor.join("subb_1.0.0").exists());
    assert_eq!(env.registry.pull_count(), 0);
}

/// Scenario: local sources refresh their checksum silently, and a missing
/// local source is an error.
#[test]
fn local_source_sum_refreshes_silently() {
    let env = env();
    let local = env._tmp.path().join("local_dep");
    write(&local, "main.k", "l = 1\n");
    write_manifest(
        &env.project,
        &format!("[dependencies]\nl = {{ path = \"{}\" }}\n", local.display()),
    );

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let first = lockfile::load_lock_deps(&env.project)
        .unwrap()
        .get("l")
        .unwrap()
        .sum
        .clone();
    assert_eq!(first, hash_dir(&local).unwrap());

    write(&local, "main.k", "l = 2\n");
    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let second = lockfile::load_lock_deps(&env.project)
        .unwrap()
        .get("l")
        .unwrap()
        .sum
        .clone();
    assert_eq!(second, hash_dir(&local).unwrap());
    assert_ne!(first, second);
}

#[test]
fn missing_local_source_is_dependency_not_found() {
    let env = env();
    write_manifest(
        &env.project,
        "[dependencies]\nl = { path = \"/nonexistent/local_dep\" }\n",
    );

    let mut pkg = env.client.load_package(&env.project).unwrap();
    let err = env.client.update_deps(&mut pkg).unwrap_err();
    assert!(matches!(err, ClientError::DependencyNotFound { name, .. } if name == "l"));
}

/// Invariant: two successive resolutions write byte-identical lock files.
#[test]
fn resolve_is_idempotent() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsub = \"1.0.0\"\n");

    let content = env._tmp.path().join("content_sub");
    write(&content, "main.k", "x = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &content, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let first = fs::read_to_string(env.project.join("kcl.mod.lock")).unwrap();

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let second = fs::read_to_string(env.project.join("kcl.mod.lock")).unwrap();

    assert_eq!(first, second);
}

/// Invariant: a fully cached resolution performs zero network traffic.
#[test]
fn cache_hit_resolve_touches_no_network() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsub = \"1.0.0\"\n");

    let content = env._tmp.path().join("content_sub");
    write(&content, "main.k", "x = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &content, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let pulls = env.registry.pull_count();
    let fetches = env.registry.manifest_fetch_count();

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    assert_eq!(env.registry.pull_count(), pulls);
    assert_eq!(env.registry.manifest_fetch_count(), fetches);
}

/// An empty tag resolves to the latest published tag, and the resolved
/// version flows into `full_name`.
#[test]
fn empty_tag_selects_latest() {
    let env = env();
    write_manifest(&env.project, "");

    let v1 = env._tmp.path().join("content_v1");
    write(&v1, "main.k", "v = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/lat", "1.0.0", &v1, None);
    let v2 = env._tmp.path().join("content_v2");
    write(&v2, "main.k", "v = 2\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/lat", "1.2.0", &v2, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.add_dep(&mut pkg, oci_dep("lat", "")).unwrap();

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    let locked = lock.get("lat").unwrap();
    assert_eq!(locked.version, "1.2.0");
    assert_eq!(locked.full_name, "lat_1.2.0");
    assert!(env.kpm_home.join("lat_1.2.0").join("main.k").exists());
}

/// Pushing an existing tag fails fast; pushing a new tag records the
/// package checksum annotation.
#[test]
fn push_fails_fast_on_existing_tag() {
    let env = env();
    write_manifest(&env.project, "");

    let placeholder = env._tmp.path().join("existing");
    write(&placeholder, "main.k", "old = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/demo", "0.1.0", &placeholder, None);

    let opts = OciOptions {
        reg: "ghcr.io".to_string(),
        repo: "kcl-lang/demo".to_string(),
        tag: String::new(),
    };

    let mut pkg = env.client.load_package(&env.project).unwrap();
    let err = env.client.push(&mut pkg, &opts, false).unwrap_err();
    assert!(matches!(err, ClientError::TagExists { tag } if tag == "0.1.0"));

    let opts = OciOptions {
        tag: "0.2.0".to_string(),
        ..opts
    };
    let expected_sum = hash_dir(&env.project).unwrap();
    env.client.push(&mut pkg, &opts, false).unwrap();

    assert!(env
        .registry
        .tags("ghcr.io", "kcl-lang/demo")
        .contains(&"0.2.0".to_string()));
    let pushed = env
        .registry
        .artifacts
        .lock()
        .unwrap()
        .get(&("ghcr.io".to_string(), "kcl-lang/demo".to_string()))
        .unwrap()
        .get("0.2.0")
        .unwrap()
        .clone();
    assert!(pushed.manifest_json.contains(&expected_sum));
}

/// A stray artifact tar left in a cache entry makes it hash-mismatch and
/// triggers a clean re-fetch.
#[test]
fn stale_tar_in_cache_entry_forces_refetch() {
    let env = env();
    write_manifest(&env.project, "[dependencies]\nsub = \"1.0.0\"\n");

    let content = env._tmp.path().join("content_sub");
    write(&content, "main.k", "x = 1\n");
    env.registry
        .publish("ghcr.io", "kcl-lang/sub", "1.0.0", &content, None);

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    let pulls = env.registry.pull_count();

    // Simulate a termination between untar and tar deletion.
    let entry = env.kpm_home.join("sub_1.0.0");
    fs::write(entry.join("stray.tar"), b"leftover").unwrap();

    let mut pkg = env.client.load_package(&env.project).unwrap();
    env.client.update_deps(&mut pkg).unwrap();
    assert_eq!(env.registry.pull_count(), pulls + 1);
    assert!(!entry.join("stray.tar").exists());

    let lock = lockfile::load_lock_deps(&env.project).unwrap();
    assert_eq!(lock.get("sub").unwrap().sum, hash_dir(&entry).unwrap());
}
