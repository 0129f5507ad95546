//! OCI registry collaborator.
//!
//! The client consumes registries through the [`OciRepository`] and
//! [`OciProvider`] seams, so resolution logic never talks HTTP directly and
//! tests can install an in-memory registry. The default implementation,
//! [`DistributionProvider`], speaks the OCI Distribution API over
//! `reqwest::blocking`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Media type of OCI image manifests.
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of the artifact config blob.
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Media type of package layers: a plain tar.
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Layer annotation carrying the original file name.
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Credentials store under the kpm home.
const CREDENTIALS_FILE: &str = "credentials.json";

/// Errors that can occur while talking to a registry.
#[derive(Error, Debug)]
pub enum OciError {
    #[error("registry request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("registry request to '{url}' failed with status {status}")]
    Api { status: u16, url: String },

    #[error("no tags found for '{repo}'")]
    NoTags { repo: String },

    #[error("invalid OCI manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    #[error("failed to read or write artifact data: {0}")]
    Io(#[from] io::Error),
}

/// A handle on one repository within one registry.
pub trait OciRepository {
    /// Download the artifact tagged `tag` into `local_path`.
    ///
    /// Every layer is written as a file under `local_path`, named by its
    /// title annotation when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or a layer cannot be fetched.
    fn pull(&self, local_path: &Path, tag: &str) -> Result<(), OciError>;

    /// Upload `artifact` under `tag`, attaching `annotations` to the
    /// manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if any blob or the manifest cannot be uploaded.
    fn push(
        &self,
        artifact: &Path,
        tag: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), OciError>;

    /// The latest available tag, semver-sorted with a lexicographic
    /// fallback for tags that are not versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag list cannot be fetched or is empty.
    fn latest_tag(&self) -> Result<String, OciError>;

    /// Whether `tag` exists in the repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag list cannot be fetched.
    fn contains_tag(&self, tag: &str) -> Result<bool, OciError>;

    /// The raw manifest JSON for `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be fetched.
    fn fetch_manifest(&self, tag: &str) -> Result<String, OciError>;
}

/// Opens repositories and manages registry credentials.
pub trait OciProvider {
    /// Open a repository handle for `<reg>/<repo>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be constructed.
    fn open(&self, reg: &str, repo: &str) -> Result<Box<dyn OciRepository>, OciError>;

    /// Store credentials for a registry host.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be persisted.
    fn login(&self, hostname: &str, username: &str, password: &str) -> Result<(), OciError>;

    /// Discard credentials for a registry host.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be persisted.
    fn logout(&self, hostname: &str) -> Result<(), OciError>;
}

/// An OCI content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OciDescriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

/// An OCI image manifest, reduced to the fields the client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OciManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: OciDescriptor,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

/// Extract a named annotation from raw manifest JSON.
///
/// # Errors
///
/// Returns an error if the JSON is not a valid manifest.
pub fn manifest_annotation(manifest_json: &str, key: &str) -> Result<Option<String>, OciError> {
    let manifest: OciManifest = serde_json::from_str(manifest_json)?;
    Ok(manifest.annotations.get(key).cloned())
}

/// Stored registry credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// The default provider: OCI Distribution API over HTTPS.
#[derive(Debug, Clone)]
pub struct DistributionProvider {
    http: reqwest::blocking::Client,
    credentials_path: PathBuf,
}

impl DistributionProvider {
    /// A provider storing credentials under the given kpm home.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(kpm_home: &Path) -> Result<Self, OciError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("kpm/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            credentials_path: kpm_home.join(CREDENTIALS_FILE),
        })
    }

    fn load_credentials(&self) -> BTreeMap<String, Credentials> {
        fs::read_to_string(&self.credentials_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn store_credentials(&self, creds: &BTreeMap<String, Credentials>) -> Result<(), OciError> {
        if let Some(parent) = self.credentials_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.credentials_path, serde_json::to_string(creds)?)?;
        Ok(())
    }
}

impl OciProvider for DistributionProvider {
    fn open(&self, reg: &str, repo: &str) -> Result<Box<dyn OciRepository>, OciError> {
        let auth = self
            .load_credentials()
            .get(reg)
            .map(|c| (c.username.clone(), c.password.clone()));
        Ok(Box::new(DistributionRepository {
            http: self.http.clone(),
            base: format!("https://{reg}"),
            repo: repo.to_string(),
            auth,
        }))
    }

    fn login(&self, hostname: &str, username: &str, password: &str) -> Result<(), OciError> {
        let mut creds = self.load_credentials();
        creds.insert(
            hostname.to_string(),
            Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.store_credentials(&creds)
    }

    fn logout(&self, hostname: &str) -> Result<(), OciError> {
        let mut creds = self.load_credentials();
        creds.remove(hostname);
        self.store_credentials(&creds)
    }
}

/// One repository reached over the Distribution API.
struct DistributionRepository {
    http: reqwest::blocking::Client,
    base: String,
    repo: String,
    auth: Option<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl DistributionRepository {
    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.auth {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    fn list_tags(&self) -> Result<Vec<String>, OciError> {
        let url = format!("{}/v2/{}/tags/list", self.base, self.repo);
        let response = self.authed(self.http.get(&url)).send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url,
            });
        }
        let list: TagList = response.json()?;
        Ok(list.tags.unwrap_or_default())
    }

    fn fetch_blob(&self, digest: &str) -> Result<Vec<u8>, OciError> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.repo, digest);
        let response = self.authed(self.http.get(&url)).send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.bytes()?.to_vec())
    }

    /// Upload one blob and return its descriptor digest and size.
    fn upload_blob(&self, data: &[u8]) -> Result<(String, u64), OciError> {
        let digest = format!("sha256:{:x}", Sha256::digest(data));

        let start_url = format!("{}/v2/{}/blobs/uploads/", self.base, self.repo);
        let response = self.authed(self.http.post(&start_url)).send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url: start_url,
            });
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let location = if location.starts_with("http") {
            location
        } else {
            format!("{}{}", self.base, location)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={digest}");

        let response = self
            .authed(self.http.put(&put_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url: put_url,
            });
        }

        Ok((digest, data.len() as u64))
    }
}

impl OciRepository for DistributionRepository {
    fn pull(&self, local_path: &Path, tag: &str) -> Result<(), OciError> {
        let manifest: OciManifest = serde_json::from_str(&self.fetch_manifest(tag)?)?;
        fs::create_dir_all(local_path)?;

        for layer in &manifest.layers {
            let data = self.fetch_blob(&layer.digest)?;
            let file_name = layer
                .annotations
                .get(TITLE_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| {
                    let digest = layer.digest.replace(':', "_");
                    format!("{digest}.tar")
                });
            fs::write(local_path.join(file_name), data)?;
        }
        Ok(())
    }

    fn push(
        &self,
        artifact: &Path,
        tag: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), OciError> {
        let data = fs::read(artifact)?;
        let (layer_digest, layer_size) = self.upload_blob(&data)?;

        let config_data = b"{}";
        let (config_digest, config_size) = self.upload_blob(config_data)?;

        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let manifest = OciManifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: OciDescriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_size,
                annotations: BTreeMap::new(),
            },
            layers: vec![OciDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: layer_digest,
                size: layer_size,
                annotations: BTreeMap::from([(TITLE_ANNOTATION.to_string(), file_name)]),
            }],
            annotations: annotations.clone(),
        };

        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repo, tag);
        let response = self
            .authed(self.http.put(&url))
            .header(reqwest::header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(serde_json::to_vec(&manifest)?)
            .send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(())
    }

    fn latest_tag(&self) -> Result<String, OciError> {
        let mut tags = self.list_tags()?;
        if tags.is_empty() {
            return Err(OciError::NoTags {
                repo: self.repo.clone(),
            });
        }
        tags.sort_by(compare_tags);
        Ok(tags.pop().unwrap_or_default())
    }

    fn contains_tag(&self, tag: &str) -> Result<bool, OciError> {
        Ok(self.list_tags()?.iter().any(|t| t == tag))
    }

    fn fetch_manifest(&self, tag: &str) -> Result<String, OciError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repo, tag);
        let response = self
            .authed(self.http.get(&url))
            .header(reqwest::header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()?;
        if !response.status().is_success() {
            return Err(OciError::Api {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.text()?)
    }
}

/// Order tags by semver when both parse, lexicographically otherwise.
fn compare_tags(a: &String, b: &String) -> std::cmp::Ordering {
    let parse = |tag: &str| semver::Version::parse(tag.trim_start_matches('v')).ok();
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}
