//! Minimal OCI distribution client.
//!
//! Covers the registry contact the pusher and resolver need: manifest and
//! blob reads, blob uploads, manifest/index writes, and a push-permission
//! probe used for credential verification. Basic auth only. A custom
//! address override lets the direct-push path reach registries the local
//! resolver cannot.

pub mod archive;
pub mod reference;
pub mod resolver;

use std::net::SocketAddr;

use sha2::{Digest as _, Sha256};

pub use reference::Reference;

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

const ACCEPT_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry denied access (unauthorized)")]
    Unauthorized,
    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("image index declares {0} manifests; refusing to process")]
    IndexTooLarge(usize),
    #[error("platform {platform} not supported by image {reference}")]
    PlatformUnsupported { reference: String, platform: String },
    #[error("blob upload for {0} returned no location")]
    NoUploadLocation(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("decoding registry payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RegistryError {
    /// True when the failure is a name-resolution problem, which the
    /// pusher treats as retriable through the direct path.
    pub fn is_name_resolution(&self) -> bool {
        match self {
            RegistryError::Http(e) => {
                let mut cause: Option<&dyn std::error::Error> = Some(e);
                while let Some(c) = cause {
                    let text = c.to_string().to_lowercase();
                    if text.contains("dns") || text.contains("no such host") {
                        return true;
                    }
                    cause = c.source();
                }
                false
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Basic-auth credentials; empty username means anonymous.
    pub username: String,
    pub password: String,
    /// Talk plain HTTP. Intended for localhost registries.
    pub insecure: bool,
    /// Pin the registry host to a concrete address, bypassing DNS.
    pub resolve: Option<(String, SocketAddr)>,
}

pub struct RegistryClient {
    http: reqwest::Client,
    opts: RegistryOptions,
}

impl RegistryClient {
    pub fn new(opts: RegistryOptions) -> Result<Self, RegistryError> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some((host, addr)) = &opts.resolve {
            builder = builder.resolve(host, *addr);
        }
        let http = builder.build()?;
        Ok(RegistryClient { http, opts })
    }

    pub fn anonymous() -> Result<Self, RegistryError> {
        Self::new(RegistryOptions::default())
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.opts.insecure || registry.starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{registry}/v2")
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if !self.opts.username.is_empty() {
            req = req.basic_auth(&self.opts.username, Some(&self.opts.password));
        }
        req
    }

    /// Fetch a manifest (or index) with its media type.
    pub async fn get_manifest_raw(
        &self,
        reference: &Reference,
    ) -> Result<(String, Vec<u8>), RegistryError> {
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(&reference.registry),
            reference.repository,
            reference.identifier()
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header(reqwest::header::ACCEPT, ACCEPT_MANIFEST)
            .send()
            .await?;
        let resp = check_status(resp)?;
        let media_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DOCKER_MANIFEST_MEDIA_TYPE)
            .to_string();
        let body = resp.bytes().await?.to_vec();
        Ok((media_type, body))
    }

    pub async fn get_blob(
        &self,
        reference: &Reference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            self.base_url(&reference.registry),
            reference.repository
        );
        let resp = self.request(reqwest::Method::GET, &url).send().await?;
        Ok(check_status(resp)?.bytes().await?.to_vec())
    }

    pub async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &str,
    ) -> Result<bool, RegistryError> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            self.base_url(&reference.registry),
            reference.repository
        );
        let resp = self.request(reqwest::Method::HEAD, &url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            401 => Err(RegistryError::Unauthorized),
            status => Err(RegistryError::Status {
                status,
                url: url.clone(),
            }),
        }
    }

    /// Upload a blob (monolithic: POST for a session, PUT with digest).
    pub async fn put_blob(
        &self,
        reference: &Reference,
        digest: &str,
        body: Vec<u8>,
    ) -> Result<(), RegistryError> {
        if self.blob_exists(reference, digest).await? {
            return Ok(());
        }
        let url = format!(
            "{}/{}/blobs/uploads/",
            self.base_url(&reference.registry),
            reference.repository
        );
        let resp = self.request(reqwest::Method::POST, &url).send().await?;
        let resp = check_status(resp)?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::NoUploadLocation(digest.to_string()))?;
        let put_url = upload_url(&self.base_url(&reference.registry), location, digest);
        let resp = self
            .request(reqwest::Method::PUT, &put_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        check_status(resp)?;
        Ok(())
    }

    /// Write a manifest or index at the reference; returns its digest.
    pub async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<String, RegistryError> {
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(&reference.registry),
            reference.repository,
            reference.identifier()
        );
        let digest = sha256_digest(&body);
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(body)
            .send()
            .await?;
        check_status(resp)?;
        Ok(digest)
    }

    /// Probe push permission by opening (and abandoning) a blob upload
    /// session. 401 maps to [`RegistryError::Unauthorized`].
    pub async fn check_push_permission(&self, reference: &Reference) -> Result<(), RegistryError> {
        let url = format!(
            "{}/{}/blobs/uploads/",
            self.base_url(&reference.registry),
            reference.repository
        );
        let resp = self.request(reqwest::Method::POST, &url).send().await?;
        if resp.status().as_u16() == 401 {
            return Err(RegistryError::Unauthorized);
        }
        let resp = check_status(resp)?;
        // Abandon the session; failures here are inconsequential.
        if let Some(location) = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            let url = upload_location(&self.base_url(&reference.registry), location);
            let _ = self.request(reqwest::Method::DELETE, &url).send().await;
        }
        Ok(())
    }
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 401 {
        return Err(RegistryError::Unauthorized);
    }
    Err(RegistryError::Status {
        status: status.as_u16(),
        url: resp.url().to_string(),
    })
}

fn upload_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        // Relative Location; base ends with /v2 and location starts with /v2.
        let origin = base.trim_end_matches("/v2");
        format!("{origin}{location}")
    }
}

fn upload_url(base: &str, location: &str, digest: &str) -> String {
    let url = upload_location(base, location);
    if url.contains('?') {
        format!("{url}&digest={digest}")
    } else {
        format!("{url}?digest={digest}")
    }
}

/// `sha256:<hex>` of a byte payload.
pub fn sha256_digest(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_format() {
        let d = sha256_digest(b"hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
    }

    #[test]
    fn upload_url_appends_digest() {
        assert_eq!(
            upload_url(
                "https://r.io/v2",
                "/v2/repo/blobs/uploads/uuid",
                "sha256:abc"
            ),
            "https://r.io/v2/repo/blobs/uploads/uuid?digest=sha256:abc"
        );
        assert_eq!(
            upload_url(
                "https://r.io/v2",
                "https://r.io/v2/repo/blobs/uploads/uuid?state=x",
                "sha256:abc"
            ),
            "https://r.io/v2/repo/blobs/uploads/uuid?state=x&digest=sha256:abc"
        );
    }
}
