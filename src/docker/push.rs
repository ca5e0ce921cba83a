//! Image push.
//!
//! The daemon path asks the engine to push and scrapes the digest from its
//! progress stream. When the daemon cannot resolve the registry's name —
//! common with cluster-internal registries — the pusher falls back to the
//! direct path: image bytes are exported from the daemon and re-published
//! over an HTTP transport that may bypass DNS entirely. Optionally the
//! pushed image is wrapped in a single-entry manifest list.

use std::sync::LazyLock;

use bollard::auth::DockerCredentials;
use bollard::query_parameters::PushImageOptions;
use futures_util::StreamExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::model::Function;
use crate::config::FunctionError;
use crate::docker::client::Engine;
use crate::docker::creds::Credentials;
use crate::registry::archive::parse_save_archive;
use crate::registry::{
    sha256_digest, Reference, RegistryClient, RegistryOptions, DOCKER_CONFIG_MEDIA_TYPE,
    DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
};

static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"digest:\s+(sha256:[0-9a-f]{64})").expect("digest regex must compile")
});

/// Extract an image digest from a daemon push status line.
pub fn parse_digest(line: &str) -> Option<String> {
    DIGEST_RE
        .captures(line)
        .map(|cap| cap[1].to_string())
}

/// True for daemon error messages that indicate the registry's name could
/// not be resolved from the daemon's network.
pub fn is_name_resolution_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("no such host")
        || message.contains("name resolution")
        || message.contains("server misbehaving")
        || message.contains("name or service not known")
}

/// Outcome of the daemon push attempt.
#[derive(Debug)]
pub enum DaemonOutcome {
    Digest(String),
    /// The daemon could not resolve the registry; the direct path should
    /// be tried.
    NameResolutionFailure(String),
}

#[allow(async_fn_in_trait)]
pub trait DaemonPushPath {
    async fn push(&self, image: &str, creds: &Credentials) -> anyhow::Result<DaemonOutcome>;
}

#[allow(async_fn_in_trait)]
pub trait DirectPushPath {
    async fn push(&self, image: &str, creds: &Credentials) -> anyhow::Result<String>;
}

/// Progress events from the direct path.
#[derive(Debug, Clone)]
pub struct PushProgress {
    pub layer: usize,
    pub total: usize,
    pub bytes: usize,
}

pub struct Pusher<D, R> {
    daemon: D,
    direct: R,
    /// Wrap the pushed image in a single-entry Docker manifest list and
    /// return the index digest instead of the manifest digest.
    pub wrap_in_index: bool,
    /// Probe the registry's resolvability first and skip the daemon path
    /// when the name cannot resolve from this process either.
    pub probe_resolvability: bool,
    registry_options: RegistryOptions,
}

impl<D: DaemonPushPath, R: DirectPushPath> Pusher<D, R> {
    pub fn new(daemon: D, direct: R) -> Self {
        Pusher {
            daemon,
            direct,
            wrap_in_index: false,
            probe_resolvability: false,
            registry_options: RegistryOptions::default(),
        }
    }

    pub fn wrap_in_index(mut self, wrap: bool) -> Self {
        self.wrap_in_index = wrap;
        self
    }

    pub fn probe_resolvability(mut self, probe: bool) -> Self {
        self.probe_resolvability = probe;
        self
    }

    pub fn registry_options(mut self, opts: RegistryOptions) -> Self {
        self.registry_options = opts;
        self
    }

    /// Push the function's build image; returns the pushed digest.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        f: &Function,
        creds: &Credentials,
    ) -> anyhow::Result<String> {
        if f.build.image.is_empty() {
            return Err(FunctionError::NoImage.into());
        }
        let image = &f.build.image;

        let outcome = if self.probe_resolvability && !registry_resolvable(image).await {
            DaemonOutcome::NameResolutionFailure(
                "registry is not resolvable from this host".to_string(),
            )
        } else {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("push cancelled"),
                outcome = self.daemon.push(image, creds) => outcome?,
            }
        };
        let digest = match outcome {
            DaemonOutcome::Digest(digest) => digest,
            DaemonOutcome::NameResolutionFailure(message) => {
                tracing::debug!(image = %image, %message, "daemon cannot resolve registry, pushing directly");
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("push cancelled"),
                    digest = self.direct.push(image, creds) => digest?,
                }
            }
        };

        if !self.wrap_in_index {
            return Ok(digest);
        }

        let mut opts = self.registry_options.clone();
        opts.username = creds.username.clone();
        opts.password = creds.password.clone();
        let client = RegistryClient::new(opts)?;
        let reference = Reference::parse(image)?;
        let index_digest = write_index(&client, &reference).await?;
        Ok(index_digest)
    }
}

// ---------------------------------------------------------------------------
// Daemon path

pub struct EnginePush<'a> {
    pub engine: &'a Engine,
}

impl DaemonPushPath for EnginePush<'_> {
    async fn push(&self, image: &str, creds: &Credentials) -> anyhow::Result<DaemonOutcome> {
        let reference = Reference::parse(image)?;
        let name = format!("{}/{}", reference.registry, reference.repository);
        let tag = reference.tag.clone().unwrap_or_else(|| "latest".into());

        let auth = DockerCredentials {
            username: Some(creds.username.clone()),
            password: Some(creds.password.clone()),
            serveraddress: Some(reference.registry.clone()),
            ..Default::default()
        };

        let mut stream = self.engine.push_image(
            &name,
            Some(PushImageOptions {
                tag: Some(tag),
                ..Default::default()
            }),
            Some(auth),
        )?;

        let mut digest = None;
        while let Some(item) = stream.next().await {
            let info = match item {
                Ok(info) => info,
                Err(e) => {
                    if is_name_resolution_failure(&e.to_string()) {
                        return Ok(DaemonOutcome::NameResolutionFailure(e.to_string()));
                    }
                    return Err(anyhow::Error::new(e).context("daemon push"));
                }
            };
            if let Some(detail) = info.error_detail {
                let message = detail.message.unwrap_or_default();
                if is_name_resolution_failure(&message) {
                    return Ok(DaemonOutcome::NameResolutionFailure(message));
                }
                anyhow::bail!("daemon push failed: {message}");
            }
            if let Some(status) = &info.status {
                if let Some(found) = parse_digest(status) {
                    digest = Some(found);
                }
            }
        }

        digest
            .map(DaemonOutcome::Digest)
            .ok_or_else(|| anyhow::anyhow!("daemon push reported no digest for {image}"))
    }
}

// ---------------------------------------------------------------------------
// Direct path

pub struct DirectPush<'a> {
    pub engine: &'a Engine,
    pub options: RegistryOptions,
    /// Bounded progress channel; events are dropped when the receiver
    /// lags rather than stalling the upload.
    pub progress: Option<tokio::sync::mpsc::Sender<PushProgress>>,
}

impl DirectPushPath for DirectPush<'_> {
    async fn push(&self, image: &str, creds: &Credentials) -> anyhow::Result<String> {
        let reference = Reference::parse(image)?;
        let mut opts = self.options.clone();
        opts.username = creds.username.clone();
        opts.password = creds.password.clone();
        let client = RegistryClient::new(opts)?;

        // Image bytes come out of the daemon as a save archive.
        let mut stream = self.engine.export_image(image)?;
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        let saved = parse_save_archive(archive.as_slice())?;

        let config_digest = sha256_digest(&saved.config);
        client
            .put_blob(&reference, &config_digest, saved.config.clone())
            .await?;

        let total = saved.layers.len();
        let mut layer_descriptors = Vec::with_capacity(total);
        for (i, layer) in saved.layers.iter().enumerate() {
            let compressed = gzip(layer)?;
            let digest = sha256_digest(&compressed);
            let size = compressed.len();
            client.put_blob(&reference, &digest, compressed).await?;
            if let Some(progress) = &self.progress {
                let _ = progress.try_send(PushProgress {
                    layer: i + 1,
                    total,
                    bytes: size,
                });
            }
            layer_descriptors.push(serde_json::json!({
                "mediaType": DOCKER_LAYER_MEDIA_TYPE,
                "size": size,
                "digest": digest,
            }));
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": DOCKER_CONFIG_MEDIA_TYPE,
                "size": saved.config.len(),
                "digest": config_digest,
            },
            "layers": layer_descriptors,
        });
        let body = serde_json::to_vec(&manifest)?;
        let digest = client
            .put_manifest(&reference, DOCKER_MANIFEST_MEDIA_TYPE, body)
            .await?;
        Ok(digest)
    }
}

/// Whether the image's registry resolves from this process. Literal
/// addresses and localhost count as resolvable.
async fn registry_resolvable(image: &str) -> bool {
    let Ok(reference) = Reference::parse(image) else {
        return true;
    };
    let host = reference.host().to_string();
    if host == "localhost" || host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    let result = tokio::net::lookup_host((host.as_str(), 443)).await;
    result.is_ok()
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write as _;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

// ---------------------------------------------------------------------------
// Index synthesis

/// A Docker manifest list with a single entry for the given manifest.
pub fn single_entry_index(
    manifest_media_type: &str,
    manifest_digest: &str,
    manifest_size: usize,
    os: &str,
    arch: &str,
    variant: Option<&str>,
) -> serde_json::Value {
    let mut platform = serde_json::json!({ "os": os, "architecture": arch });
    if let Some(variant) = variant {
        platform["variant"] = serde_json::Value::String(variant.to_string());
    }
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_LIST_MEDIA_TYPE,
        "manifests": [{
            "mediaType": manifest_media_type,
            "size": manifest_size,
            "digest": manifest_digest,
            "platform": platform,
        }],
    })
}

/// Fetch the pushed image's config to learn its platform, synthesize a
/// single-entry manifest list pointing at it, and write the list at the
/// original reference. Returns the index digest.
pub async fn write_index(
    client: &RegistryClient,
    reference: &Reference,
) -> anyhow::Result<String> {
    let (media_type, manifest_bytes) = client.get_manifest_raw(reference).await?;
    let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&manifest_bytes)?;
    let config_bytes = client
        .get_blob(reference, &manifest.config().digest().to_string())
        .await?;
    let config: oci_spec::image::ImageConfiguration = serde_json::from_slice(&config_bytes)?;

    let index = single_entry_index(
        &media_type,
        &sha256_digest(&manifest_bytes),
        manifest_bytes.len(),
        &config.os().to_string(),
        &config.architecture().to_string(),
        config.variant().as_deref(),
    );
    let body = serde_json::to_vec(&index)?;
    let digest = client
        .put_manifest(reference, DOCKER_MANIFEST_LIST_MEDIA_TYPE, body)
        .await?;
    Ok(digest)
}
