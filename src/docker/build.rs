//! Local buildpacks build.
//!
//! Drives the builder image's lifecycle in a container: sources and
//! platform env files are streamed in as a TAR, the creator runs against
//! the engine, and the produced image lands in the daemon under the
//! function's build image reference.

use std::collections::BTreeMap;
use std::path::Path;

use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptions, CreateImageOptions, UploadToContainerOptions, WaitContainerOptions,
};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::builders::{self, TrustPolicy};
use crate::config::interpolate::interpolate_envs;
use crate::config::model::Function;
use crate::config::FunctionError;
use crate::docker::client::{new_engine, Engine, DEFAULT_HOST};
use crate::docker::creds::Credentials;
use crate::scaffolding;
use crate::sources::{self, ArchiveOptions};

/// Listen address the lifecycle advertises to buildpacks unless the
/// function overrides it.
pub const DEFAULT_LISTEN_ADDRESS: &str = "[::]:8080";

const CREATOR: &str = "/cnb/lifecycle/creator";
const PLATFORM_API: &str = "0.12";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build cancelled")]
    Cancelled,
    #[error("the buildpacks builder does not support cross-platform builds")]
    CrossPlatformUnsupported,
    #[error("build failed with exit code {0}")]
    LifecycleFailed(i64),
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub verbose: bool,
    pub trust: TrustPolicy,
    /// Explicit target platforms. The buildpacks path rejects these.
    pub platforms: Vec<String>,
    /// Lifecycle version requested from the platform, pinned so builds do
    /// not drift with the builder's floating tag.
    pub lifecycle_image: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            verbose: false,
            trust: TrustPolicy::default(),
            platforms: Vec::new(),
            lifecycle_image: crate::builders::LIFECYCLE_IMAGE.to_string(),
        }
    }
}

/// Build a function into `f.build.image` using the local engine.
pub async fn build(
    cancel: &CancellationToken,
    f: &Function,
    creds: Option<&Credentials>,
    opts: &BuildOptions,
) -> anyhow::Result<()> {
    if !opts.platforms.is_empty() {
        return Err(BuildError::CrossPlatformUnsupported.into());
    }
    if f.build.image.is_empty() {
        return Err(FunctionError::NoImage.into());
    }

    let builder_image = builders::builder_image(f)?;
    let trusted = opts.trust.is_trusted(&builder_image);
    tracing::info!(builder = %builder_image, trusted, "building function");

    let excludes = read_funcignore(&f.root)?;

    let mut envs = interpolate_envs(&f.build.build_envs)?;
    envs.entry("BPE_DEFAULT_LISTEN_ADDRESS".to_string())
        .or_insert_with(|| DEFAULT_LISTEN_ADDRESS.to_string());

    if f.runtime == "go" {
        let workdir = scaffolding::write_go_scaffolding(&f.root, &f.invoke)?;
        envs.entry("BP_GO_WORKDIR".to_string())
            .or_insert_with(|| workdir.to_string_lossy().into_owned());
    }

    let engine = new_engine(DEFAULT_HOST).await?;
    engine.verify_supported().await?;

    let result = run_lifecycle(
        cancel,
        &engine,
        f,
        &builder_image,
        &envs,
        &excludes,
        trusted.then_some(creds).flatten(),
        opts,
    )
    .await;
    engine.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_lifecycle(
    cancel: &CancellationToken,
    engine: &Engine,
    f: &Function,
    builder_image: &str,
    envs: &BTreeMap<String, String>,
    excludes: &[String],
    creds: Option<&Credentials>,
    opts: &BuildOptions,
) -> anyhow::Result<()> {
    ensure_image(cancel, engine, builder_image).await?;

    let archive = build_archive(f, envs, excludes)?;

    let mut container_env = vec![
        format!("CNB_PLATFORM_API={PLATFORM_API}"),
        format!("CNB_LIFECYCLE_IMAGE={}", opts.lifecycle_image),
    ];
    let mut binds: Vec<String> = f
        .build
        .mounts
        .iter()
        .map(|m| m.trim().to_string())
        .collect();

    let remote = engine.remote_host();
    if let Some(socket) = remote.strip_prefix("unix://") {
        binds.push(format!("{socket}:/var/run/docker.sock"));
    }
    if let Some(creds) = creds {
        container_env.push(format!(
            "CNB_REGISTRY_AUTH={}",
            registry_auth_env(&f.build.image, creds)?
        ));
    }

    let mut cmd = vec![
        CREATOR.to_string(),
        "-app=/workspace".to_string(),
        "-layers=/layers".to_string(),
        "-platform=/platform".to_string(),
        "-daemon".to_string(),
    ];
    for bp in builders::buildpacks(f) {
        cmd.push(format!("-buildpack={bp}"));
    }
    cmd.push(f.build.image.clone());

    let host_config = HostConfig {
        binds: Some(binds),
        network_mode: (std::env::consts::OS == "linux").then(|| "host".to_string()),
        ..Default::default()
    };
    let body = ContainerCreateBody {
        image: Some(builder_image.to_string()),
        cmd: Some(cmd),
        env: Some(container_env),
        host_config: Some(host_config),
        ..Default::default()
    };

    let created = engine.create_container(None, body).await?;
    let id = created.id;

    let result = drive_lifecycle(cancel, engine, &id, archive, opts).await;

    // The container is always cleaned up, even after cancellation.
    let _ = engine.remove_container(&id, true).await;
    result
}

async fn drive_lifecycle(
    cancel: &CancellationToken,
    engine: &Engine,
    id: &str,
    archive: Vec<u8>,
    opts: &BuildOptions,
) -> anyhow::Result<()> {
    engine
        .upload_to_container(
            id,
            Some(UploadToContainerOptions {
                path: "/".to_string(),
                ..Default::default()
            }),
            archive,
        )
        .await?;

    let attach = engine
        .attach_container(
            id,
            Some(AttachContainerOptions {
                stdout: true,
                stderr: true,
                stream: true,
                logs: true,
                ..Default::default()
            }),
        )
        .await?;
    engine.start_container(id).await?;

    let mut output = attach.output;
    let mut buffer: Vec<String> = Vec::new();
    let mut wait = engine.wait_container(id, None::<WaitContainerOptions>)?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = engine.stop_container(id, 2).await;
                return Err(BuildError::Cancelled.into());
            }
            chunk = output.next() => {
                match chunk {
                    Some(Ok(log)) => {
                        let bytes = log.into_bytes();
                        let text = String::from_utf8_lossy(&bytes);
                        for line in text.lines() {
                            buffer.push(line.to_string());
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "lifecycle output stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = engine.stop_container(id, 2).await;
            return Err(BuildError::Cancelled.into());
        }
        status = wait.next() => status,
    };

    let exit_code = match status {
        Some(Ok(response)) => response.status_code,
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
        Some(Err(e)) => return Err(anyhow::Error::new(e).context("waiting for lifecycle")),
        None => 0,
    };

    if exit_code != 0 {
        if opts.verbose {
            for line in &buffer {
                eprintln!("{line}");
            }
        }
        return Err(anyhow::Error::new(BuildError::LifecycleFailed(exit_code))
            .context("buildpacks lifecycle failed"));
    }
    Ok(())
}

async fn ensure_image(
    cancel: &CancellationToken,
    engine: &Engine,
    image: &str,
) -> anyhow::Result<()> {
    if engine.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    tracing::info!(image = %image, "pulling builder image");
    let (name, tag) = match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    };
    let mut stream = engine.create_image(
        Some(CreateImageOptions {
            from_image: Some(name),
            tag: Some(tag),
            ..Default::default()
        }),
        None,
    )?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(BuildError::Cancelled.into()),
            item = stream.next() => {
                match item {
                    Some(Ok(info)) => {
                        if let Some(err) = info.error_detail {
                            anyhow::bail!("pulling {image}: {:?}", err.message);
                        }
                    }
                    Some(Err(e)) => return Err(anyhow::Error::new(e).context("pulling builder image")),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// The upload archive: sources under `workspace/`, lifecycle env files
/// under `platform/env/`, plus a generated launch spec for Python
/// functions that ship no Procfile.
fn build_archive(
    f: &Function,
    envs: &BTreeMap<String, String>,
    excludes: &[String],
) -> anyhow::Result<Vec<u8>> {
    let mut extra_entries: Vec<(String, Vec<u8>)> = envs
        .iter()
        .map(|(name, value)| (format!("platform/env/{name}"), value.clone().into_bytes()))
        .collect();
    if let Some(procfile) = python_launch_spec(f) {
        extra_entries.push(procfile);
    }
    let opts = ArchiveOptions {
        prefix: "workspace".to_string(),
        excludes: excludes.to_vec(),
        extra_entries,
    };
    Ok(sources::archive_to_vec(&f.root, &opts)?)
}

/// A minimal launch spec for Python functions without a Procfile, so the
/// lifecycle has a web process to export.
fn python_launch_spec(f: &Function) -> Option<(String, Vec<u8>)> {
    if f.runtime != "python" || f.root.join("Procfile").exists() {
        return None;
    }
    Some((
        "workspace/Procfile".to_string(),
        b"web: python main.py\n".to_vec(),
    ))
}

/// Registry auth map for the lifecycle, keyed by the image's registry.
fn registry_auth_env(image: &str, creds: &Credentials) -> anyhow::Result<String> {
    use base64::Engine as _;
    let reference = crate::registry::Reference::parse(image)?;
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", creds.username, creds.password));
    let mut auths = serde_json::Map::new();
    auths.insert(
        reference.registry,
        serde_json::Value::String(format!("Basic {basic}")),
    );
    Ok(serde_json::Value::Object(auths).to_string())
}

/// Read `.funcignore` and split on newlines. Order is preserved and no
/// filtering happens here; the archive walker understands gitignore
/// syntax, including comments.
pub fn read_funcignore(root: &Path) -> std::io::Result<Vec<String>> {
    let path = root.join(".funcignore");
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(std::fs::read_to_string(&path)?
        .lines()
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::EnvVar;

    #[test]
    fn funcignore_preserves_order_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".funcignore"), "# comment\nhello.txt").unwrap();
        let excludes = read_funcignore(dir.path()).unwrap();
        assert_eq!(excludes, vec!["# comment", "hello.txt"]);
    }

    #[test]
    fn funcignore_absent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_funcignore(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn python_without_procfile_gets_launch_spec() {
        let dir = tempfile::tempdir().unwrap();
        let f = Function {
            root: dir.path().to_path_buf(),
            runtime: "python".into(),
            ..Default::default()
        };
        let (name, _) = python_launch_spec(&f).unwrap();
        assert_eq!(name, "workspace/Procfile");
    }

    #[test]
    fn python_with_procfile_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "web: gunicorn app").unwrap();
        let f = Function {
            root: dir.path().to_path_buf(),
            runtime: "python".into(),
            ..Default::default()
        };
        assert!(python_launch_spec(&f).is_none());
    }

    #[test]
    fn non_python_gets_no_launch_spec() {
        let dir = tempfile::tempdir().unwrap();
        let f = Function {
            root: dir.path().to_path_buf(),
            runtime: "go".into(),
            ..Default::default()
        };
        assert!(python_launch_spec(&f).is_none());
    }

    #[test]
    fn registry_auth_env_is_keyed_by_registry() {
        let creds = Credentials::new("alice", "pw");
        let auth = registry_auth_env("ghcr.io/alice/app:latest", &creds).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&auth).unwrap();
        let value = parsed["ghcr.io"].as_str().unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn build_archive_includes_platform_env_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.js"), "module.exports = () => {}").unwrap();
        let f = Function {
            root: dir.path().to_path_buf(),
            runtime: "node".into(),
            ..Default::default()
        };
        let envs = interpolate_envs(&[EnvVar::new("FOO", "bar")]).unwrap();
        let tar = build_archive(&f, &envs, &[]).unwrap();
        let entries = crate::sources::list_entries(tar.as_slice()).unwrap();
        assert!(entries.contains_key("workspace/index.js"));
        assert!(entries.contains_key("platform/env/FOO"));
    }

    #[tokio::test]
    async fn explicit_platforms_are_rejected() {
        let f = Function {
            runtime: "node".into(),
            build: crate::config::model::BuildSpec {
                image: "example.com/app:latest".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let opts = BuildOptions {
            platforms: vec!["linux/arm64".into()],
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let err = build(&cancel, &f, None, &opts).await.unwrap_err();
        assert!(
            err.chain()
                .any(|c| c.downcast_ref::<BuildError>().is_some()),
            "{err}"
        );
    }
}
