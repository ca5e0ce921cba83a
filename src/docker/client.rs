//! Engine client construction.
//!
//! Resolves the engine host (environment, default, podman fallbacks),
//! dials over UNIX socket, TCP (optionally TLS), SSH tunnel, or named
//! pipe, and wraps the client in a close-guard so any call after `close`
//! fails with a diagnostic instead of corrupting state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, CreateImageOptions, PushImageOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::Stream;
use tokio::sync::Mutex;
use url::Url;

/// Default engine endpoint when the environment does not say otherwise.
#[cfg(unix)]
pub const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";
#[cfg(windows)]
pub const DEFAULT_HOST: &str = "npipe:////./pipe/docker_engine";

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine client used after close")]
    Closed,
    #[error("no container engine available at {0}")]
    NoEngine(String),
    #[error("podman {0} has known broken verbose output; please use another version")]
    UnsupportedPodmanVersion(String),
    #[error("invalid engine host '{0}'")]
    Host(String),
    #[error(transparent)]
    Connect(#[from] bollard::errors::Error),
}

/// A close-guarded engine client.
///
/// Owns the underlying connection plus any transient helper process that
/// backs it (an SSH tunnel or a podman service). After [`Engine::close`]
/// every operation fails with [`EngineError::Closed`].
pub struct Engine {
    docker: Docker,
    remote_host: String,
    closed: AtomicBool,
    helper: Mutex<Option<tokio::process::Child>>,
}

impl Engine {
    pub(crate) fn from_docker(docker: Docker, remote_host: String) -> Engine {
        Engine {
            docker,
            remote_host,
            closed: AtomicBool::new(false),
            helper: Mutex::new(None),
        }
    }

    fn with_helper(mut self, helper: tokio::process::Child) -> Engine {
        self.helper = Mutex::new(Some(helper));
        self
    }

    /// The engine address a lifecycle container can use to reach the same
    /// engine, or empty when the endpoint cannot be mounted (TCP, named
    /// pipes, macOS sockets).
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    fn guard(&self) -> Result<&Docker, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(&self.docker)
    }

    /// Close the client. Idempotent; any helper process is torn down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.helper.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.guard()?.ping().await?;
        Ok(())
    }

    pub async fn server_version(&self) -> Result<bollard::models::SystemVersion, EngineError> {
        Ok(self.guard()?.version().await?)
    }

    /// Reject engines this tool cannot drive correctly.
    pub async fn verify_supported(&self) -> Result<(), EngineError> {
        let version = self.server_version().await?;
        if let Some(v) = broken_podman_version(&version) {
            return Err(EngineError::UnsupportedPodmanVersion(v));
        }
        Ok(())
    }

    pub async fn create_container(
        &self,
        options: Option<CreateContainerOptions>,
        body: bollard::models::ContainerCreateBody,
    ) -> Result<bollard::models::ContainerCreateResponse, EngineError> {
        Ok(self.guard()?.create_container(options, body).await?)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        Ok(self
            .guard()?
            .start_container(id, None::<StartContainerOptions>)
            .await?)
    }

    pub fn wait_container(
        &self,
        id: &str,
        options: Option<WaitContainerOptions>,
    ) -> Result<
        impl Stream<Item = Result<bollard::models::ContainerWaitResponse, bollard::errors::Error>>,
        EngineError,
    > {
        Ok(self.guard()?.wait_container(id, options))
    }

    pub async fn attach_container(
        &self,
        id: &str,
        options: Option<AttachContainerOptions>,
    ) -> Result<bollard::container::AttachContainerResults, EngineError> {
        Ok(self.guard()?.attach_container(id, options).await?)
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: i32) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: Some(timeout_secs),
            signal: None,
        };
        match self.guard()?.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or already gone.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.guard()?.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn push_image(
        &self,
        image: &str,
        options: Option<PushImageOptions>,
        credentials: Option<bollard::auth::DockerCredentials>,
    ) -> Result<
        impl Stream<Item = Result<bollard::models::PushImageInfo, bollard::errors::Error>>,
        EngineError,
    > {
        Ok(self.guard()?.push_image(image, options, credentials))
    }

    pub fn export_image(
        &self,
        image: &str,
    ) -> Result<impl Stream<Item = Result<bytes::Bytes, bollard::errors::Error>>, EngineError>
    {
        Ok(self.guard()?.export_image(image))
    }

    pub async fn inspect_image(
        &self,
        image: &str,
    ) -> Result<bollard::models::ImageInspect, EngineError> {
        Ok(self.guard()?.inspect_image(image).await?)
    }

    pub fn create_image(
        &self,
        options: Option<CreateImageOptions>,
        credentials: Option<bollard::auth::DockerCredentials>,
    ) -> Result<
        impl Stream<Item = Result<bollard::models::CreateImageInfo, bollard::errors::Error>>,
        EngineError,
    > {
        Ok(self.guard()?.create_image(options, None, credentials))
    }

    pub async fn upload_to_container(
        &self,
        id: &str,
        options: Option<UploadToContainerOptions>,
        body: Vec<u8>,
    ) -> Result<(), EngineError> {
        Ok(self
            .guard()?
            .upload_to_container(id, options, bollard::body_full(body.into()))
            .await?)
    }
}

/// Construct an engine client for the resolved host.
///
/// Resolution order: `DOCKER_HOST` from the environment, else
/// `default_host`; a missing UNIX socket falls back to podman when one is
/// installed (a transient `podman system service` on Linux, the default
/// podman machine elsewhere); `ssh://` hosts are reached through a local
/// socket tunnel.
pub async fn new_engine(default_host: &str) -> Result<Engine, EngineError> {
    let host = std::env::var("DOCKER_HOST")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| default_host.to_string());
    let url = Url::parse(&host).map_err(|_| EngineError::Host(host.clone()))?;

    match url.scheme() {
        "unix" => {
            let path = PathBuf::from(url.path());
            if !path.exists() {
                if let Some(podman) = podman_path() {
                    return podman_fallback(&podman).await;
                }
                return Err(EngineError::NoEngine(host));
            }
            let docker = Docker::connect_with_unix(
                &host,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?;
            Ok(Engine::from_docker(
                docker,
                remote_host_for("unix", std::env::consts::OS, &host),
            ))
        }
        "ssh" => {
            let (child, socket) = ssh_tunnel(&url, "/var/run/docker.sock").await?;
            let local = format!("unix://{}", socket.display());
            let docker = Docker::connect_with_unix(
                &local,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?;
            Ok(Engine::from_docker(docker, String::new()).with_helper(child))
        }
        "tcp" | "http" | "https" => {
            let tls = url.scheme() == "https" || tls_verify_enabled();
            let docker = if tls {
                let certs = cert_dir();
                Docker::connect_with_ssl(
                    &host,
                    &certs.join("key.pem"),
                    &certs.join("cert.pem"),
                    &certs.join("ca.pem"),
                    CONNECT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )?
            } else {
                Docker::connect_with_http(
                    &host,
                    CONNECT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )?
            };
            Ok(Engine::from_docker(docker, String::new()))
        }
        #[cfg(windows)]
        "npipe" => {
            let docker = Docker::connect_with_named_pipe(
                &host,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?;
            Ok(Engine::from_docker(docker, String::new()))
        }
        _ => Err(EngineError::Host(host)),
    }
}

/// The address the buildpacks lifecycle container should use to reach the
/// same engine. TCP endpoints, named pipes, and macOS sockets cannot be
/// mounted into helper containers; those map to empty.
pub fn remote_host_for(scheme: &str, os: &str, host: &str) -> String {
    match scheme {
        "unix" if os == "linux" => host.to_string(),
        _ => String::new(),
    }
}

fn tls_verify_enabled() -> bool {
    std::env::var("DOCKER_TLS_VERIFY")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

fn cert_dir() -> PathBuf {
    std::env::var("DOCKER_CERT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".docker")
        })
}

fn podman_path() -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join("podman");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

async fn podman_fallback(podman: &Path) -> Result<Engine, EngineError> {
    if std::env::consts::OS == "linux" {
        return transient_podman_service(podman).await;
    }
    podman_machine(podman).await
}

/// Start `podman system service --time=0` on a private socket and connect
/// to it. The service lives as long as the engine client.
async fn transient_podman_service(podman: &Path) -> Result<Engine, EngineError> {
    let socket = std::env::temp_dir().join(format!("fnforge-podman-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&socket);
    let address = format!("unix://{}", socket.display());

    let child = tokio::process::Command::new(podman)
        .args(["system", "service", "--time=0", &address])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::NoEngine(format!("starting podman service: {e}")))?;

    wait_for_socket(&socket).await?;
    tracing::debug!(socket = %socket.display(), "transient podman service started");

    let docker =
        Docker::connect_with_unix(&address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
    Ok(
        Engine::from_docker(docker, remote_host_for("unix", std::env::consts::OS, &address))
            .with_helper(child),
    )
}

/// Reach the default podman machine through its advertised SSH endpoint.
async fn podman_machine(podman: &Path) -> Result<Engine, EngineError> {
    let output = tokio::process::Command::new(podman)
        .args(["machine", "inspect"])
        .output()
        .await
        .map_err(|e| EngineError::NoEngine(format!("inspecting podman machine: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::NoEngine(
            "no default podman machine available".to_string(),
        ));
    }
    let inspect: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| EngineError::NoEngine(format!("parsing podman machine inspect: {e}")))?;
    let machine = inspect
        .get(0)
        .ok_or_else(|| EngineError::NoEngine("no default podman machine".to_string()))?;
    let port = machine["SSHConfig"]["Port"].as_u64().unwrap_or(0);
    let user = machine["SSHConfig"]["RemoteUsername"]
        .as_str()
        .unwrap_or("core");
    let remote_socket = machine["ConnectionInfo"]["PodmanSocket"]["Path"]
        .as_str()
        .unwrap_or("/run/podman/podman.sock");
    if port == 0 {
        return Err(EngineError::NoEngine(
            "podman machine advertises no SSH port".to_string(),
        ));
    }

    let ssh_url = Url::parse(&format!("ssh://{user}@127.0.0.1:{port}"))
        .map_err(|_| EngineError::NoEngine("invalid podman machine endpoint".to_string()))?;
    let (child, socket) = ssh_tunnel(&ssh_url, remote_socket).await?;
    let local = format!("unix://{}", socket.display());
    let docker =
        Docker::connect_with_unix(&local, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
    Ok(Engine::from_docker(docker, String::new()).with_helper(child))
}

/// Forward a remote engine socket to a local one over `ssh -L`. Identity
/// and passphrase handling follow the user's SSH configuration
/// (`DOCKER_SSH_IDENTITY` selects a key explicitly).
async fn ssh_tunnel(
    url: &Url,
    remote_socket: &str,
) -> Result<(tokio::process::Child, PathBuf), EngineError> {
    let host = url
        .host_str()
        .ok_or_else(|| EngineError::Host(url.to_string()))?;
    let local = std::env::temp_dir().join(format!("fnforge-engine-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&local);

    let mut cmd = tokio::process::Command::new("ssh");
    cmd.args(["-nNT", "-o", "BatchMode=yes"]);
    if let Some(port) = url.port() {
        cmd.args(["-p", &port.to_string()]);
    }
    if let Ok(identity) = std::env::var("DOCKER_SSH_IDENTITY") {
        if !identity.is_empty() {
            cmd.args(["-i", &identity]);
        }
    }
    cmd.arg("-L")
        .arg(format!("{}:{}", local.display(), remote_socket));
    let destination = if url.username().is_empty() {
        host.to_string()
    } else {
        format!("{}@{}", url.username(), host)
    };
    cmd.arg(destination);

    let child = cmd
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::NoEngine(format!("starting ssh tunnel: {e}")))?;

    wait_for_socket(&local).await?;
    tracing::debug!(socket = %local.display(), host, "engine ssh tunnel established");
    Ok((child, local))
}

async fn wait_for_socket(path: &Path) -> Result<(), EngineError> {
    for _ in 0..50 {
        if path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(EngineError::NoEngine(format!(
        "socket {} did not appear",
        path.display()
    )))
}

/// Extract a broken podman version string from the engine's reported
/// version, if the engine is one we refuse to drive. Podman 4.3 corrupts
/// multiplexed attach streams.
pub fn broken_podman_version(version: &bollard::models::SystemVersion) -> Option<String> {
    let components = version.components.as_ref()?;
    for component in components {
        if !component.name.to_lowercase().contains("podman") {
            continue;
        }
        let v = component.version.trim_start_matches('v');
        let mut parts = v.split('.');
        let major = parts.next().unwrap_or("");
        let minor = parts.next().unwrap_or("");
        if major == "4" && minor == "3" {
            return Some(format!("v{v}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn podman_version(version: &str) -> bollard::models::SystemVersion {
        serde_json::from_value(serde_json::json!({
            "Components": [{"Name": "Podman Engine", "Version": version}]
        }))
        .unwrap()
    }

    #[test]
    fn podman_4_3_is_rejected() {
        assert_eq!(
            broken_podman_version(&podman_version("4.3.1")),
            Some("v4.3.1".to_string())
        );
        assert_eq!(broken_podman_version(&podman_version("4.4.0")), None);
        assert_eq!(broken_podman_version(&podman_version("5.0.0")), None);
    }

    #[test]
    fn docker_engine_is_not_podman() {
        let version: bollard::models::SystemVersion = serde_json::from_value(serde_json::json!({
            "Components": [{"Name": "Engine", "Version": "24.3.0"}]
        }))
        .unwrap();
        assert_eq!(broken_podman_version(&version), None);
    }

    #[test]
    fn remote_host_mapping() {
        assert_eq!(
            remote_host_for("unix", "linux", "unix:///var/run/docker.sock"),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(remote_host_for("unix", "macos", "unix:///x.sock"), "");
        assert_eq!(remote_host_for("tcp", "linux", "tcp://1.2.3.4:2376"), "");
        assert_eq!(remote_host_for("npipe", "windows", "npipe:////./pipe/x"), "");
    }

    #[tokio::test]
    async fn calls_after_close_fail_fast() {
        let docker = Docker::connect_with_unix(
            "unix:///tmp/fnforge-test-nonexistent.sock",
            5,
            bollard::API_DEFAULT_VERSION,
        )
        .unwrap();
        let engine = Engine::from_docker(docker, String::new());
        engine.close().await;

        let err = engine.ping().await.unwrap_err();
        assert!(matches!(err, EngineError::Closed), "{err}");
        let err = engine.inspect_image("anything").await.unwrap_err();
        assert!(matches!(err, EngineError::Closed), "{err}");
        assert!(engine.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let docker = Docker::connect_with_unix(
            "unix:///tmp/fnforge-test-nonexistent.sock",
            5,
            bollard::API_DEFAULT_VERSION,
        )
        .unwrap();
        let engine = Engine::from_docker(docker, String::new());
        engine.close().await;
        engine.close().await;
        assert!(engine.is_closed());
    }
}
