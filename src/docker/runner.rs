//! Local function runner.
//!
//! Creates, starts, and attaches to a container for a built function,
//! publishing its HTTP port on loopback. Output is demuxed to the
//! caller's stdio; premature container exit — including a clean exit,
//! functions are assumed long-running — is forwarded on a buffered error
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{AttachContainerOptions, WaitContainerOptions};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::interpolate::interpolate_envs;
use crate::config::model::Function;
use crate::docker::client::{new_engine, Engine, EngineError, DEFAULT_HOST};

const CONTAINER_PORT: &str = "8080/tcp";
const STOP_TIMEOUT_SECS: i32 = 10;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error("function has no built image; build it first")]
    NoImage,
    #[error("function exited with code {0}")]
    Exited(i64),
    #[error("streaming function output: {0}")]
    Stdio(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub verbose: bool,
    /// Treat a zero exit as a runtime error. Functions are expected to
    /// serve forever, but callers may relax this.
    pub error_on_clean_exit: bool,
    /// How long to wait for the published port to accept connections.
    /// Zero skips the readiness wait.
    pub start_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            verbose: false,
            error_on_clean_exit: true,
            start_timeout: Duration::ZERO,
        }
    }
}

/// A started function. Dropping it leaks the container; call
/// [`RunningFunction::stop`].
pub struct RunningFunction {
    pub host: String,
    pub port: String,
    /// Runtime errors: stdio copy failures and premature exits.
    pub errors: tokio::sync::mpsc::Receiver<RunError>,
    engine: Arc<Engine>,
    container_id: String,
    stdio: Option<std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningFunction {
    /// Stop in order: stop container, remove container, close stdio,
    /// close the engine client.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.engine
            .stop_container(&self.container_id, STOP_TIMEOUT_SECS)
            .await?;
        self.engine.remove_container(&self.container_id, true).await?;
        drop(self.stdio.take());
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.engine.close().await;
        Ok(())
    }
}

/// Pick the host port to publish on.
///
/// 8080 is preferred: a failed dial within the probe timeout means nobody
/// is listening, so 8080 is taken as free. Otherwise an ephemeral port is
/// bound, read, and released — the bind-to-use race is tolerated.
pub fn choose_port() -> String {
    let addr = "127.0.0.1:8080".parse().expect("loopback address parses");
    match std::net::TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT) {
        Err(_) => "8080".to_string(),
        Ok(_) => match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener
                .local_addr()
                .map(|a| a.port().to_string())
                .unwrap_or_else(|_| "8080".to_string()),
            Err(_) => "8080".to_string(),
        },
    }
}

/// Run a built function locally.
pub async fn run(
    cancel: &CancellationToken,
    f: &Function,
    opts: &RunnerOptions,
) -> Result<RunningFunction, RunError> {
    if f.build.image.is_empty() {
        return Err(RunError::NoImage);
    }

    let port = choose_port();
    let host = "127.0.0.1".to_string();

    let mut envs: Vec<String> = interpolate_envs(&f.run.envs)
        .map_err(|e| RunError::Other(e.into()))?
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if opts.verbose {
        envs.push("VERBOSE=true".to_string());
    }

    let engine = Arc::new(new_engine(DEFAULT_HOST).await?);

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    port_bindings.insert(
        CONTAINER_PORT.to_string(),
        Some(vec![PortBinding {
            host_ip: Some(host.clone()),
            host_port: Some(port.clone()),
        }]),
    );
    let body = ContainerCreateBody {
        image: Some(f.build.image.clone()),
        env: Some(envs),
        exposed_ports: Some(vec![CONTAINER_PORT.to_string()]),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    };

    let created = engine.create_container(None, body).await?;
    let id = created.id;

    // Attach stdout/stderr (not stdin) before starting so no output is lost.
    let attach = engine
        .attach_container(
            &id,
            Some(AttachContainerOptions {
                stdout: true,
                stderr: true,
                stream: true,
                ..Default::default()
            }),
        )
        .await?;
    engine.start_container(&id).await?;
    tracing::info!(function = %f.name, container = %id, port = %port, "function started");

    let (errors_tx, errors_rx) = tokio::sync::mpsc::channel(10);
    let mut tasks = Vec::new();

    // Output pump: demux the multiplexed stream onto our stdio.
    {
        let errors_tx = errors_tx.clone();
        let cancel = cancel.clone();
        let mut output = attach.output;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = output.next() => match item {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            print!("{}", String::from_utf8_lossy(&message));
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            eprint!("{}", String::from_utf8_lossy(&message));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = errors_tx.send(RunError::Stdio(e.to_string())).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }));
    }

    // Exit watcher: any exit before stop is a runtime error, code 0
    // included unless the caller opted out.
    {
        let errors_tx = errors_tx.clone();
        let cancel = cancel.clone();
        let engine = engine.clone();
        let id = id.clone();
        let error_on_clean_exit = opts.error_on_clean_exit;
        tasks.push(tokio::spawn(async move {
            let mut wait = match engine.wait_container(
                &id,
                Some(WaitContainerOptions {
                    condition: "next-exit".to_string(),
                }),
            ) {
                Ok(wait) => wait,
                Err(e) => {
                    let _ = errors_tx.send(e.into()).await;
                    return;
                }
            };
            let code = tokio::select! {
                _ = cancel.cancelled() => return,
                item = wait.next() => match item {
                    Some(Ok(response)) => response.status_code,
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                    Some(Err(e)) => {
                        let _ = errors_tx.send(RunError::Stdio(e.to_string())).await;
                        return;
                    }
                    None => return,
                },
            };
            if code != 0 || error_on_clean_exit {
                let _ = errors_tx.send(RunError::Exited(code)).await;
            }
        }));
    }

    if !opts.start_timeout.is_zero() {
        wait_ready(&host, &port, opts.start_timeout, cancel).await?;
    }

    Ok(RunningFunction {
        host,
        port,
        errors: errors_rx,
        engine,
        container_id: id,
        stdio: Some(attach.input),
        tasks,
    })
}

async fn wait_ready(
    host: &str,
    port: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let addr = format!("{host}:{port}");
    loop {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RunError::Other(anyhow::anyhow!(
                "function did not start listening on {addr} within {timeout:?}"
            )));
        }
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_port_avoids_occupied_8080() {
        // Hold 8080 if we can; otherwise someone else already does.
        match std::net::TcpListener::bind("127.0.0.1:8080") {
            Ok(_guard) => {
                // 8080 is now occupied by the guard.
                let port = choose_port();
                assert_ne!(port, "8080");
                assert!(port.parse::<u16>().is_ok());
            }
            Err(_) => {
                // Occupied by another process: same expectation.
                let port = choose_port();
                assert_ne!(port, "8080");
            }
        }
    }

    #[test]
    fn choose_port_returns_8080_when_nothing_listens() {
        // Only meaningful when 8080 is actually free.
        if std::net::TcpListener::bind("127.0.0.1:8080").is_ok() {
            assert_eq!(choose_port(), "8080");
        }
    }

    #[tokio::test]
    async fn run_requires_a_built_image() {
        let f = Function::default();
        let err = run(&CancellationToken::new(), &f, &RunnerOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::NoImage), "{err}");
    }
}
