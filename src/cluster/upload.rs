//! Source upload into the function's pipeline volume.
//!
//! A short-lived helper pod mounts the PVC; the source TAR is streamed
//! into `tar -x` through an exec session's stdin. The archive producer
//! reports walk errors by closing the pipe, and those surface here after
//! the copy.

use std::time::Duration;

use anyhow::Context as _;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, PostParams};
use serde_json::json;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;

use crate::cluster::resources;
use crate::config::model::Function;
use crate::sources::{ArchiveOptions, SourceStream};

const UPLOAD_IMAGE: &str = "docker.io/library/busybox:stable";
const START_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream the function's sources into its PVC under `source/`.
pub async fn upload_sources(
    cancel: &CancellationToken,
    client: kube::Client,
    namespace: &str,
    f: &Function,
) -> anyhow::Result<()> {
    let pods = Api::<Pod>::namespaced(client, namespace);
    let pod_name = format!("{}-upload", resources::pvc_name(f));

    // A leftover pod from an interrupted upload is replaced.
    let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
    wait_gone(&pods, &pod_name).await;

    let pod: Pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "labels": resources::function_labels(f),
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "upload",
                "image": UPLOAD_IMAGE,
                "command": ["sh", "-c", "sleep 3600"],
                "volumeMounts": [{"name": "source", "mountPath": "/workspace"}],
            }],
            "volumes": [{
                "name": "source",
                "persistentVolumeClaim": {"claimName": resources::pvc_name(f)},
            }],
        }
    }))?;
    pods.create(&PostParams::default(), &pod)
        .await
        .context("creating the upload pod")?;

    let result = stream_into_pod(cancel, &pods, &pod_name, f).await;

    let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
    result
}

async fn stream_into_pod(
    cancel: &CancellationToken,
    pods: &Api<Pod>,
    pod_name: &str,
    f: &Function,
) -> anyhow::Result<()> {
    wait_running(cancel, pods, pod_name).await?;

    // Pre-existing sources from an earlier upload are cleared so deleted
    // files do not linger.
    let clear = pods
        .exec(
            pod_name,
            ["sh", "-c", "rm -rf /workspace/source"],
            &AttachParams::default().stderr(true),
        )
        .await
        .context("clearing previous sources")?;
    clear.join().await.context("clearing previous sources")?;

    let mut attached = pods
        .exec(
            pod_name,
            ["tar", "-xmf", "-", "-C", "/workspace"],
            &AttachParams::default().stdin(true).stderr(true),
        )
        .await
        .context("starting tar in the upload pod")?;
    let mut stdin = attached
        .stdin()
        .ok_or_else(|| anyhow::anyhow!("upload exec has no stdin"))?;

    let mut stream = SourceStream::open(f.root.clone(), ArchiveOptions::with_prefix("source"));

    let copy = async {
        let copied = tokio::io::copy(&mut stream.reader, &mut stdin).await;
        let _ = stdin.shutdown().await;
        copied
    };
    let copied = tokio::select! {
        // Dropping the exec session tears the stream down.
        _ = cancel.cancelled() => anyhow::bail!("source upload cancelled"),
        copied = copy => copied,
    };

    // A failed walk closes the pipe with its error and the copy just sees
    // EOF, so the producer is checked whenever the copy itself was clean.
    let bytes = match copied {
        Ok(bytes) => {
            stream.finish().await.context("archiving sources")?;
            bytes
        }
        Err(e) => {
            // The copy error is the interesting one; the producer only
            // sees a broken pipe at this point.
            let _ = stream.finish().await;
            return Err(anyhow::Error::new(e).context("streaming sources to the cluster"));
        }
    };
    tracing::debug!(bytes, pod = %pod_name, "sources uploaded");

    let status = attached.take_status();
    attached.join().await.context("waiting for tar to finish")?;
    if let Some(status) = status {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                anyhow::bail!(
                    "extracting sources in the upload pod: {}",
                    status.message.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn wait_running(
    cancel: &CancellationToken,
    pods: &Api<Pod>,
    name: &str,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("source upload cancelled");
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("upload pod {name} did not start within {START_TIMEOUT:?}");
        }
        if let Ok(pod) = pods.get(name).await {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            match phase {
                "Running" => return Ok(()),
                "Failed" | "Succeeded" => {
                    anyhow::bail!("upload pod {name} stopped before the upload ({phase})")
                }
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn wait_gone(pods: &Api<Pod>, name: &str) {
    for _ in 0..60 {
        match pods.get(name).await {
            Err(kube::Error::Api(ae)) if ae.code == 404 => return,
            Err(_) => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}
