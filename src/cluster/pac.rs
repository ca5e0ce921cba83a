//! Pipelines-as-Code configuration.
//!
//! Three optional steps: write the `.tekton/` templates next to the
//! sources, reconcile the on-cluster `Repository` CR and its secret, and
//! register a webhook with the remote Git provider.

use std::path::Path;

use anyhow::Context as _;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use rand::distributions::Alphanumeric;
use rand::Rng as _;
use serde_json::json;

use crate::cluster::{dynamic_api, pac_repository_gvk, resources, templates};
use crate::config::model::Function;
use crate::docker::creds::Credentials;

const PAC_NAMESPACE: &str = "pipelines-as-code";
const PAC_INFO_CONFIGMAP: &str = "pipelines-as-code-info";
const FIELD_MANAGER: &str = "fnforge";

/// Which PAC configuration steps to run, and their inputs.
pub struct PacOptions {
    pub local: bool,
    pub cluster: bool,
    pub remote: bool,
    /// Git provider type, e.g. `github`.
    pub provider: String,
    pub personal_access_token: String,
    /// Webhook shared secret; generated (or reused from the cluster)
    /// when not supplied.
    pub webhook_secret: Option<String>,
}

/// Caller-supplied interaction points.
pub struct PacPrompts {
    /// Asked before overwriting an existing `.tekton` file.
    pub confirm_overwrite: Box<dyn Fn(&Path) -> bool + Send + Sync>,
    /// Asked for the controller URL when it cannot be discovered.
    pub controller_url: Box<dyn Fn() -> anyhow::Result<String> + Send + Sync>,
}

pub fn pac_secret_name(f: &Function) -> String {
    format!("{}-secret", resources::repository_name(f))
}

/// Run the configured PAC steps for a function.
pub async fn configure(
    f: &Function,
    creds: &Credentials,
    opts: &PacOptions,
    prompts: &PacPrompts,
) -> anyhow::Result<()> {
    if f.build.git.url.is_empty() {
        anyhow::bail!("pipelines-as-code requires build.git.url to be set");
    }

    if opts.local {
        write_local_templates(f, &prompts.confirm_overwrite)?;
    }
    if opts.cluster || opts.remote {
        let client = kube::Client::try_default()
            .await
            .context("connecting to the cluster")?;
        let namespace = f
            .target_namespace()
            .ok_or_else(|| anyhow::anyhow!("namespace required to configure pipelines-as-code"))?
            .to_string();

        let mut webhook_secret = opts.webhook_secret.clone();
        if opts.cluster {
            let secrets = Api::<Secret>::namespaced(client.clone(), &namespace);
            let value = ensure_pac_secret(&secrets, f, creds, opts, webhook_secret.clone()).await?;
            webhook_secret = Some(value);
            ensure_repository(client.clone(), &namespace, f, opts).await?;
        }
        if opts.remote {
            let controller_url = discover_controller_url(client, &prompts.controller_url).await?;
            register_webhook(
                &f.build.git.url,
                &controller_url,
                &opts.personal_access_token,
                webhook_secret.as_deref().unwrap_or_default(),
            )
            .await?;
        }
    }
    Ok(())
}

/// Write `.tekton/pipeline.yaml` and `.tekton/pipeline-run.yaml` under
/// the function root, prompting before overwriting existing files.
pub fn write_local_templates(
    f: &Function,
    confirm_overwrite: &(dyn Fn(&Path) -> bool + Send + Sync),
) -> anyhow::Result<()> {
    let image = f
        .image_ref()
        .ok_or_else(|| anyhow::anyhow!("function has no image; set registry first"))?;
    let dir = f.root.join(".tekton");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating {}", dir.display()))?;

    let pipeline = templates::pipeline(f)?;
    let run = templates::pipeline_run(f, &image)?;
    for (name, object) in [("pipeline.yaml", &pipeline), ("pipeline-run.yaml", &run)] {
        let path = dir.join(name);
        if path.exists() && !confirm_overwrite(&path) {
            tracing::info!(path = %path.display(), "keeping existing file");
            continue;
        }
        let yaml = serde_yaml::to_string(object)?;
        std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote pipelines-as-code template");
    }
    Ok(())
}

/// Ensure the PAC secret exists: docker config for the target registry,
/// the provider token, and the webhook shared secret. Returns the
/// webhook secret in effect (a pre-existing value is reused).
async fn ensure_pac_secret(
    secrets: &Api<Secret>,
    f: &Function,
    creds: &Credentials,
    opts: &PacOptions,
    requested_webhook_secret: Option<String>,
) -> anyhow::Result<String> {
    let name = pac_secret_name(f);

    let webhook_secret = match requested_webhook_secret {
        Some(value) => value,
        None => match secrets.get(&name).await {
            Ok(existing) => existing
                .data
                .as_ref()
                .and_then(|d| d.get("webhook.secret"))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_else(random_webhook_secret),
            Err(_) => random_webhook_secret(),
        },
    };

    let image = f
        .image_ref()
        .ok_or_else(|| anyhow::anyhow!("function has no image; set registry first"))?;
    let server = crate::registry::Reference::parse(&image)?.registry;
    let config = resources::docker_config_json(&server, creds);

    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;
    // Server-side apply needs explicit type metadata on the payload.
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "labels": resources::function_labels(f),
        },
        "data": {
            "config.json": b64.encode(&config),
            "provider.token": b64.encode(&opts.personal_access_token),
            "webhook.secret": b64.encode(&webhook_secret),
        }
    });
    secrets
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .context("reconciling the pipelines-as-code secret")?;
    Ok(webhook_secret)
}

async fn ensure_repository(
    client: kube::Client,
    namespace: &str,
    f: &Function,
    opts: &PacOptions,
) -> anyhow::Result<()> {
    let repositories = dynamic_api(client, namespace, &pac_repository_gvk());
    let name = resources::repository_name(f);
    let secret = pac_secret_name(f);
    let repository: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "pipelinesascode.tekton.dev/v1alpha1",
        "kind": "Repository",
        "metadata": {
            "name": name,
            "labels": resources::function_labels(f),
        },
        "spec": {
            "url": f.build.git.url,
            "git_provider": {
                "type": opts.provider,
                "secret": {"name": secret, "key": "provider.token"},
                "webhook_secret": {"name": secret, "key": "webhook.secret"},
            },
        }
    }))?;
    repositories
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&repository),
        )
        .await
        .context("reconciling the pipelines-as-code repository")?;
    Ok(())
}

/// Find the PAC controller's public URL: the install info ConfigMap,
/// then the OpenShift route, then the caller.
async fn discover_controller_url(
    client: kube::Client,
    prompt: &(dyn Fn() -> anyhow::Result<String> + Send + Sync),
) -> anyhow::Result<String> {
    let configmaps = Api::<ConfigMap>::namespaced(client.clone(), PAC_NAMESPACE);
    if let Ok(cm) = configmaps.get(PAC_INFO_CONFIGMAP).await {
        if let Some(url) = cm.data.as_ref().and_then(|d| d.get("controller-url")) {
            if !url.is_empty() {
                return Ok(url.clone());
            }
        }
    }

    let route_gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
    let routes = dynamic_api(client, PAC_NAMESPACE, &route_gvk);
    if let Ok(route) = routes.get("pipelines-as-code-controller").await {
        if let Some(host) = route.data["spec"]["host"].as_str() {
            return Ok(format!("https://{host}"));
        }
    }

    prompt()
}

/// `owner/repo` from a Git remote URL.
pub fn repo_slug(url: &str) -> anyhow::Result<(String, String)> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let path = if let Some(rest) = trimmed.split_once("://").map(|(_, rest)| rest) {
        rest.split_once('/')
            .map(|(_, path)| path)
            .unwrap_or_default()
    } else if let Some(rest) = trimmed.split_once(':').map(|(_, rest)| rest) {
        // scp-style: git@host:owner/repo
        rest
    } else {
        trimmed
    };
    let mut parts = path.split('/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() {
        anyhow::bail!("cannot determine owner/repo from '{url}'");
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Register the webhook with the provider. An existing hook counts as
/// success.
async fn register_webhook(
    git_url: &str,
    controller_url: &str,
    token: &str,
    webhook_secret: &str,
) -> anyhow::Result<()> {
    let (owner, repo) = repo_slug(git_url)?;
    let api = format!("https://api.github.com/repos/{owner}/{repo}/hooks");
    let body = json!({
        "name": "web",
        "active": true,
        "events": ["push", "pull_request"],
        "config": {
            "url": controller_url,
            "content_type": "json",
            "insecure_ssl": "0",
            "secret": webhook_secret,
        }
    });
    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let response = client
        .post(&api)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .context("registering the webhook")?;
    match response.status().as_u16() {
        200..=299 => {
            tracing::info!(repo = %format!("{owner}/{repo}"), "webhook registered");
            Ok(())
        }
        // The provider reports an identical existing hook as 422.
        422 => {
            tracing::info!(repo = %format!("{owner}/{repo}"), "webhook already registered");
            Ok(())
        }
        status => {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook registration failed ({status}): {text}")
        }
    }
}

/// A fresh shared secret for webhook payload signing.
pub fn random_webhook_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_secret_is_ten_alphanumeric_chars() {
        let secret = random_webhook_secret();
        assert_eq!(secret.len(), 10);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, random_webhook_secret());
    }

    #[test]
    fn repo_slug_from_https() {
        let (owner, repo) = repo_slug("https://github.com/alice/greeter.git").unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("alice", "greeter"));
        let (owner, repo) = repo_slug("https://github.com/alice/greeter/").unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("alice", "greeter"));
    }

    #[test]
    fn repo_slug_from_scp_style() {
        let (owner, repo) = repo_slug("git@github.com:alice/greeter.git").unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("alice", "greeter"));
    }

    #[test]
    fn repo_slug_rejects_bare_hosts() {
        assert!(repo_slug("https://github.com/").is_err());
    }

    #[test]
    fn local_templates_respect_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let f = Function {
            root: dir.path().to_path_buf(),
            name: "greeter".into(),
            runtime: "node".into(),
            registry: "ghcr.io/alice".into(),
            ..Default::default()
        };

        write_local_templates(&f, &|_| true).unwrap();
        let pipeline_path = dir.path().join(".tekton/pipeline.yaml");
        assert!(pipeline_path.exists());
        let rendered = std::fs::read_to_string(&pipeline_path).unwrap();
        assert!(rendered.contains("kind: Pipeline"));

        // Decline the overwrite; the sentinel content must survive.
        std::fs::write(&pipeline_path, "sentinel").unwrap();
        write_local_templates(&f, &|_| false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&pipeline_path).unwrap(),
            "sentinel"
        );

        // Accept the overwrite; the sentinel is replaced.
        write_local_templates(&f, &|_| true).unwrap();
        assert!(std::fs::read_to_string(&pipeline_path)
            .unwrap()
            .contains("kind: Pipeline"));
    }
}
