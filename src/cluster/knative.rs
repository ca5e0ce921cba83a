//! Knative service lookup.

use anyhow::Context as _;

use crate::cluster::{dynamic_api, knative_service_gvk};

/// The URL of the function's knative service, plus the namespace it was
/// actually observed in.
pub async fn service_url(
    client: kube::Client,
    namespace: &str,
    name: &str,
) -> anyhow::Result<(String, String)> {
    let services = dynamic_api(client, namespace, &knative_service_gvk());
    let service = services
        .get(name)
        .await
        .with_context(|| format!("looking up service '{name}'"))?;
    let url = service.data["status"]["url"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("service '{name}' has no URL yet"))?
        .to_string();
    let observed = service
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| namespace.to_string());
    Ok((url, observed))
}
