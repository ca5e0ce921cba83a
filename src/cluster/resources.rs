//! Naming and provisioning of the per-function resource bundle.
//!
//! Every function owns, per namespace, a deterministic set of resources
//! keyed by a derived name: the PVC and registry secret, the pipeline,
//! its runs, and optionally a PAC repository.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ObjectMeta, PostParams};
use sha2::{Digest as _, Sha256};

use crate::cluster::FUNCTION_NAME_LABEL;
use crate::config::model::Function;
use crate::docker::creds::{registry_equals, Credentials};
use crate::registry::Reference;

/// Kubernetes resource names are capped at 63 characters.
pub const MAX_NAME_LENGTH: usize = 63;

/// Default size of the source/cache volume.
pub const DEFAULT_PVC_SIZE: &str = "256Mi";

/// The auth key Docker Hub credentials are stored under.
pub const DEFAULT_DOCKER_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// The source kind a pipeline is parameterized by: uploaded sources or a
/// git checkout.
pub fn source_kind(f: &Function) -> &'static str {
    if f.build.git.url.is_empty() {
        "upload"
    } else {
        "git"
    }
}

/// The derived name keying the function's resource bundle.
///
/// `name-builder-source` when it fits; otherwise the first 4 bytes of a
/// SHA-256 of that concatenation (8 hex characters) with the stable
/// suffixes kept, so the name stays deterministic and within the limit.
pub fn pipeline_name(f: &Function) -> String {
    let joined = format!("{}-{}-{}", f.name, f.build.builder, source_kind(f));
    if joined.len() <= MAX_NAME_LENGTH {
        return joined;
    }
    let hash = Sha256::digest(joined.as_bytes());
    format!(
        "{}-{}-{}",
        hex::encode(&hash[..4]),
        f.build.builder,
        source_kind(f)
    )
}

pub fn pvc_name(f: &Function) -> String {
    pipeline_name(f)
}

pub fn secret_name(f: &Function) -> String {
    pipeline_name(f)
}

/// Prefix handed to the cluster as `generateName` for pipeline runs.
pub fn pipeline_run_prefix(f: &Function) -> String {
    format!("{}-run-", pipeline_name(f))
}

pub fn repository_name(f: &Function) -> String {
    format!("{}-repo", pipeline_name(f))
}

/// Labels stamped on every resource of the bundle.
pub fn function_labels(f: &Function) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(FUNCTION_NAME_LABEL.to_string(), f.name.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        env!("CARGO_PKG_NAME").to_string(),
    );
    labels
}

/// Create the function's PVC if it does not already exist.
pub async fn ensure_pvc(
    api: &Api<PersistentVolumeClaim>,
    f: &Function,
) -> Result<(), kube::Error> {
    let size = f
        .build
        .pvc_size
        .clone()
        .unwrap_or_else(|| DEFAULT_PVC_SIZE.to_string());
    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(f)),
            labels: Some(function_labels(f)),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    match api.create(&PostParams::default(), &pvc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e),
    }
}

/// The docker config JSON a registry secret carries. Docker Hub
/// credentials go under the conventional auth key.
pub fn docker_config_json(server: &str, creds: &Credentials) -> String {
    use base64::Engine as _;
    let key = if registry_equals(server, "docker.io") {
        DEFAULT_DOCKER_AUTH_KEY.to_string()
    } else {
        server.to_string()
    };
    let auth = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", creds.username, creds.password));
    serde_json::json!({ "auths": { key: { "auth": auth } } }).to_string()
}

/// Ensure the registry secret for the function's image exists.
pub async fn ensure_registry_secret(
    api: &Api<Secret>,
    f: &Function,
    image: &str,
    creds: &Credentials,
) -> anyhow::Result<()> {
    let server = Reference::parse(image)?.registry;
    let config = docker_config_json(&server, creds);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(f)),
            labels: Some(function_labels(f)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            k8s_openapi::ByteString(config.into_bytes()),
        )])),
        ..Default::default()
    };
    match api.create(&PostParams::default(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            api.replace(&secret_name(f), &PostParams::default(), &secret)
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_function(name: &str, git_url: &str) -> Function {
        let mut f = Function {
            name: name.into(),
            ..Default::default()
        };
        f.build.git.url = git_url.into();
        f
    }

    #[test]
    fn short_names_join_directly() {
        let f = named_function("greeter", "");
        assert_eq!(pipeline_name(&f), "greeter-pack-upload");
        assert_eq!(pipeline_run_prefix(&f), "greeter-pack-upload-run-");
        assert_eq!(repository_name(&f), "greeter-pack-upload-repo");
    }

    #[test]
    fn git_source_changes_the_key() {
        let f = named_function("greeter", "https://example.com/r.git");
        assert_eq!(pipeline_name(&f), "greeter-pack-git");
    }

    #[test]
    fn long_names_fall_back_to_hash_prefix() {
        let long = "a".repeat(80);
        let f = named_function(&long, "");
        let name = pipeline_name(&f);
        assert!(name.len() <= MAX_NAME_LENGTH, "{} chars", name.len());
        assert!(name.ends_with("-pack-upload"));
        let prefix = name.strip_suffix("-pack-upload").unwrap();
        assert_eq!(prefix.len(), 8);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(name, pipeline_name(&f));
    }

    #[test]
    fn hash_prefix_differs_per_function() {
        let a = named_function(&"a".repeat(80), "");
        let b = named_function(&"b".repeat(80), "");
        assert_ne!(pipeline_name(&a), pipeline_name(&b));
    }

    #[test]
    fn docker_hub_secret_uses_conventional_key() {
        let creds = Credentials::new("alice", "pw");
        let json = docker_config_json("docker.io", &creds);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["auths"][DEFAULT_DOCKER_AUTH_KEY].is_object());

        let json = docker_config_json("ghcr.io", &creds);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["auths"]["ghcr.io"].is_object());
    }
}
