use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A function: a source tree plus the metadata describing how it is built,
/// pushed, and deployed. Persisted as `func.yaml` at the function root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Absolute path of the function root. Not persisted; set on load.
    #[serde(skip)]
    pub root: PathBuf,

    pub name: String,

    /// Language runtime, e.g. `node`, `go`, `python`, `quarkus`, `rust`.
    #[serde(default)]
    pub runtime: String,

    /// Invocation style. Only `http` is currently meaningful.
    #[serde(default = "default_invoke")]
    pub invoke: String,

    /// Default registry used to compute the image name when none is set,
    /// e.g. `ghcr.io/alice`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry: String,

    /// Fully qualified image reference the function deploys as. Computed
    /// from `name` + `registry` when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Target namespace. Takes precedence over `deploy.namespace`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default)]
    pub build: BuildSpec,

    #[serde(default)]
    pub deploy: DeploySpec,

    #[serde(default)]
    pub run: RunSpec,
}

fn default_invoke() -> String {
    "http".to_string()
}

impl Default for Function {
    fn default() -> Self {
        Function {
            root: PathBuf::new(),
            name: String::new(),
            runtime: String::new(),
            invoke: default_invoke(),
            registry: String::new(),
            image: String::new(),
            namespace: String::new(),
            build: BuildSpec::default(),
            deploy: DeploySpec::default(),
            run: RunSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build strategy: `pack`, `s2i`, or `host`.
    #[serde(default = "default_builder")]
    pub builder: String,

    /// Per-builder image overrides, keyed by builder name (`pack`, `s2i`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub builder_images: BTreeMap<String, String>,

    /// Buildpack overrides for the pack builder. Empty means the builder's
    /// own detection order applies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buildpacks: Vec<String>,

    /// Build-time environment. Values may reference the caller's
    /// environment with `{{ env:NAME }}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_envs: Vec<EnvVar>,

    /// The image reference produced by the most recent build.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "GitSpec::is_empty")]
    pub git: GitSpec,

    /// Size of the pipeline's source/cache volume, e.g. `512Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_size: Option<String>,

    /// Host bind mounts for the local build, as `src:dst` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
}

fn default_builder() -> String {
    "pack".to_string()
}

impl Default for BuildSpec {
    fn default() -> Self {
        BuildSpec {
            builder: default_builder(),
            builder_images: BTreeMap::new(),
            buildpacks: Vec::new(),
            build_envs: Vec::new(),
            image: String::new(),
            git: GitSpec::default(),
            pvc_size: None,
            mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySpec {
    /// The image reference most recently deployed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GitSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_dir: String,
}

impl GitSpec {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.revision.is_empty() && self.context_dir.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvVar {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Known builder names. `host` builds on the developer machine without a
/// container engine and is never valid on the cluster pathway.
pub const BUILDER_PACK: &str = "pack";
pub const BUILDER_S2I: &str = "s2i";
pub const BUILDER_HOST: &str = "host";

impl Function {
    /// The image reference this function should be built and deployed as:
    /// `image` when set, otherwise computed from `registry` and `name`.
    pub fn image_ref(&self) -> Option<String> {
        if !self.image.is_empty() {
            return Some(self.image.clone());
        }
        if self.registry.is_empty() || self.name.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}:latest",
            self.registry.trim_end_matches('/'),
            self.name
        ))
    }

    /// The namespace the cluster pathway targets: `namespace` when set,
    /// otherwise the namespace of the previous deploy.
    pub fn target_namespace(&self) -> Option<&str> {
        if !self.namespace.is_empty() {
            return Some(&self.namespace);
        }
        if !self.deploy.namespace.is_empty() {
            return Some(&self.deploy.namespace);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_prefers_explicit_image() {
        let f = Function {
            name: "greeter".into(),
            registry: "ghcr.io/alice".into(),
            image: "quay.io/alice/greeter:v2".into(),
            ..Default::default()
        };
        assert_eq!(f.image_ref().unwrap(), "quay.io/alice/greeter:v2");
    }

    #[test]
    fn image_ref_computed_from_registry() {
        let f = Function {
            name: "greeter".into(),
            registry: "ghcr.io/alice/".into(),
            ..Default::default()
        };
        assert_eq!(f.image_ref().unwrap(), "ghcr.io/alice/greeter:latest");
    }

    #[test]
    fn image_ref_requires_registry_or_image() {
        let f = Function {
            name: "greeter".into(),
            ..Default::default()
        };
        assert!(f.image_ref().is_none());
    }

    #[test]
    fn target_namespace_precedence() {
        let mut f = Function {
            deploy: DeploySpec {
                namespace: "prev".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(f.target_namespace(), Some("prev"));
        f.namespace = "next".into();
        assert_eq!(f.target_namespace(), Some("next"));
    }

    #[test]
    fn builder_defaults_to_pack() {
        let spec: BuildSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.builder, BUILDER_PACK);
    }
}
