//! Builder image selection and trust policy for the local build pathway.

use crate::config::model::{Function, BUILDER_PACK};

/// Paketo base builder: full-ish stack, suits interpreted runtimes.
pub const BUILDER_BASE: &str = "docker.io/paketobuildpacks/builder-jammy-base:latest";
/// Paketo tiny builder: static binaries only.
pub const BUILDER_TINY: &str = "docker.io/paketobuildpacks/builder-jammy-tiny:latest";

/// Lifecycle version the local build pins, so builds do not drift with the
/// builder image's floating lifecycle tag.
pub const LIFECYCLE_IMAGE: &str =
    "docker.io/buildpacksio/lifecycle@sha256:f48de2b0d9b521a10e1e96c3c4dbf8e0a07dd9b4eba7adbb71afa0aa6d1f8d1a";

/// Builder image prefixes that are trusted out of the box. A trusted
/// builder receives registry credentials during the lifecycle run.
pub const DEFAULT_TRUSTED_PREFIXES: &[&str] = &[
    "docker.io/paketobuildpacks",
    "ghcr.io/paketo-buildpacks",
    "ghcr.io/knative",
];

/// Default buildpack groups per runtime, applied when the function does not
/// override `build.buildpacks`. Runtimes absent here rely entirely on the
/// builder's own detection order.
pub const DEFAULT_BUILDPACKS: &[(&str, &[&str])] = &[
    ("go", &["docker.io/paketobuildpacks/go"]),
    ("quarkus", &["docker.io/paketobuildpacks/java"]),
];

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("runtime required to choose a builder image")]
    RuntimeRequired,
    #[error("no default builder image for runtime '{0}'")]
    UnsupportedRuntime(String),
}

/// Default builder image for a runtime.
pub fn default_builder_image(runtime: &str) -> Result<&'static str, BuilderError> {
    match runtime {
        "" => Err(BuilderError::RuntimeRequired),
        "node" | "nodejs" | "typescript" | "python" | "rust" | "springboot" => Ok(BUILDER_BASE),
        "go" | "quarkus" => Ok(BUILDER_TINY),
        other => Err(BuilderError::UnsupportedRuntime(other.to_string())),
    }
}

/// The builder image a function builds with: the function's configured
/// image for the selected builder when present, else the runtime default.
pub fn builder_image(f: &Function) -> Result<String, BuilderError> {
    if let Some(img) = f.build.builder_images.get(BUILDER_PACK) {
        if !img.is_empty() {
            return Ok(img.clone());
        }
    }
    default_builder_image(&f.runtime).map(str::to_string)
}

/// Buildpack overrides to pass to the lifecycle: the function's own list
/// when set, else the per-runtime defaults.
pub fn buildpacks(f: &Function) -> Vec<String> {
    if !f.build.buildpacks.is_empty() {
        return f.build.buildpacks.clone();
    }
    DEFAULT_BUILDPACKS
        .iter()
        .find(|(rt, _)| *rt == f.runtime)
        .map(|(_, bps)| bps.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

/// Trust policy for builder images: exact prefix match against an
/// allowlist, prefixes implicitly slash-terminated. Localhost registries
/// are always trusted.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    prefixes: Vec<String>,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::new(DEFAULT_TRUSTED_PREFIXES.iter().map(|s| s.to_string()))
    }
}

impl TrustPolicy {
    pub fn new(prefixes: impl IntoIterator<Item = String>) -> Self {
        TrustPolicy {
            prefixes: prefixes.into_iter().collect(),
        }
    }

    pub fn is_trusted(&self, image: &str) -> bool {
        if is_localhost_image(image) {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            image == prefix || image.starts_with(&format!("{prefix}/"))
        })
    }
}

fn is_localhost_image(image: &str) -> bool {
    let host = match image.split_once('/') {
        Some((host, _)) => host,
        None => return false,
    };
    // Strip an optional port; bracketed IPv6 keeps its brackets.
    let host = if let Some(rest) = host.strip_prefix('[') {
        match rest.split_once(']') {
            Some((addr, _)) => format!("[{addr}]"),
            None => return false,
        }
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Function;

    #[test]
    fn localhost_forms_always_trusted() {
        let policy = TrustPolicy::new(Vec::new());
        assert!(policy.is_trusted("localhost/foo"));
        assert!(policy.is_trusted("localhost:5000/foo"));
        assert!(policy.is_trusted("127.0.0.1:5000/foo"));
        assert!(policy.is_trusted("[::1]/foo"));
        assert!(policy.is_trusted("[::1]:5000/foo"));
    }

    #[test]
    fn prefix_match_is_slash_terminated() {
        let policy = TrustPolicy::default();
        assert!(policy.is_trusted("docker.io/paketobuildpacks/builder-jammy-base:latest"));
        assert!(!policy.is_trusted("docker.io/paketobuildpackshack"));
        assert!(!policy.is_trusted("docker.io/paketobuildpackshack/builder"));
    }

    #[test]
    fn trailing_slash_in_prefix_is_equivalent() {
        let with = TrustPolicy::new(vec!["example.com/builders/".to_string()]);
        let without = TrustPolicy::new(vec!["example.com/builders".to_string()]);
        for policy in [&with, &without] {
            assert!(policy.is_trusted("example.com/builders/base"));
            assert!(!policy.is_trusted("example.com/buildersx/base"));
        }
    }

    #[test]
    fn base_builder_runtimes() {
        for rt in ["node", "nodejs", "typescript", "python", "rust", "springboot"] {
            assert_eq!(default_builder_image(rt).unwrap(), BUILDER_BASE, "{rt}");
        }
    }

    #[test]
    fn tiny_builder_runtimes() {
        for rt in ["go", "quarkus"] {
            assert_eq!(default_builder_image(rt).unwrap(), BUILDER_TINY, "{rt}");
        }
    }

    #[test]
    fn missing_runtime_is_an_error() {
        assert!(matches!(
            default_builder_image(""),
            Err(BuilderError::RuntimeRequired)
        ));
    }

    #[test]
    fn unknown_runtime_names_the_runtime() {
        let err = default_builder_image("cobol").unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn function_override_wins() {
        let mut f = Function {
            runtime: "node".into(),
            ..Default::default()
        };
        f.build
            .builder_images
            .insert("pack".into(), "example.com/b".into());
        assert_eq!(builder_image(&f).unwrap(), "example.com/b");
    }

    #[test]
    fn buildpack_override_wins_over_defaults() {
        let mut f = Function {
            runtime: "go".into(),
            ..Default::default()
        };
        assert_eq!(buildpacks(&f), vec!["docker.io/paketobuildpacks/go"]);
        f.build.buildpacks = vec!["example.com/custom-bp".into()];
        assert_eq!(buildpacks(&f), vec!["example.com/custom-bp"]);
    }
}
