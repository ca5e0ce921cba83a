use std::fmt;

/// A parsed image reference: `registry/repository[:tag][@digest]`.
///
/// Follows the engine's conventions: a first path component containing a
/// dot, a colon, or equal to `localhost` is a registry; otherwise the
/// reference is a Docker Hub short form and `library/` is implied for
/// bare names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

pub const DEFAULT_REGISTRY: &str = "docker.io";

impl Reference {
    pub fn parse(input: &str) -> anyhow::Result<Reference> {
        if input.is_empty() {
            anyhow::bail!("empty image reference");
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                if !digest.starts_with("sha256:") {
                    anyhow::bail!("unsupported digest in reference '{input}'");
                }
                (rest, Some(digest.to_string()))
            }
            None => (input, None),
        };

        let (registry, remainder) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder)
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest),
        };

        // The tag separator is a colon after the last slash.
        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
            _ => (remainder.to_string(), None),
        };
        if repository.is_empty() {
            anyhow::bail!("reference '{input}' has no repository");
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The manifest key to fetch or push: digest when present, else tag,
    /// else `latest`.
    pub fn identifier(&self) -> &str {
        if let Some(digest) = &self.digest {
            digest
        } else if let Some(tag) = &self.tag {
            tag
        } else {
            "latest"
        }
    }

    /// The registry host without a port.
    pub fn host(&self) -> &str {
        match self.registry.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.registry,
        }
    }

    /// Same reference pinned to a digest.
    pub fn with_digest(&self, digest: &str) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_reference() {
        let r = Reference::parse("ghcr.io/alice/greeter:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "alice/greeter");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.identifier(), "v1");
    }

    #[test]
    fn short_form_implies_docker_hub_library() {
        let r = Reference::parse("ubuntu:latest").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/ubuntu");
    }

    #[test]
    fn user_short_form_implies_docker_hub() {
        let r = Reference::parse("alice/greeter").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "alice/greeter");
        assert_eq!(r.identifier(), "latest");
    }

    #[test]
    fn registry_with_port() {
        let r = Reference::parse("localhost:5000/greeter").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.host(), "localhost");
    }

    #[test]
    fn digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = Reference::parse(&format!("quay.io/alice/greeter@{digest}")).unwrap();
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(r.identifier(), digest);
        assert_eq!(r.to_string(), format!("quay.io/alice/greeter@{digest}"));
    }

    #[test]
    fn display_round_trips() {
        for s in [
            "ghcr.io/alice/greeter:v1",
            "localhost:5000/greeter:latest",
            "docker.io/library/ubuntu:24.04",
        ] {
            assert_eq!(Reference::parse(s).unwrap().to_string(), s);
        }
    }
}
