//! Platform-aware image resolution.
//!
//! Resolves a reference plus a platform selector to a concrete ref: for a
//! multi-arch index, the matching child's digest reference; for a
//! single-arch image, the reference unchanged, accepted only when its
//! config matches the requested platform.

use std::fmt;
use std::str::FromStr;

use oci_spec::image::{ImageConfiguration, ImageIndex};

use crate::registry::{
    Reference, RegistryClient, RegistryError, DOCKER_MANIFEST_LIST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
};

/// Indexes declaring more manifests than this are rejected outright.
pub const MAX_INDEX_MANIFESTS: usize = 1000;

/// A requested platform: `os/arch` or `os/arch/variant`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSelector {
    pub os: String,
    pub arch: String,
    pub variant: Option<String>,
}

impl FromStr for PlatformSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next().map(str::to_string);
        if os.is_empty() || arch.is_empty() || parts.next().is_some() {
            anyhow::bail!("invalid platform '{s}'; expected os/arch[/variant]");
        }
        Ok(PlatformSelector {
            os: os.to_string(),
            arch: arch.to_string(),
            variant,
        })
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Resolve `reference` for `platform`.
pub async fn resolve(
    client: &RegistryClient,
    reference: &Reference,
    platform: &PlatformSelector,
) -> Result<Reference, RegistryError> {
    let (media_type, body) = client.get_manifest_raw(reference).await?;

    if media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE {
        let index: ImageIndex = serde_json::from_slice(&body)?;
        let digest = select_from_index(&index, platform).ok_or_else(|| {
            RegistryError::PlatformUnsupported {
                reference: reference.to_string(),
                platform: platform.to_string(),
            }
        })??;
        return Ok(reference.with_digest(&digest));
    }

    // Single-arch image: accept only when the config matches.
    let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&body)?;
    let config_bytes = client
        .get_blob(reference, &manifest.config().digest().to_string())
        .await?;
    let config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;
    if config_matches(&config, platform) {
        Ok(reference.clone())
    } else {
        Err(RegistryError::PlatformUnsupported {
            reference: reference.to_string(),
            platform: platform.to_string(),
        })
    }
}

/// Pick the digest of the first index child matching the platform.
/// Returns the outer `Err` when the index is oversized.
pub fn select_from_index(
    index: &ImageIndex,
    platform: &PlatformSelector,
) -> Option<Result<String, RegistryError>> {
    let manifests = index.manifests();
    if manifests.len() > MAX_INDEX_MANIFESTS {
        return Some(Err(RegistryError::IndexTooLarge(manifests.len())));
    }
    for descriptor in manifests {
        let Some(p) = descriptor.platform() else {
            continue;
        };
        if p.os().to_string() == platform.os && p.architecture().to_string() == platform.arch {
            if let Some(variant) = &platform.variant {
                if p.variant().as_deref() != Some(variant.as_str()) {
                    continue;
                }
            }
            return Some(Ok(descriptor.digest().to_string()));
        }
    }
    None
}

/// True when a single-arch image config matches the selector.
pub fn config_matches(config: &ImageConfiguration, platform: &PlatformSelector) -> bool {
    config.os().to_string() == platform.os && config.architecture().to_string() == platform.arch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_index(extra: usize) -> ImageIndex {
        let mut manifests = vec![
            json!({
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{}", "a".repeat(64)),
                "size": 1234,
                "platform": {"os": "linux", "architecture": "amd64"}
            }),
            json!({
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{}", "b".repeat(64)),
                "size": 1234,
                "platform": {"os": "linux", "architecture": "ppc64le"}
            }),
            json!({
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{}", "c".repeat(64)),
                "size": 1234,
                "platform": {"os": "linux", "architecture": "arm", "variant": "v7"}
            }),
        ];
        for i in 0..extra {
            manifests.push(json!({
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{:064x}", i),
                "size": 1,
                "platform": {"os": "linux", "architecture": "amd64"}
            }));
        }
        serde_json::from_value(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": manifests
        }))
        .unwrap()
    }

    #[test]
    fn selects_matching_child() {
        let index = sample_index(0);
        let platform: PlatformSelector = "linux/ppc64le".parse().unwrap();
        let digest = select_from_index(&index, &platform).unwrap().unwrap();
        assert_eq!(digest, format!("sha256:{}", "b".repeat(64)));
    }

    #[test]
    fn missing_platform_selects_nothing() {
        let index = sample_index(0);
        let platform: PlatformSelector = "windows/amd64".parse().unwrap();
        assert!(select_from_index(&index, &platform).is_none());
    }

    #[test]
    fn variant_must_match_when_requested() {
        let index = sample_index(0);
        let v7: PlatformSelector = "linux/arm/v7".parse().unwrap();
        let digest = select_from_index(&index, &v7).unwrap().unwrap();
        assert_eq!(digest, format!("sha256:{}", "c".repeat(64)));

        let v6: PlatformSelector = "linux/arm/v6".parse().unwrap();
        assert!(select_from_index(&index, &v6).is_none());
    }

    #[test]
    fn oversized_index_is_rejected() {
        let index = sample_index(MAX_INDEX_MANIFESTS);
        let platform: PlatformSelector = "linux/amd64".parse().unwrap();
        let err = select_from_index(&index, &platform).unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::IndexTooLarge(_)), "{err}");
    }

    #[test]
    fn config_match_compares_os_and_arch() {
        let config: ImageConfiguration = serde_json::from_value(json!({
            "os": "linux",
            "architecture": "ppc64le",
            "rootfs": {"type": "layers", "diff_ids": []},
            "config": {}
        }))
        .unwrap();
        assert!(config_matches(&config, &"linux/ppc64le".parse().unwrap()));
        assert!(!config_matches(&config, &"windows/amd64".parse().unwrap()));
    }

    #[test]
    fn platform_parse_rejects_garbage() {
        assert!("linux".parse::<PlatformSelector>().is_err());
        assert!("linux/amd64/v8/extra".parse::<PlatformSelector>().is_err());
    }
}
