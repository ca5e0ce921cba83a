//! Parsing of engine-exported image archives (`docker save` format).
//!
//! The direct push path loads image bytes from the daemon and re-publishes
//! them over the wire; this module turns the save stream into the config
//! blob and layer tars the distribution client needs.

use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SavedManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// An image lifted out of a save archive: raw config JSON plus layer tars
/// in manifest order.
#[derive(Debug)]
pub struct SavedImage {
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("save archive has no manifest.json")]
    MissingManifest,
    #[error("save archive is empty")]
    Empty,
    #[error("save archive references missing entry '{0}'")]
    MissingEntry(String),
    #[error("decoding manifest.json: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse a `docker save` stream. Only the first manifest entry is used;
/// the engine emits one per saved reference.
pub fn parse_save_archive<R: Read>(reader: R) -> Result<SavedImage, ArchiveError> {
    let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.display().to_string();
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        entries.insert(name, buf);
    }

    let manifest_bytes = entries
        .get("manifest.json")
        .ok_or(ArchiveError::MissingManifest)?;
    let manifest: Vec<SavedManifestEntry> = serde_json::from_slice(manifest_bytes)?;
    let first = manifest.into_iter().next().ok_or(ArchiveError::Empty)?;

    let config = entries
        .get(&first.config)
        .ok_or_else(|| ArchiveError::MissingEntry(first.config.clone()))?
        .clone();
    let mut layers = Vec::with_capacity(first.layers.len());
    for layer in &first.layers {
        layers.push(
            entries
                .get(layer)
                .ok_or_else(|| ArchiveError::MissingEntry(layer.clone()))?
                .clone(),
        );
    }

    Ok(SavedImage {
        config,
        layers,
        repo_tags: first.repo_tags.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(builder: &mut tar::Builder<&mut Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn sample_archive() -> Vec<u8> {
        let manifest = serde_json::json!([{
            "Config": "abc.json",
            "RepoTags": ["example.com/app:latest"],
            "Layers": ["layer1/layer.tar", "layer2/layer.tar"]
        }]);
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            append(&mut builder, "abc.json", br#"{"os":"linux"}"#);
            append(&mut builder, "layer1/layer.tar", b"layer-one");
            append(&mut builder, "layer2/layer.tar", b"layer-two");
            append(
                &mut builder,
                "manifest.json",
                manifest.to_string().as_bytes(),
            );
            builder.finish().unwrap();
        }
        buf
    }

    #[test]
    fn parses_config_and_layers_in_order() {
        let image = parse_save_archive(sample_archive().as_slice()).unwrap();
        assert_eq!(image.config, br#"{"os":"linux"}"#);
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0], b"layer-one");
        assert_eq!(image.layers[1], b"layer-two");
        assert_eq!(image.repo_tags, vec!["example.com/app:latest"]);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            append(&mut builder, "stray.json", b"{}");
            builder.finish().unwrap();
        }
        let err = parse_save_archive(buf.as_slice()).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingManifest), "{err}");
    }

    #[test]
    fn missing_layer_is_an_error() {
        let manifest = serde_json::json!([{
            "Config": "abc.json",
            "RepoTags": [],
            "Layers": ["gone/layer.tar"]
        }]);
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            append(&mut builder, "abc.json", b"{}");
            append(
                &mut builder,
                "manifest.json",
                manifest.to_string().as_bytes(),
            );
            builder.finish().unwrap();
        }
        let err = parse_save_archive(buf.as_slice()).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingEntry(_)), "{err}");
    }
}
