pub mod interpolate;
pub mod model;

use std::path::{Path, PathBuf};

pub use model::{BuildSpec, DeploySpec, EnvVar, Function, GitSpec, RunSpec};

pub const FUNC_FILE: &str = "func.yaml";

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("{0} does not contain an initialized function (no func.yaml)")]
    NotInitialized(PathBuf),
    #[error("function has no name")]
    NameRequired,
    #[error("function has no output image; build it or set registry")]
    NoImage,
    #[error("function has no namespace")]
    NamespaceRequired,
}

/// Load a function from `root/func.yaml`, stamping the root onto the result.
pub fn load(root: &Path) -> anyhow::Result<Function> {
    let path = root.join(FUNC_FILE);
    if !path.exists() {
        return Err(FunctionError::NotInitialized(root.to_path_buf()).into());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    let mut f: Function = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))?;
    f.root = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    if f.name.is_empty() {
        return Err(FunctionError::NameRequired.into());
    }
    Ok(f)
}

/// Write the function back to `root/func.yaml`. The write goes through a
/// temp file in the same directory so a crash never truncates the manifest.
pub fn save(f: &Function) -> anyhow::Result<()> {
    let path = f.root.join(FUNC_FILE);
    let content = serde_yaml::to_string(f)?;
    let tmp = f.root.join(format!(".{FUNC_FILE}.tmp"));
    std::fs::write(&tmp, content)
        .map_err(|e| anyhow::anyhow!("writing {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| anyhow::anyhow!("replacing {}: {}", path.display(), e))?;
    Ok(())
}
