//! Build scaffolding for runtimes that need a generated entrypoint.
//!
//! Go sources are a plain module exposing `Handle`; the buildpacks
//! lifecycle needs a `main` package to compile. The scaffolding tree is
//! embedded in the binary and materialized under `.func/builds/last`
//! before each build.

use std::path::{Path, PathBuf};

use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "scaffolding/"]
struct Assets;

/// Directory under the function root where generated build inputs live.
pub const LAST_BUILD_DIR: &str = ".func/builds/last";

/// Clear and re-materialize the Go scaffolding for the given invocation
/// style (`http` or `cloudevent`). Returns the scaffolding directory,
/// relative to the function root, for use as the build workdir.
pub fn write_go_scaffolding(root: &Path, invoke: &str) -> anyhow::Result<PathBuf> {
    let dest = root.join(LAST_BUILD_DIR);
    if dest.exists() {
        std::fs::remove_dir_all(&dest)
            .map_err(|e| anyhow::anyhow!("clearing {}: {}", dest.display(), e))?;
    }
    std::fs::create_dir_all(&dest)?;

    let prefix = format!("go/{invoke}/");
    let mut wrote = 0usize;
    for name in Assets::iter() {
        let Some(rel) = name.strip_prefix(&prefix) else {
            continue;
        };
        let asset = Assets::get(&name).expect("embedded asset listed but not present");
        let out = dest.join(rel);
        if let Some(dir) = out.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&out, asset.data.as_ref())?;
        wrote += 1;
    }
    if wrote == 0 {
        anyhow::bail!("no scaffolding for go functions with invoke '{invoke}'");
    }
    tracing::debug!(dir = %dest.display(), files = wrote, "scaffolding written");
    Ok(PathBuf::from(LAST_BUILD_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_scaffolding_is_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_go_scaffolding(dir.path(), "http").unwrap();
        assert_eq!(rel, PathBuf::from(LAST_BUILD_DIR));
        let main_go = dir.path().join(LAST_BUILD_DIR).join("main.go");
        let content = std::fs::read_to_string(main_go).unwrap();
        assert!(content.contains("http.HandlerFunc(f.Handle)"));
    }

    #[test]
    fn stale_scaffolding_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(LAST_BUILD_DIR).join("stale.go");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "package old").unwrap();

        write_go_scaffolding(dir.path(), "http").unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn unknown_invoke_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_go_scaffolding(dir.path(), "grpc").is_err());
    }
}
