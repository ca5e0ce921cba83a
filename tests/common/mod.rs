#![allow(dead_code)]
use std::path::PathBuf;
use tempfile::TempDir;

/// A function root on disk with a `func.yaml` and a few source files.
pub struct TestFunction {
    pub dir: TempDir,
    pub func_path: PathBuf,
}

impl TestFunction {
    pub fn new(func_yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let func_path = dir.path().join("func.yaml");
        std::fs::write(&func_path, func_yaml).unwrap();
        Self { dir, func_path }
    }

    pub fn node(name: &str) -> Self {
        let fixture = Self::new(&format!(
            "name: {name}\nruntime: node\nregistry: localhost:5000/test\n"
        ));
        fixture.write(
            "index.js",
            "module.exports = async (context) => ({ statusCode: 200 });\n",
        );
        fixture.write(
            "package.json",
            "{\"name\": \"test-fn\", \"version\": \"0.0.1\"}\n",
        );
        fixture
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// True when a usable container engine answers on the default socket.
pub fn engine_available() -> bool {
    std::process::Command::new("docker")
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
