use std::path::Path;

use owo_colors::OwoColorize as _;

use crate::cluster::pipelines::PipelineRunner;
use crate::config;

pub async fn run(root: &Path, namespace: Option<String>) -> anyhow::Result<()> {
    let mut f = config::load(root)?;
    if let Some(namespace) = namespace {
        f.namespace = namespace;
    }

    let runner = PipelineRunner::default();
    runner.remove(&f).await?;
    println!("{} removed {}", "✓".green(), f.name);
    Ok(())
}
