use std::path::Path;

use owo_colors::OwoColorize as _;
use tokio_util::sync::CancellationToken;

use crate::cluster::pipelines::PipelineRunner;
use crate::config::{self, FunctionError};

pub struct DeployArgs {
    pub registry: Option<String>,
    pub namespace: Option<String>,
    pub git_url: Option<String>,
    pub git_revision: Option<String>,
    pub verbose: bool,
}

pub async fn run(cancel: &CancellationToken, root: &Path, args: DeployArgs) -> anyhow::Result<()> {
    let mut f = config::load(root)?;
    if let Some(registry) = args.registry {
        f.registry = registry;
    }
    if let Some(namespace) = args.namespace {
        f.namespace = namespace;
    }
    if let Some(url) = args.git_url {
        f.build.git.url = url;
    }
    if let Some(revision) = args.git_revision {
        f.build.git.revision = revision;
    }

    // Fail fast on validation problems before touching the registry.
    crate::cluster::templates::validate(&f)?;
    let image = f.image_ref().ok_or(FunctionError::NoImage)?;
    let chain = super::credential_chain();
    let creds = chain.resolve(&image).await?;

    let runner = PipelineRunner {
        verbose: args.verbose,
    };
    let (url, updated) = runner.run(cancel, &f, &creds).await?;
    config::save(&updated)?;
    println!("{} deployed {}", "✓".green(), updated.name);
    println!("{url}");
    Ok(())
}
