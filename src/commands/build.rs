use std::path::Path;

use owo_colors::OwoColorize as _;
use tokio_util::sync::CancellationToken;

use crate::builders::TrustPolicy;
use crate::config::{self, FunctionError};
use crate::docker::build::{build, BuildOptions};
use crate::docker::client::{new_engine, DEFAULT_HOST};
use crate::docker::push::{DirectPush, EnginePush, Pusher};
use crate::registry::RegistryOptions;

pub struct BuildArgs {
    pub registry: Option<String>,
    pub builder_image: Option<String>,
    pub push: bool,
    pub index: bool,
    pub verbose: bool,
}

pub async fn run(cancel: &CancellationToken, root: &Path, args: BuildArgs) -> anyhow::Result<()> {
    let mut f = config::load(root)?;
    if let Some(registry) = args.registry {
        f.registry = registry;
    }
    if let Some(builder_image) = args.builder_image {
        f.build
            .builder_images
            .insert("pack".to_string(), builder_image);
    }

    let image = f.image_ref().ok_or(FunctionError::NoImage)?;
    f.build.image = image.clone();

    let opts = BuildOptions {
        verbose: args.verbose,
        trust: TrustPolicy::default(),
        ..Default::default()
    };
    build(cancel, &f, None, &opts).await?;
    config::save(&f)?;
    println!("{} built {image}", "✓".green());

    if args.push {
        let digest = push(cancel, &f, args.index).await?;
        println!("{} pushed {digest}", "✓".green());
    }
    Ok(())
}

async fn push(
    cancel: &CancellationToken,
    f: &config::Function,
    index: bool,
) -> anyhow::Result<String> {
    let chain = super::credential_chain();
    let creds = chain.resolve(&f.build.image).await?;

    let engine = new_engine(DEFAULT_HOST).await?;
    let pusher = Pusher::new(
        EnginePush { engine: &engine },
        DirectPush {
            engine: &engine,
            options: RegistryOptions::default(),
            progress: None,
        },
    )
    .wrap_in_index(index);
    let result = pusher.push(cancel, f, &creds).await;
    engine.close().await;
    result
}
