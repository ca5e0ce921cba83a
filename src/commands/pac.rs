use std::path::Path;

use owo_colors::OwoColorize as _;

use crate::cluster::pac::{configure, PacOptions, PacPrompts};
use crate::config::{self, FunctionError};

pub struct PacArgs {
    pub local: bool,
    pub cluster: bool,
    pub remote: bool,
    pub provider: String,
    pub token: Option<String>,
    pub webhook_secret: Option<String>,
}

pub async fn run(root: &Path, args: PacArgs) -> anyhow::Result<()> {
    let f = config::load(root)?;

    // No step flags means all of them.
    let all = !(args.local || args.cluster || args.remote);
    let opts = PacOptions {
        local: args.local || all,
        cluster: args.cluster || all,
        remote: args.remote || all,
        provider: args.provider,
        personal_access_token: args.token.unwrap_or_default(),
        webhook_secret: args.webhook_secret,
    };
    if (opts.cluster || opts.remote) && opts.personal_access_token.is_empty() {
        anyhow::bail!("a provider token is required (--token or GIT_PROVIDER_TOKEN)");
    }

    let creds = if opts.cluster {
        let image = f.image_ref().ok_or(FunctionError::NoImage)?;
        super::credential_chain().resolve(&image).await?
    } else {
        Default::default()
    };

    let prompts = PacPrompts {
        confirm_overwrite: Box::new(|path| {
            let answer = super::prompt_line(&format!(
                "{} exists; overwrite? [y/N] ",
                path.display()
            ))
            .unwrap_or_default();
            matches!(answer.as_str(), "y" | "Y" | "yes")
        }),
        controller_url: Box::new(|| {
            let url = super::prompt_line("Pipelines-as-code controller URL: ")?;
            if url.is_empty() {
                anyhow::bail!("a controller URL is required to register the webhook");
            }
            Ok(url)
        }),
    };

    configure(&f, &creds, &opts, &prompts).await?;
    println!("{} pipelines-as-code configured for {}", "✓".green(), f.name);
    Ok(())
}
