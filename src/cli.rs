use clap::{Args, Parser, Subcommand};
use clap_complete::aot::Shell;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "fnforge",
    version,
    about = "Build, push, and deploy functions as OCI images"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path of the function root (defaults to the current directory)
    #[arg(short = 'p', long = "path", global = true)]
    pub path: Option<PathBuf>,

    /// Print detailed output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build the function into an OCI image
    Build {
        /// Registry for the resulting image, e.g. ghcr.io/alice
        #[arg(short, long)]
        registry: Option<String>,

        /// Builder image override for the pack builder
        #[arg(long)]
        builder_image: Option<String>,

        /// Push the image to the registry after building
        #[arg(long)]
        push: bool,

        /// Wrap the pushed image in a single-entry image index
        #[arg(long)]
        index: bool,
    },

    /// Deploy the function through an on-cluster pipeline
    Deploy {
        /// Registry for the resulting image, e.g. ghcr.io/alice
        #[arg(short, long)]
        registry: Option<String>,

        /// Target namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Build from this Git URL instead of uploading local sources
        #[arg(long)]
        git_url: Option<String>,

        /// Git revision to build
        #[arg(long)]
        git_revision: Option<String>,
    },

    /// Run the most recently built function image locally
    Run {
        /// Seconds to wait for the function to start listening
        #[arg(long, default_value_t = 60)]
        start_timeout: u64,

        /// Do not treat a clean (exit 0) container exit as an error
        #[arg(long)]
        allow_exit: bool,
    },

    /// Remove the function's resources from the cluster
    Remove {
        /// Target namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Configure pipelines-as-code for the function's Git repository
    Pac {
        /// Write .tekton templates next to the sources
        #[arg(long)]
        local: bool,

        /// Reconcile the on-cluster Repository and secret
        #[arg(long)]
        cluster: bool,

        /// Register the webhook with the Git provider
        #[arg(long)]
        remote: bool,

        /// Git provider type
        #[arg(long, default_value = "github")]
        provider: String,

        /// Personal access token for the provider
        #[arg(long, env = "GIT_PROVIDER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Webhook shared secret (generated when omitted)
        #[arg(long, hide_env_values = true)]
        webhook_secret: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}
