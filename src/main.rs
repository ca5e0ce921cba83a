use clap::{CommandFactory, Parser};
use fnforge::cli::{Cli, Commands};
use fnforge::commands;
use fnforge::errors::classify;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Ctrl-C cancels the in-flight operation instead of killing it.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let root = commands::function_root(cli.global.path.clone());
    let verbose = cli.global.verbose;

    let result = match cli.command {
        Commands::Build {
            registry,
            builder_image,
            push,
            index,
        } => {
            commands::build::run(
                &cancel,
                &root,
                commands::build::BuildArgs {
                    registry,
                    builder_image,
                    push,
                    index,
                    verbose,
                },
            )
            .await
        }
        Commands::Deploy {
            registry,
            namespace,
            git_url,
            git_revision,
        } => {
            commands::deploy::run(
                &cancel,
                &root,
                commands::deploy::DeployArgs {
                    registry,
                    namespace,
                    git_url,
                    git_revision,
                    verbose,
                },
            )
            .await
        }
        Commands::Run {
            start_timeout,
            allow_exit,
        } => commands::run::run(&cancel, &root, start_timeout, allow_exit, verbose).await,
        Commands::Remove { namespace } => commands::remove::run(&root, namespace).await,
        Commands::Pac {
            local,
            cluster,
            remote,
            provider,
            token,
            webhook_secret,
        } => {
            commands::pac::run(
                &root,
                commands::pac::PacArgs {
                    local,
                    cluster,
                    remote,
                    provider,
                    token,
                    webhook_secret,
                },
            )
            .await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(classify(&e).exit_code());
    }
}
