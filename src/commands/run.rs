use std::path::Path;
use std::time::Duration;

use owo_colors::OwoColorize as _;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::docker::runner::{run as run_function, RunnerOptions};

pub async fn run(
    cancel: &CancellationToken,
    root: &Path,
    start_timeout_secs: u64,
    allow_exit: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let f = config::load(root)?;

    let opts = RunnerOptions {
        verbose,
        error_on_clean_exit: !allow_exit,
        start_timeout: Duration::from_secs(start_timeout_secs),
    };
    let mut running = run_function(cancel, &f, &opts).await?;
    println!(
        "{} {} listening on http://{}:{}",
        "✓".green(),
        f.name,
        running.host,
        running.port
    );

    // Serve until interrupted or the function dies.
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        err = running.errors.recv() => match err {
            Some(e) => Err(anyhow::Error::new(e).context("function stopped unexpectedly")),
            None => Ok(()),
        },
    };

    running.stop().await?;
    outcome
}
