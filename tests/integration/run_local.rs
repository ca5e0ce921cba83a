//! Local runner against a real engine, using a stock image standing in
//! for a built function.

use std::time::Duration;

use crate::common::{engine_available, TestFunction};
use fnforge::config;
use fnforge::docker::runner::{run, RunnerOptions};
use tokio_util::sync::CancellationToken;

const STAND_IN_IMAGE: &str = "docker.io/library/nginx:alpine";

fn pull(image: &str) -> bool {
    std::process::Command::new("docker")
        .args(["pull", image])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn run_serves_and_stops_cleanly() {
    if !engine_available() || !pull(STAND_IN_IMAGE) {
        eprintln!("skipping: no container engine");
        return;
    }

    let fixture = TestFunction::node("run-itest");
    let mut f = config::load(fixture.path()).unwrap();
    f.build.image = STAND_IN_IMAGE.to_string();

    let opts = RunnerOptions {
        start_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let running = run(&cancel, &f, &opts).await.unwrap();

    let url = format!("http://{}:{}/", running.host, running.port);
    let response = reqwest::get(&url).await.unwrap();
    assert!(response.status().is_success());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn premature_exit_reaches_the_error_channel() {
    if !engine_available() || !pull("docker.io/library/busybox:stable") {
        eprintln!("skipping: no container engine");
        return;
    }

    let fixture = TestFunction::node("exit-itest");
    let mut f = config::load(fixture.path()).unwrap();
    // A container that exits 0 immediately: still an error for a function.
    f.build.image = "docker.io/library/busybox:stable".to_string();

    let cancel = CancellationToken::new();
    let mut running = run(&cancel, &f, &RunnerOptions::default()).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(30), running.errors.recv())
        .await
        .expect("exit should be reported")
        .expect("channel open");
    assert!(err.to_string().contains("exited"), "{err}");

    running.stop().await.unwrap();
}
