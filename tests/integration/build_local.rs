//! Local build against a real engine. Requires a running Docker (or
//! compatible) daemon; run with `cargo test --features integration`.

use crate::common::{engine_available, TestFunction};
use fnforge::builders::TrustPolicy;
use fnforge::config;
use fnforge::docker::build::{build, BuildOptions};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn node_function_builds_into_the_daemon() {
    if !engine_available() {
        eprintln!("skipping: no container engine");
        return;
    }

    let fixture = TestFunction::node("build-itest");
    let mut f = config::load(fixture.path()).unwrap();
    f.build.image = "localhost:5000/build-itest:latest".to_string();

    let opts = BuildOptions {
        verbose: true,
        trust: TrustPolicy::default(),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    build(&cancel, &f, None, &opts).await.unwrap();

    let output = std::process::Command::new("docker")
        .args(["image", "inspect", "localhost:5000/build-itest:latest"])
        .output()
        .unwrap();
    assert!(output.status.success(), "built image not present");
}

#[tokio::test]
async fn cancellation_surfaces_cleanly() {
    if !engine_available() {
        eprintln!("skipping: no container engine");
        return;
    }

    let fixture = TestFunction::node("build-cancel-itest");
    let mut f = config::load(fixture.path()).unwrap();
    f.build.image = "localhost:5000/build-cancel-itest:latest".to_string();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = build(&cancel, &f, None, &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("cancel"), "{err}");
}
