mod common;

use assert_cmd::Command;
use common::TestFunction;
use predicates::prelude::*;

fn fnforge() -> Command {
    Command::cargo_bin("fnforge").unwrap()
}

#[test]
fn help_lists_subcommands() {
    fnforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("remove"));
}

#[test]
fn build_outside_a_function_fails_with_validation_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    fnforge()
        .args(["build", "--path"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("func.yaml"));
}

#[test]
fn build_without_registry_or_image_fails() {
    let fixture = TestFunction::new("name: greeter\nruntime: node\n");
    fnforge()
        .args(["build", "--path"])
        .arg(fixture.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no output image"));
}

#[test]
fn deploy_rejects_host_builder() {
    let fixture = TestFunction::new(
        "name: greeter\nruntime: node\nregistry: localhost:5000/test\nnamespace: default\nbuild:\n  builder: host\n",
    );
    fnforge()
        .args(["deploy", "--path"])
        .arg(fixture.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("host"));
}

#[test]
fn deploy_rejects_unknown_builder() {
    let fixture = TestFunction::new(
        "name: greeter\nruntime: node\nregistry: localhost:5000/test\nnamespace: default\nbuild:\n  builder: kaniko\n",
    );
    fnforge()
        .args(["deploy", "--path"])
        .arg(fixture.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown builder"));
}

#[test]
fn remove_requires_a_namespace() {
    let fixture = TestFunction::new("name: greeter\nruntime: node\n");
    fnforge()
        .args(["remove", "--path"])
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("namespace"));
}

#[test]
fn completions_render_for_bash() {
    fnforge()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fnforge"));
}
