//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn cli_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("spotkeep");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("launch")
                .and(predicate::str::contains("stop"))
                .and(predicate::str::contains("terminate"))
                .and(predicate::str::contains("set-ip")),
        );
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("spotkeep");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn stop_rejects_feature_without_save() {
    let mut cmd = cargo_bin_cmd!("spotkeep");
    cmd.args(["stop", "dev", "--no-save", "--enable-feature", "ena"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
