//! CLI integration tests
//!
//! Exercises the tunwarden binary's argument surface and its failure
//! exit codes with assert_cmd. No engine is running in these tests, so
//! session commands must fail with a clear message and a nonzero exit.

use assert_cmd::Command;
use predicates::prelude::*;

fn tunwarden() -> Command {
    Command::cargo_bin("tunwarden")
        .expect("failed to locate tunwarden binary - ensure it's built before running tests")
}

/// An address nothing listens on, so commands fail fast instead of
/// touching a real engine.
const DEAD_ADDRESS: &str = "127.0.0.1:47999";

#[test]
fn help_names_the_binary() {
    tunwarden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("tunwarden"))
        .stdout(predicate::str::contains("VPN session orchestrator"));
}

#[test]
fn version_prints() {
    tunwarden()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tunwarden"));
}

#[test]
fn connect_help_documents_credentials() {
    tunwarden()
        .args(["connect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--username"))
        .stdout(predicate::str::contains("--password-file"));
}

#[test]
fn serve_help_documents_bind() {
    tunwarden()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn unknown_command_fails() {
    tunwarden()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn connect_without_target_fails() {
    tunwarden().arg("connect").assert().failure();
}

#[test]
fn connect_with_no_engine_fails_with_hint() {
    tunwarden()
        .args(["--address", DEAD_ADDRESS, "connect", "US"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Is it running"));
}

#[test]
fn disconnect_with_no_engine_fails_with_hint() {
    tunwarden()
        .args(["--address", DEAD_ADDRESS, "disconnect"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Is it running"));
}

#[test]
fn status_with_no_engine_fails() {
    tunwarden()
        .args(["--address", DEAD_ADDRESS, "status"])
        .assert()
        .failure();
}
