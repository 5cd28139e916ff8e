//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Autonomous incident response and provisioning",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("inframedic"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_scan_subcommand_exists() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .args(["scan", "--help"])
        .assert()
        .success();
}

#[test]
fn test_provision_subcommand_exists() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .args(["provision", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--template"));
}

#[test]
fn test_incidents_subcommand_exists() {
    Command::cargo_bin("inframedic")
        .unwrap()
        .args(["incidents", "--help"])
        .assert()
        .success();
}
