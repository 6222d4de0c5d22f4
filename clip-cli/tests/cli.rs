#![allow(deprecated)]
//! CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn clipsync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("clipsync").unwrap();
    cmd.arg("--data-dir").arg(dir.path()).env_remove("CLIPSYNC_RELAY");
    cmd
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("clipsync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pair"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("unpair"));
}

#[test]
fn init_then_status_shows_device() {
    let dir = TempDir::new().unwrap();

    clipsync(&dir)
        .args(["init", "--name", "Work Laptop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Device initialized successfully!"));
    assert!(dir.path().join("device.json").exists());

    clipsync(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Work Laptop"))
        .stdout(predicate::str::contains("Paired devices: NONE"));
}

#[test]
fn second_init_fails() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir).args(["init", "--name", "A"]).assert().success();

    clipsync(&dir)
        .args(["init", "--name", "B"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn status_before_init_explains() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("NOT INITIALIZED"));
}

#[test]
fn unpair_unknown_device_fails() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir).args(["init", "--name", "A"]).assert().success();

    clipsync(&dir)
        .args(["unpair", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No paired device"));
}

#[test]
fn join_rejects_garbage_code() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir).args(["init", "--name", "A"]).assert().success();

    clipsync(&dir)
        .args(["pair", "--join", "definitely-not-a-code"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid pairing code"));
}

#[test]
fn pair_requires_a_mode() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir).args(["init", "--name", "A"]).assert().success();

    clipsync(&dir)
        .arg("pair")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--show or --join"));
}

#[test]
fn send_without_peers_fails() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir).args(["init", "--name", "A"]).assert().success();

    clipsync(&dir)
        .args(["send", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No paired devices"));
}

#[test]
fn malformed_peer_argument_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    clipsync(&dir)
        .args(["send", "hello", "--peer", "no-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("DEVICE_ID=HOST:PORT"));
}
