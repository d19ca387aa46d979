//! Exercises the `possum` admin binary as a subprocess, the way a
//! developer would from a shell.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn put_then_get_round_trips_through_the_cli() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("possum")
        .unwrap()
        .args(["--dir", dir.path().to_str().unwrap(), "put", "greeting"])
        .write_stdin("hello from the cli")
        .assert()
        .success();

    Command::cargo_bin("possum")
        .unwrap()
        .args(["--dir", dir.path().to_str().unwrap(), "get", "greeting"])
        .assert()
        .success()
        .stdout("hello from the cli");
}

#[test]
fn get_on_a_missing_key_fails() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("possum")
        .unwrap()
        .args(["--dir", dir.path().to_str().unwrap(), "get", "nope"])
        .assert()
        .failure();
}

#[test]
fn list_reports_every_key_under_a_prefix() {
    let dir = tempfile::tempdir().unwrap();
    for (key, value) in [("p/1", "a"), ("p/2", "bb"), ("q/1", "c")] {
        Command::cargo_bin("possum")
            .unwrap()
            .args(["--dir", dir.path().to_str().unwrap(), "put", key])
            .write_stdin(value)
            .assert()
            .success();
    }

    Command::cargo_bin("possum")
        .unwrap()
        .args(["--dir", dir.path().to_str().unwrap(), "list", "p/"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p/1").and(predicate::str::contains("p/2")))
        .stdout(predicate::str::contains("q/1").not());
}
