//! A smoke test for the demonstration binary: run the toy task twice
//! against a real temp directory and check it reports RAN then UP-TO-DATE.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn run_then_skip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("store");
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    fs::create_dir_all(&input)?;
    fs::create_dir_all(&output)?;
    fs::write(input.join("a"), b"hello")?;
    fs::write(output.join("o"), b"X")?;

    Command::cargo_bin("taskstow-cli")?
        .arg("--store")
        .arg(&store)
        .arg("run")
        .arg(":demo:task")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("RAN"));

    Command::cargo_bin("taskstow-cli")?
        .arg("--store")
        .arg(&store)
        .arg("run")
        .arg(":demo:task")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("UP-TO-DATE"));

    Ok(())
}
