//! End-to-end tests for the `tweave` binary.
//!
//! Each test runs against its own data directory; nothing touches the
//! user's home.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tweave(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tweave").unwrap();
    cmd.env("HOME", dir.path())
        .env("NO_COLOR", "1")
        .env("TWEAVE_BACKUP_PASSPHRASE", "cli-tests")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .arg("--config")
        .arg(dir.path().join("config.toml"));
    cmd
}

const RECIPE: &str = r#"
name = "summaries"
version = "1.2"

[[steps]]
name = "summarize"
type = "tool"
tool = "summarizer"
memory = { read = ["working:notes/{item}"], write = ["working:summary/{item}"] }

[[steps]]
name = "review"
type = "checkpoint"
after = ["summarize"]

[[steps]]
name = "archive"
type = "archive"
after = ["review"]
memory = { read = ["working:summary/{item}"] }
"#;

#[test]
fn test_put_then_get_across_invocations() {
    let dir = TempDir::new().unwrap();

    tweave(&dir)
        .args(["put", "acme/research/notes", "p1", r#"{"quote": "pricing is confusing"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Revision: 1"));

    tweave(&dir)
        .args(["put", "acme/research/notes", "p1", r#"{"quote": "setup was fast"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Revision: 2"));

    tweave(&dir)
        .args(["get", "acme/research/notes", "p1", "--meta"])
        .assert()
        .success()
        .stdout(predicate::str::contains("setup was fast"))
        .stdout(predicate::str::contains("Revision: 2"));

    tweave(&dir)
        .args(["history", "acme/research/notes", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rev 1"))
        .stdout(predicate::str::contains("rev 2"));
}

#[test]
fn test_get_missing_key_fails() {
    let dir = TempDir::new().unwrap();
    tweave(&dir)
        .args(["get", "acme/research/notes", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Key not found"));
}

#[test]
fn test_bad_namespace_is_rejected() {
    let dir = TempDir::new().unwrap();
    tweave(&dir)
        .args(["put", "acme/research", "p1", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("project/context_type/memory_type"));

    tweave(&dir)
        .args(["put", "acme/rese arch/notes", "p1", "1"])
        .assert()
        .failure();
}

#[test]
fn test_promote_moves_key_between_tiers() {
    let dir = TempDir::new().unwrap();
    tweave(&dir)
        .args(["put", "acme/research/notes", "p1", "\"keep\""])
        .assert()
        .success();
    tweave(&dir)
        .args(["promote", "acme/research/notes", "p1"])
        .assert()
        .success();

    tweave(&dir)
        .args(["list", "acme/research/notes", "--tier", "long_term"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));
    tweave(&dir)
        .args(["get", "acme/research/notes", "p1"])
        .assert()
        .failure();
}

#[test]
fn test_recipe_validate_prints_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("summaries.toml");
    std::fs::write(&path, RECIPE).unwrap();

    tweave(&dir)
        .args(["recipe", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("summaries@1.2"))
        .stdout(predicate::str::contains("1. summarize"))
        .stdout(predicate::str::contains("3. archive"))
        .stdout(predicate::str::contains("notes/{item}"));
}

#[test]
fn test_recipe_validate_rejects_cycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("loop.toml");
    std::fs::write(
        &path,
        r#"
name = "loop"
version = "1"

[[steps]]
name = "a"
type = "tool"
tool = "noop"
after = ["b"]

[[steps]]
name = "b"
type = "tool"
tool = "noop"
after = ["a"]
"#,
    )
    .unwrap();

    tweave(&dir)
        .args(["recipe", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_snapshot_and_check() {
    let dir = TempDir::new().unwrap();
    tweave(&dir)
        .args(["put", "acme/research/notes", "p1", "{\"n\": 1}"])
        .assert()
        .success();

    tweave(&dir)
        .args(["snapshot", "acme/research/notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Records: 1"));

    tweave(&dir)
        .arg("backups")
        .assert()
        .success()
        .stdout(predicate::str::contains("Snapshots:"));

    tweave(&dir)
        .args(["check", "acme/research/notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CONSISTENT"));
}

#[test]
fn test_unknown_config_key_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[cache]\nmax_bytes = 1024\nbogus = 1\n").unwrap();
    tweave(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}
