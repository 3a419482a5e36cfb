//! Command-line contract tests for the tracecorr binary

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Fixture under the workspace `tests/fixtures` directory
fn fixture(rel: &str) -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .join("tests/fixtures")
        .join(rel)
}

/// The binary with the user's own config directory hidden
fn tracecorr(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("tracecorr").expect("binary is built");
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env("HOME", config_home)
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn inspect_lists_samples_and_inventory() {
    let home = tempdir().unwrap();
    tracecorr(home.path())
        .arg("inspect")
        .arg(fixture("har/sample.har"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Samples: 5"))
        .stdout(predicate::str::contains("Base URLs: https://api.example.test, https://cdn.example.test"))
        .stdout(predicate::str::contains("Extensions: .css, .png"));
}

#[test]
fn analyze_prints_correlations() {
    let home = tempdir().unwrap();
    tracecorr(home.path())
        .arg("analyze")
        .arg(fixture("recording/sample.jtl"))
        .assert()
        .success()
        .stdout(predicate::str::contains("session = sess-42  <- first #0 'Login'"))
        .stdout(predicate::str::contains("item = 5  (uncorrelated)"));
}

#[test]
fn analyze_json_respects_url_filter() {
    let home = tempdir().unwrap();
    let output = tracecorr(home.path())
        .args(["analyze", "--format", "json", "--url-filter", "shop.example.test/cart"])
        .arg(fixture("recording/sample.jtl"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = report["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["label"], "Add to cart");
}

#[test]
fn synthesize_writes_plan() {
    let home = tempdir().unwrap();
    let dir = tempdir().unwrap();
    let output = dir.path().join("plan.jmx");
    tracecorr(home.path())
        .arg("synthesize")
        .arg(fixture("har/sample.har"))
        .args(["--base-url", "https://api.example.test", "--no-extensions"])
        .args(["--group-by", "by-minute", "--threads", "4"])
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 requests"));

    let jmx = std::fs::read_to_string(&output).unwrap();
    assert!(jmx.contains("RegexExtractor"));
    assert!(jmx.contains("TransactionController"));
    assert!(jmx.contains("${token}"));
    assert!(!jmx.contains("cdn.example.test"));
}

#[test]
fn record_exports_har() {
    let home = tempdir().unwrap();
    let dir = tempdir().unwrap();
    let output = dir.path().join("recording.xml");
    tracecorr(home.path())
        .arg("record")
        .arg(fixture("har/sample.har"))
        .args(["--method", "POST", "-o"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 2 samples"));
    assert!(std::fs::read_to_string(&output).unwrap().contains("<httpSample"));
}

#[test]
fn config_file_supplies_input() {
    let home = tempdir().unwrap();
    let dir = tempdir().unwrap();
    let config = dir.path().join("tracecorr.toml");
    std::fs::write(
        &config,
        format!(
            "input = {:?}\nurl_filter = \"orders\"\n",
            fixture("collection/sample.postman_collection.json").display().to_string()
        ),
    )
    .unwrap();
    tracecorr(home.path())
        .arg("--config")
        .arg(&config)
        .arg("analyze")
        .assert()
        .success()
        .stdout(predicate::str::contains("token = tok-5150"))
        .stdout(predicate::str::contains("1 requests"));
}

#[test]
fn missing_input_fails() {
    let home = tempdir().unwrap();
    tracecorr(home.path())
        .args(["analyze", "does-not-exist.har"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to analyze capture"));
}

#[test]
fn delegate_requires_api_key() {
    let home = tempdir().unwrap();
    tracecorr(home.path())
        .env_remove("TRACECORR_COLLABORATOR_KEY")
        .arg("delegate")
        .arg(fixture("recording/sample.jtl"))
        .args(["-o", "unused.jmx"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("TRACECORR_COLLABORATOR_KEY"));
}
