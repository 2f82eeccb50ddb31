use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;

// Minimal valid config: mock upload plus one sample uploader
fn write_valid_config(dir: &tempfile::TempDir) -> PathBuf {
    let toml = r#"
[upload]
enabled = true
mock = true
fridge = "TestFridge"

[logging]
level = "warn"

[[uploader]]
type = "sample"
interval_s = 0.2
fields = ["Field_1"]
"#;
    let path = dir.path().join("cryomon.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn write_config(dir: &tempfile::TempDir, toml: &str) -> PathBuf {
    let path = dir.path().join("cryomon.toml");
    fs::write(&path, toml).unwrap();
    path
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["check-config"], 0, "config ok", "stdout")]
#[case(&["check-config"], 0, "sample", "stdout")]
#[case(&["latest"], 0, "(main)", "stdout")]
#[case(&["frobnicate"], 2, "unrecognized subcommand", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();

    // Always include a valid config to avoid relying on the default path
    cmd.arg("--config").arg(&cfg);
    for a in args {
        cmd.arg(a);
    }

    let assert = cmd.assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
fn missing_config_file_exits_with_config_code() {
    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();
    cmd.arg("--config")
        .arg("/definitely/not/here/cryomon.toml")
        .arg("check-config");

    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("read config"));
}

#[rstest]
fn unset_fridge_fails_validation() {
    let dir = tempdir().unwrap();
    let cfg = write_config(
        &dir,
        r#"
[upload]
enabled = true
mock = true

[[uploader]]
type = "sample"
"#,
    );

    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();
    cmd.arg("--config").arg(&cfg).arg("check-config");

    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("upload.fridge"));
}

#[rstest]
fn run_refuses_when_uploads_disabled() {
    let dir = tempdir().unwrap();
    let cfg = write_config(
        &dir,
        r#"
[upload]
enabled = false
fridge = "TestFridge"

[[uploader]]
type = "sample"
"#,
    );

    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();
    cmd.arg("--config").arg(&cfg).arg("run");

    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("upload.enabled"));
}

#[rstest]
fn run_fails_fast_when_the_log_tree_is_missing() {
    let dir = tempdir().unwrap();
    let cfg = write_config(
        &dir,
        &format!(
            r#"
[upload]
enabled = true
mock = true
fridge = "TestFridge"

[[uploader]]
type = "bluefors"
log_dir = "{}"
"#,
            dir.path().join("missing").display()
        ),
    );

    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();
    cmd.arg("--config").arg(&cfg).arg("run");

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("log directory"));
}

#[rstest]
fn json_errors_are_machine_readable() {
    let dir = tempdir().unwrap();
    let cfg = write_config(
        &dir,
        &format!(
            r#"
[upload]
enabled = true
mock = true
fridge = "TestFridge"

[[uploader]]
type = "bluefors"
log_dir = "{}"
"#,
            dir.path().join("missing").display()
        ),
    );

    let mut cmd = Command::cargo_bin("cryomon_cli").unwrap();
    cmd.arg("--config").arg(&cfg).arg("--json").arg("run");

    let output = cmd.output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8(output.stderr).unwrap();
    let line = stderr
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .expect("no JSON line on stderr");
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(v["reason"], "Error");
    assert!(v["message"].as_str().unwrap().contains("log directory"));
}
