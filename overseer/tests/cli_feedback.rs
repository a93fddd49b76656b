//! CLI tests: spawn the overseer binary and check exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use overseer::exit_codes;

fn overseer(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_overseer"))
        .current_dir(dir)
        .env_remove("GITHUB_REPOSITORY")
        .env_remove("JULES_API_KEY")
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("run overseer")
}

#[test]
fn feedback_without_repository_identity_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = overseer(temp.path(), &["feedback", "--dry-run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("repository identity unknown"));
}

#[test]
fn malformed_repository_flag_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = overseer(temp.path(), &["feedback", "--dry-run", "--repo", "widgets"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn autofix_without_api_key_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = overseer(temp.path(), &["autofix", "7", "--repo", "octo/widgets"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("JULES_API_KEY"));
}

#[test]
fn repository_identity_falls_back_to_git_remote() {
    let temp = tempfile::tempdir().expect("tempdir");
    for args in [
        &["init", "--quiet"][..],
        &["remote", "add", "origin", "git@github.com:octo/widgets.git"][..],
    ] {
        let status = Command::new("git")
            .current_dir(temp.path())
            .args(args)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?}");
    }

    let output = overseer(temp.path(), &["autofix", "7"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr.contains("JULES_API_KEY"), "{stderr}");
    assert!(!stderr.contains("repository identity unknown"), "{stderr}");
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join(".overseer")).expect("mkdir");
    fs::write(
        temp.path().join(".overseer/config.toml"),
        "integration_branch = \"main\"\n",
    )
    .expect("write config");
    let output = overseer(temp.path(), &["state"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("integration_branch"));
}

#[test]
fn state_of_corrupted_file_prints_empty_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join(".overseer")).expect("mkdir");
    fs::write(temp.path().join(".overseer/cycle_state.json"), "{\"history\": [")
        .expect("write state");

    let output = overseer(temp.path(), &["state"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("state json");
    assert_eq!(printed, serde_json::json!({ "history": {}, "tracks": {} }));
}

#[test]
fn state_prints_migrated_legacy_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join(".overseer")).expect("mkdir");
    fs::write(
        temp.path().join(".overseer/cycle_state.json"),
        r#"[{"persona_id": "newer", "session_id": "s-2"}, {"persona_id": "older", "session_id": "s-1"}]"#,
    )
    .expect("write state");

    let output = overseer(temp.path(), &["state"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("state json");
    assert_eq!(printed["history"]["0"]["persona_id"], "older");
    assert_eq!(printed["history"]["1"]["session_id"], "s-2");
}
