//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atlink");
    cmd.env_remove("ATLINK_PORT")
        .env_remove("ATLINK_BAUD")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("atlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("atlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_includes_usage_examples() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("atlink -p /dev/ttyUSB2 fota"));
}

// ============================================================================
// Exit codes
// ============================================================================

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn exit_code_two_for_script_and_profile_together() {
    let mut cmd = cli_cmd();
    cmd.args(["check", "session.toml", "--profile", "simcom-http"])
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_unknown_profile() {
    let mut cmd = cli_cmd();
    cmd.args(["check", "--profile", "no-such-profile"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("simcom-http"));
}

#[test]
fn exit_code_two_for_malformed_set() {
    let mut cmd = cli_cmd();
    cmd.args(["check", "--set", "novalue"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("name=value"));
}

#[test]
fn exit_code_two_when_no_port_is_given() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["fota", "--url", "http://example.com/fw.bin", "--file", "fw.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--port"));
}

#[test]
fn exit_code_three_for_invalid_script() {
    let dir = tempdir().expect("tempdir should be created");
    let script = dir
        .path()
        .join("broken.toml");
    fs::write(&script, "[[step]]\nname = \"x\"\naction = \"teleport\"\n").expect("write script");

    let mut cmd = cli_cmd();
    cmd.arg("check")
        .arg(&script)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("broken.toml"));
}

#[test]
fn exit_code_three_for_undefined_variable() {
    let mut cmd = cli_cmd();
    cmd.args(["check", "--profile", "simcom-http", "--set", "file=fw.bin"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("url"));
}

#[test]
fn exit_code_four_for_unavailable_port() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir
        .path()
        .join("ttyMISSING0");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .arg("-p")
        .arg(&missing)
        .args(["fota", "--url", "http://example.com/fw.bin", "--file", "fw.bin"])
        .assert()
        .code(4);
}

#[test]
fn exit_code_one_for_missing_script_file() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.arg("check")
        .arg(dir.path().join("does_not_exist.toml"))
        .assert()
        .code(1);
}

// ============================================================================
// check / profiles
// ============================================================================

#[test]
fn check_builtin_profile_succeeds() {
    let mut cmd = cli_cmd();
    cmd.args([
        "check",
        "--profile",
        "simcom-lfota",
        "--set",
        "url=http://example.com/fw.bin",
        "--set",
        "file=fw.bin",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("simcom-lfota"))
    .stdout(predicate::str::contains("monitor"));
}

#[test]
fn check_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args([
            "check",
            "--profile",
            "simcom-http",
            "--set",
            "url=http://example.com/fw.bin",
            "--set",
            "file=fw.bin",
            "--json",
        ])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be valid JSON");
    assert_eq!(json["name"], "simcom-http");
    let steps = json["steps"]
        .as_array()
        .expect("steps should be an array");
    assert!(steps
        .iter()
        .any(|step| step["action"] == "download"));
}

#[test]
fn check_user_script_with_config_vars() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("atlink.toml"),
        "[vars]\napn = \"internet\"\n",
    )
    .expect("write config");
    fs::write(
        dir.path()
            .join("apn.toml"),
        r#"
name = "apn"

[[step]]
name = "Set APN"
action = "command"
send = 'AT+CGDCONT=1,"IP","{apn}"'
"#,
    )
    .expect("write script");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["check", "apn.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set APN"));
}

#[test]
fn profiles_json_lists_builtins() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["profiles", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be valid JSON");
    let names: Vec<&str> = json
        .as_array()
        .expect("should be an array")
        .iter()
        .filter_map(|p| p["name"].as_str())
        .collect();
    assert!(names.contains(&"simcom-http"));
    assert!(names.contains(&"simcom-lfota"));
}

#[test]
fn invalid_config_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("atlink.toml"),
        "invalid toml [[[",
    )
    .expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("profiles")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn completions_command_writes_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_atlink"));
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .args(["check", "--profile", "simcom-http", "--set", "url=x", "--set", "file=y"])
        .output()
        .expect("command should execute");
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "Colors should be disabled in non-TTY mode");
}
