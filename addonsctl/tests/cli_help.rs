use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn help_text(args: &[&str]) -> String {
    let mut cmd = cargo_bin_cmd!("addonsctl");
    let output = cmd
        .args(args)
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8_lossy(&output).into_owned()
}

#[test]
fn top_level_help_lists_commands() {
    let text = help_text(&[]);
    for command in ["pools", "services", "wait", "validate", "suite", "status"] {
        assert!(text.contains(command), "help missing {command}");
    }
}

#[test]
fn pools_add_help_mentions_devices_and_sizes() {
    let text = help_text(&["pools", "add"]);
    assert!(text.contains("--device"), "pools add help missing --device");
    assert!(text.contains("--size"), "pools add help missing --size");
    assert!(text.contains("--node"), "pools add help missing --node");
}

#[test]
fn pools_remove_help_mentions_force_and_purge() {
    let text = help_text(&["pools", "remove"]);
    assert!(text.contains("--force"));
    assert!(text.contains("--purge"));
}

#[test]
fn wait_output_help_documents_budget() {
    let text = help_text(&["wait", "output"]);
    assert!(text.contains("--attempts"), "wait output help missing --attempts");
    assert!(text.contains("--interval"), "wait output help missing --interval");
    assert!(text.contains("--timeout"), "wait output help missing --timeout");
    assert!(text.contains("--contains"));
}

#[test]
fn services_subcommands_present() {
    let text = help_text(&["services"]);
    assert!(text.contains("stop"), "services help missing stop");
    assert!(text.contains("start"), "services help missing start");
}

#[test]
fn unknown_validator_is_rejected() {
    cargo_bin_cmd!("addonsctl")
        .args(["validate", "no-such-addon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown validator"));
}

#[test]
fn unknown_scenario_is_rejected() {
    cargo_bin_cmd!("addonsctl")
        .args(["suite", "not_a_scenario"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown scenario"));
}

#[test]
fn wait_output_requires_kubectl_args() {
    cargo_bin_cmd!("addonsctl")
        .args(["wait", "output", "--contains", "Bound"])
        .assert()
        .failure();
}

#[test]
fn malformed_config_file_fails_before_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("addons.toml");
    std::fs::write(&path, "no_such_key = 1\n").expect("write config");
    cargo_bin_cmd!("addonsctl")
        .arg("--config")
        .arg(&path)
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load configuration"));
}

/// Config file pointing the cluster CLI and snapctl at `kubectl`/`snapctl`.
fn config_with(dir: &std::path::Path, kubectl: &str, snapctl: &str) -> std::path::PathBuf {
    let path = dir.join("addons.toml");
    let body = format!("kubectl = {kubectl:?}\nsnapctl = {snapctl:?}\nnode_name = \"node-1\"\n");
    std::fs::write(&path, body).expect("write config");
    path
}

#[test]
fn missing_pool_prints_nothing_to_do() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with(dir.path(), "false", "false");
    cargo_bin_cmd!("addonsctl")
        .env_remove("ADDONS_KUBECTL")
        .arg("--config")
        .arg(&config)
        .args(["pools", "remove", "pool-node-1-sdb"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Nothing to do"));
}

#[cfg(unix)]
#[test]
fn busy_pool_spec_is_printed_before_refusal() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let kubectl = dir.path().join("kubectl");
    let busy = r#"{"spec":{"node":"node-1","disks":["/dev/sdb"]},"status":{"used":4096}}"#;
    std::fs::write(&kubectl, format!("#!/bin/sh\necho '{busy}'\n")).expect("write fake kubectl");
    std::fs::set_permissions(&kubectl, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake kubectl");
    let config = config_with(dir.path(), &kubectl.display().to_string(), "false");

    cargo_bin_cmd!("addonsctl")
        .env_remove("ADDONS_KUBECTL")
        .arg("--config")
        .arg(&config)
        .args(["pools", "remove", "pool-node-1-sdb"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("/dev/sdb"))
        .stderr(predicate::str::contains("is in use"));
}

#[test]
fn exhausted_wait_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with(dir.path(), "true", "false");
    cargo_bin_cmd!("addonsctl")
        .env_remove("ADDONS_KUBECTL")
        .arg("--config")
        .arg(&config)
        .args(["wait", "output", "--contains", "Bound", "--attempts", "1"])
        .args(["--interval", "10ms", "--", "get", "pvc"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("gave up waiting"));
}

#[test]
fn failed_service_stop_exits_four_or_asks_for_sudo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with(dir.path(), "false", "false");
    let output = cargo_bin_cmd!("addonsctl")
        .env_remove("ADDONS_SNAPCTL")
        .arg("--config")
        .arg(&config)
        .args(["services", "stop"])
        .output()
        .expect("run addonsctl");
    let stderr = String::from_utf8_lossy(&output.stderr);
    match output.status.code() {
        // running as root: snapctl itself fails
        Some(4) => assert!(stderr.contains("failed to stop service"), "{stderr}"),
        Some(1) => {
            assert!(stderr.contains("Elevated permissions are needed"), "{stderr}");
            assert!(stderr.contains("using 'sudo'"), "{stderr}");
        }
        other => panic!("unexpected exit {other:?}: {stderr}"),
    }
}
