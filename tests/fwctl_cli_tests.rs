//! Integration tests for the fwctl binary
//!
//! These tests verify the CLI commands work correctly

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a test fwctl command
fn fwctl() -> Command {
    let mut cmd = Command::cargo_bin("fwctl").unwrap();
    cmd.env_remove("FWCTL_LOG_DIR").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_command() {
    fwctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN firewall policy tool"));
}

#[test]
fn test_roles_lists_registry() {
    fwctl()
        .arg("roles")
        .assert()
        .success()
        .stdout(predicate::str::contains("Role registry v1"))
        .stdout(predicate::str::contains("block-all-outbound-ipv4"))
        .stdout(predicate::str::contains("473a2342-c1a7-4d30-b7cb-06ca4693c566"));
}

#[test]
fn test_roles_json() {
    let output = fwctl().args(["-o", "json", "roles"]).output().unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["version"], 1);
    let roles = value["roles"].as_array().unwrap();
    assert!(roles.iter().any(|r| r["name"] == "permit-vpn-relay"));
}

#[test]
fn test_plan_connecting() {
    fwctl()
        .args(["plan", "connecting", "--relay", "185.65.135.1:51820", "--protocol", "udp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("State connecting"))
        .stdout(predicate::str::contains("permit-vpn-relay"))
        .stdout(predicate::str::contains("restrict-dns-outbound-ipv4"));
}

#[test]
fn test_plan_json_without_lan() {
    let output = fwctl()
        .args(["-o", "json", "plan", "connected", "--tunnel", "wg0", "--no-lan"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let roles: Vec<&str> = value["filters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["role"].as_str().unwrap())
        .collect();
    assert!(roles.contains(&"permit-vpn-tunnel-outbound-ipv4"));
    assert!(roles.contains(&"restrict-dns-outbound-tunnel-ipv6"));
    assert!(!roles.iter().any(|r| r.starts_with("permit-lan")));
}

#[test]
fn test_plan_missing_relay_fails() {
    fwctl()
        .args(["plan", "connecting"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid parameters"));
}

#[test]
fn test_plan_rejects_unknown_state() {
    fwctl()
        .args(["plan", "online"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown state"));
}

#[test]
fn test_simulate_sequence() {
    fwctl()
        .args([
            "simulate", "blocked", "connecting", "connected", "connected",
            "--relay", "1.2.3.4", "--tunnel", "wg0",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("blocked -> connecting"))
        .stdout(predicate::str::contains("added: permit-vpn-relay"))
        .stdout(predicate::str::contains("removed: permit-vpn-relay"))
        .stdout(predicate::str::contains("connected -> connected: 0 added, 0 removed, 0 replaced"))
        .stdout(predicate::str::contains("Final state connected"));
}

#[test]
fn test_simulate_writes_log_file() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("sim.log");

    fwctl()
        .args(["simulate", "connecting", "--relay", "1.2.3.4", "--log-file"])
        .arg(&log)
        .assert()
        .success();

    let content = fs::read(&log).unwrap();
    let text = String::from_utf8_lossy(&content);
    assert!(text.contains("Firewall initialized"));
    assert!(text.contains("Transitioned from uninitialized to connecting"));
    assert!(text.contains("\r\n"));
}

#[test]
fn test_simulate_log_dir_from_env() {
    let dir = TempDir::new().unwrap();

    fwctl()
        .env("FWCTL_LOG_DIR", dir.path())
        .args(["simulate", "blocked", "--log"])
        .assert()
        .success();

    let content = fs::read_to_string(dir.path().join("firewall.log")).unwrap();
    assert!(content.contains("Transitioned from uninitialized to blocked"));
}

#[test]
fn test_config_file_policy_defaults() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fwctl.toml");
    fs::write(&config, "[policy]\nallow_lan = false\ndns_servers = [\"9.9.9.9\"]\n").unwrap();

    fwctl()
        .arg("--config")
        .arg(&config)
        .args(["plan", "connecting", "--relay", "1.2.3.4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("permit-dns-outbound-ipv4"))
        .stdout(predicate::str::contains("permit-lan-10-8").not());
}

#[test]
fn test_bad_config_file() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fwctl.toml");
    fs::write(&config, "[engine]\ncall_timeout_ms = \"soon\"\n").unwrap();

    fwctl()
        .arg("--config")
        .arg(&config)
        .arg("roles")
        .assert()
        .success();

    fwctl()
        .arg("--config")
        .arg(&config)
        .args(["plan", "blocked"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config"));
}
