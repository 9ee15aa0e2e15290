//! Exit codes and output of the `meshwright` binary

use std::process::{Command, Output};

fn meshwright(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_meshwright"))
        .args(["--level", "error", "--peer", env!("CARGO_BIN_EXE_flood_peer")])
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_topology_prints_mesh_without_verdict() {
    let output = meshwright(&["topology", "--nodes", "3", "--loss", "0.25"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout.contains("Mesh Topology:"));
    assert!(!stdout.contains("SUCCESS"));
    assert!(!stdout.contains("FAILED"));
}

#[test]
fn test_topology_rejects_bad_loss() {
    let output = meshwright(&["topology", "--loss", "1.5"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_departure_without_observers_is_a_config_error() {
    let output = meshwright(&["departure", "--observers", "0"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(2));
    assert!(stdout.contains("FAILED: Invalid observers 0"));
}

#[test]
fn test_churn_with_two_nodes_is_a_config_error() {
    let output = meshwright(&["churn", "--nodes", "2"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_peer_is_a_config_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_meshwright"))
        .args(["--level", "error", "--peer", "/nonexistent/peer", "two-node"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
