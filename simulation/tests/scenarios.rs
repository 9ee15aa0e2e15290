//! End-to-end scenario runs against real peer processes
//!
//! The well-behaved runs use the `flood_peer` binary built with this
//! package. Misbehaving peers are small shell scripts, so the oracle and
//! timeout paths are exercised against real pipes as well.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use meshwright_simulation::*;

fn flood_peer() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_flood_peer"))
}

fn harness() -> Harness {
    meshwright_logging::init_testing();
    Harness::new(HarnessConfig::testing(flood_peer()))
}

// ----------------------------------------------------------------------------
// Scenarios with the reference peer
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_two_node_stream_delivers_in_order() {
    let outcome = ScenarioKind::TwoNode.run(&harness()).await.unwrap();
    assert_eq!(outcome, Outcome::Success);
}

#[tokio::test]
async fn test_lossy_full_mesh_converges() {
    let kind = ScenarioKind::LossyMesh {
        nodes: 5,
        loss: 0.5,
        packets: 10,
    };
    let outcome = kind.run(&harness()).await.unwrap();
    assert_eq!(outcome, Outcome::Success);
}

#[tokio::test]
async fn test_departure_waits_for_repair() {
    let mut scenario = DepartureRepair::new(3).unwrap();
    let outcome = harness().run(&mut scenario).await;
    assert_eq!(outcome, Outcome::Success);
    // o1 and o2 each had values 8 and 9 withheld and got them by NACK
    assert_eq!(scenario.repairs(), 4);
}

#[tokio::test]
async fn test_churn_replacement_catches_up() {
    let kind = ScenarioKind::Churn { nodes: 4, packets: 10 };
    let outcome = kind.run(&harness()).await.unwrap();
    assert_eq!(outcome, Outcome::Success);
}

#[tokio::test]
async fn test_missing_peer_binary_fails_setup() {
    meshwright_logging::init_testing();
    let harness = Harness::new(HarnessConfig::testing("/nonexistent/peer"));
    let outcome = ScenarioKind::TwoNode.run(&harness).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed(Failure::Setup(_))));
}

// ----------------------------------------------------------------------------
// Misbehaving peers
// ----------------------------------------------------------------------------

#[cfg(unix)]
fn script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("peer.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
async fn run_with(kind: ScenarioKind, body: &str, timeout_secs: u64) -> Outcome {
    meshwright_logging::init_testing();
    let dir = tempfile::tempdir().unwrap();
    let config = HarnessConfig {
        peer_binary: script(dir.path(), body),
        timeout_secs: Some(timeout_secs),
        teardown_grace_ms: 200,
        ..HarnessConfig::testing(flood_peer())
    };
    kind.run(&Harness::new(config)).await.unwrap()
}

#[cfg(unix)]
async fn run_two_node_with(body: &str, timeout_secs: u64) -> Outcome {
    run_with(ScenarioKind::TwoNode, body, timeout_secs).await
}

#[cfg(unix)]
#[tokio::test]
async fn test_gap_in_stream_fails_ordering() {
    // b announces a, then delivers 1 before 0
    let body = r#"if [ "$1" = "b" ]; then
  echo "NEWNODE:a"
  echo "OUTPUT:a:MQo="
fi
cat > /dev/null"#;
    let outcome = run_two_node_with(body, 5).await;
    assert_eq!(
        outcome,
        Outcome::Failed(Failure::Assertion(OracleError::OutOfOrder {
            receiver: NodeName::new("b").unwrap(),
            sender: NodeName::new("a").unwrap(),
            expected: 0,
            actual: 1,
        }))
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_output_from_unannounced_sender_fails_membership() {
    let body = r#"if [ "$1" = "b" ]; then
  echo "OUTPUT:a:MAo="
fi
cat > /dev/null"#;
    let outcome = run_two_node_with(body, 5).await;
    assert!(matches!(
        outcome,
        Outcome::Failed(Failure::Assertion(OracleError::UnknownSender { .. }))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unknown_output_is_ignored_until_timeout() {
    let body = r#"echo "HELLO there"
echo "BOGUS:123"
cat > /dev/null"#;
    let outcome = run_two_node_with(body, 1).await;
    assert!(matches!(
        outcome,
        Outcome::Failed(Failure::Timeout {
            scenario: "two-node",
            phase: ScenarioPhase::Streaming,
            ..
        })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_hung_peer_is_killed_at_teardown() {
    let started = Instant::now();
    let outcome = run_two_node_with("exec sleep 30", 1).await;
    assert!(matches!(outcome, Outcome::Failed(Failure::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[tokio::test]
async fn test_departure_reported_before_drain_fails() {
    // o0 reports another observer leaving (ignored), then the sender after
    // delivering only value 0
    let body = r#"if [ "$1" = "o0" ]; then
  echo "NEWNODE:sender"
  echo "OUTPUT:sender:MAo="
  echo "LEFTNODE:o1"
  echo "LEFTNODE:sender"
fi
cat > /dev/null"#;
    let outcome = run_with(ScenarioKind::Departure { observers: 3 }, body, 5).await;
    assert_eq!(
        outcome,
        Outcome::Failed(Failure::Assertion(OracleError::PrematureDeparture {
            observer: NodeName::new("o0").unwrap(),
            departed: NodeName::new("sender").unwrap(),
            expected: 1,
            required: 10,
        }))
    );
}
