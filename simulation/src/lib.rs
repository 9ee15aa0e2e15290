//! # meshwright
//!
//! A lossy mesh simulator and test harness for peer-to-peer protocols.
//!
//! ## Overview
//!
//! The protocol under test runs as external peer processes, one per node.
//! The harness spawns them, carries their packets over simulated links and
//! watches what each node delivers to its application:
//!
//! - **Links** are directed and lossy: each send is dropped independently
//!   with the link's drop probability
//! - **Mesh** owns the nodes and the adjacency, and fans packets out over
//!   every outgoing link of the sender
//! - **Node processes** talk to the harness over a line-based control
//!   protocol on stdin/stdout (see [`protocol`])
//! - **Oracle** checks per-sender ordering, membership and
//!   drain-before-departure on the delivered stream
//! - **Harness** runs one scenario at a time on a single event loop with a
//!   timeout, reporting success or the first failure
//!
//! ## Architecture
//!
//! - **Types** (`types.rs`): node names and link parameters
//! - **Topology** (`topology.rs`): links, mesh construction and routing
//! - **Protocol** (`protocol.rs`): control commands and line reassembly
//! - **Node** (`node.rs`): spawned peer processes and their I/O tasks
//! - **Oracle** (`oracle.rs`): delivery and departure checks
//! - **Harness** (`harness.rs`): the scenario trait and event loop
//! - **Scenarios** (`scenarios.rs`): the end-to-end scenarios
//! - **Peer** (`peer.rs`): the flooding reference peer used by the tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use meshwright_simulation::*;
//!
//! let harness = Harness::new(HarnessConfig::default().with_env());
//! let outcome = ScenarioKind::TwoNode.run(&harness).await?;
//! assert!(outcome.is_success());
//! ```

pub mod config;
pub mod error;
pub mod harness;
pub mod node;
pub mod oracle;
pub mod peer;
pub mod protocol;
pub mod scenarios;
pub mod topology;
pub mod types;

pub use config::{HarnessConfig, TimingConfig};
pub use error::{Result, SimulationError};
pub use harness::{Failure, Harness, Outcome, Scenario, ScenarioCtx, ScenarioPhase};
pub use node::{NodeEvent, NodeEventKind, NodeProcess};
pub use oracle::{DeliveryOracle, DepartureWatch, OracleError, StartAt};
pub use peer::{FloodPeer, Packet};
pub use protocol::{Command, LineBuffer, ProtocolError};
pub use scenarios::{ChurnReplacement, DepartureRepair, LossyFullMesh, ScenarioKind, Step, TwoNodeStream};
pub use topology::{DeliveryReport, Link, Mesh, PacketSink};
pub use types::{LinkParams, NodeName};
