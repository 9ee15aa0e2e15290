//! Error types for the simulator

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a mesh or driving peer processes
///
/// These are setup and plumbing errors. Assertion failures found by the
/// oracle live in [`crate::oracle::OracleError`]; malformed control lines
/// live in [`crate::protocol::ProtocolError`] and are never fatal.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Invalid node name {0:?}: must be non-empty without ':' or whitespace")]
    InvalidNodeName(String),

    #[error("Invalid drop probability {0}: must be within [0, 1]")]
    InvalidDropProbability(f64),

    #[error("Invalid {name} {value}: at least {minimum} required")]
    InvalidParameter {
        name: &'static str,
        value: usize,
        minimum: usize,
    },

    #[error("Input {index} at {interval_ms}ms intervals is beyond the schedule range")]
    ScheduleOverflow { index: u64, interval_ms: u64 },

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Failed to spawn peer {binary} for node {node}: {source}")]
    Spawn {
        node: String,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input pipe of node {0} is closed")]
    InputClosed(String),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SimulationError>;
