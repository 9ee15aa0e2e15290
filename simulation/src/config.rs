//! Harness configuration
//!
//! Precedence, lowest first: defaults, JSON file, `MESHWRIGHT_PEER`, CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// Environment variable naming the peer binary
pub const PEER_ENV: &str = "MESHWRIGHT_PEER";

/// Configuration shared by every scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Executable spawned for every node
    pub peer_binary: PathBuf,
    /// Seed for the loss model; entropy when absent
    pub seed: Option<u64>,
    /// How long a peer may take to exit after its input closes
    pub teardown_grace_ms: u64,
    /// Overrides each scenario's own timeout
    pub timeout_secs: Option<u64>,
    /// Scenario pacing
    pub timing: TimingConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            peer_binary: PathBuf::from("./peer"),
            seed: None,
            teardown_grace_ms: 2000,
            timeout_secs: None,
            timing: TimingConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Short timings for tests driving a local peer binary
    pub fn testing(peer_binary: impl Into<PathBuf>) -> Self {
        Self {
            peer_binary: peer_binary.into(),
            seed: Some(1),
            teardown_grace_ms: 1000,
            timeout_secs: Some(20),
            timing: TimingConfig {
                join_delay_ms: 200,
                push_interval_ms: 20,
                leave_delay_ms: 100,
            },
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SimulationError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SimulationError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MESHWRIGHT_PEER` if set
    pub fn with_env(mut self) -> Self {
        if let Some(peer) = std::env::var_os(PEER_ENV) {
            self.peer_binary = PathBuf::from(peer);
        }
        self
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// The configured override, or the scenario's own budget
    pub fn timeout_or(&self, scenario_default: Duration) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(scenario_default)
    }
}

/// Delays used to pace scenario input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait between spawning the nodes and the first input
    pub join_delay_ms: u64,
    /// Wait between successive inputs
    pub push_interval_ms: u64,
    /// Wait between the last input and a graceful leave
    pub leave_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            join_delay_ms: 500,
            push_interval_ms: 100,
            leave_delay_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    pub fn leave_delay(&self) -> Duration {
        Duration::from_millis(self.leave_delay_ms)
    }

    /// Offset of the `index`-th input from scenario start
    pub fn push_at(&self, index: u64) -> Result<Duration> {
        index
            .checked_mul(self.push_interval_ms)
            .and_then(|ms| ms.checked_add(self.join_delay_ms))
            .map(Duration::from_millis)
            .ok_or(SimulationError::ScheduleOverflow {
                index,
                interval_ms: self.push_interval_ms,
            })
    }
}
