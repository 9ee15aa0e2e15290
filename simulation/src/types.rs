//! Core types for the meshwright simulator
//!
//! Models a mesh of named peer processes joined by directed, lossy links.

use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;

/// Unique name of a node within a mesh
///
/// The name is also the identity the peer process presents on the wire
/// (`argv[1]`, and the sender field of `OUTPUT` lines), so it must not
/// contain the `:` separator or any whitespace.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(String);

impl NodeName {
    /// Create a node name, rejecting empty names and names that would break framing
    pub fn new(name: impl Into<String>) -> Result<Self, SimulationError> {
        let name = name.into();
        if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(SimulationError::InvalidNodeName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate `count` names `{prefix}0 .. {prefix}{count-1}`
    pub fn numbered(prefix: &str, count: usize) -> Result<Vec<Self>, SimulationError> {
        (0..count).map(|i| Self::new(format!("{prefix}{i}"))).collect()
    }
}

impl TryFrom<String> for NodeName {
    type Error = SimulationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0
    }
}

impl AsRef<str> for NodeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parameters of a directed link
///
/// Only `drop_probability` affects delivery. `bandwidth` and `latency` are
/// carried as declared configuration and reported by the topology, but
/// packets are neither delayed nor throttled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Declared bandwidth in bytes per second
    pub bandwidth: u64,
    /// Declared one-way latency
    #[serde(with = "millis")]
    pub latency: Duration,
    /// Probability in `[0, 1]` that a packet sent over the link is lost
    pub drop_probability: f64,
}

impl LinkParams {
    pub fn new(bandwidth: u64, latency: Duration, drop_probability: f64) -> Result<Self, SimulationError> {
        let params = Self {
            bandwidth,
            latency,
            drop_probability,
        };
        params.validate()?;
        Ok(params)
    }

    /// A link that never loses packets
    pub fn lossless() -> Self {
        Self::default()
    }

    /// Same declared bandwidth and latency as the default, with the given loss
    pub fn lossy(drop_probability: f64) -> Result<Self, SimulationError> {
        let base = Self::default();
        Self::new(base.bandwidth, base.latency, drop_probability)
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(SimulationError::InvalidDropProbability(self.drop_probability));
        }
        Ok(())
    }
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            bandwidth: 1_000_000,
            latency: Duration::from_millis(10),
            drop_probability: 0.0,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_validation() {
        assert!(NodeName::new("alice").is_ok());
        assert!(NodeName::new("").is_err());
        assert!(NodeName::new("a:b").is_err());
        assert!(NodeName::new("a b").is_err());
        assert!(NodeName::new("a\nb").is_err());
    }

    #[test]
    fn test_numbered_names() {
        let names = NodeName::numbered("n", 3).unwrap();
        let strs: Vec<&str> = names.iter().map(NodeName::as_str).collect();
        assert_eq!(strs, vec!["n0", "n1", "n2"]);
    }

    #[test]
    fn test_node_name_display() {
        let name = NodeName::new("sender").unwrap();
        assert_eq!(name.to_string(), "sender");
    }

    #[test]
    fn test_drop_probability_bounds() {
        assert!(LinkParams::lossy(0.0).is_ok());
        assert!(LinkParams::lossy(1.0).is_ok());
        assert!(LinkParams::lossy(-0.1).is_err());
        assert!(LinkParams::lossy(1.5).is_err());
        assert!(LinkParams::lossy(f64::NAN).is_err());
    }

    #[test]
    fn test_link_params_json_uses_millis() {
        let params = LinkParams::new(2048, Duration::from_millis(250), 0.25).unwrap();
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["latency"], 250);
        let back: LinkParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_node_name_deserialize_rejects_colon() {
        let result: Result<NodeName, _> = serde_json::from_str("\"bad:name\"");
        assert!(result.is_err());
    }
}
