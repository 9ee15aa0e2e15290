//! Mesh topology for meshwright
//!
//! The mesh owns every node and the directed adjacency of lossy links
//! between them. It is the single fan-out point for packets a node asks to
//! transmit:
//! - Directed links, parallel links allowed
//! - Duplex and full-mesh wiring helpers
//! - Independent loss decision per link per send

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::error::{Result, SimulationError};
use crate::types::{LinkParams, NodeName};

/// Something that can accept a simulated network packet
///
/// [`crate::node::NodeProcess`] forwards packets to its peer process; tests
/// use in-memory recorders.
pub trait PacketSink {
    fn name(&self) -> &NodeName;

    /// Deliver one packet. Must not block.
    fn recv_packet(&self, payload: &[u8]) -> Result<()>;
}

/// A directed, lossy channel to `target`
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub target: NodeName,
    pub params: LinkParams,
}

impl Link {
    /// Draw the loss decision for one send
    pub fn should_deliver<R: Rng>(&self, rng: &mut R) -> bool {
        rng.random::<f64>() > self.params.drop_probability
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Links the packet was offered to
    pub attempted: usize,
    /// Copies that survived the loss model and reached a node
    pub delivered: usize,
}

/// A mesh network topology
#[derive(Debug)]
pub struct Mesh<N> {
    /// All nodes in join order
    nodes: Vec<N>,
    /// Outgoing links per sender, in the order they were added
    adjacency: BTreeMap<NodeName, Vec<Link>>,
    rng: StdRng,
}

impl<N: PacketSink> Mesh<N> {
    /// Create an empty mesh with an entropy-seeded loss model
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_rng(&mut rand::rng()))
    }

    /// Create an empty mesh whose loss decisions are reproducible
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            nodes: Vec::new(),
            adjacency: BTreeMap::new(),
            rng,
        }
    }

    /// Register a node. Its links are wired separately.
    pub fn add_node(&mut self, node: N) -> Result<()> {
        if self.contains(node.name()) {
            return Err(SimulationError::DuplicateNode(node.name().to_string()));
        }
        debug!(node = %node.name(), "node added to mesh");
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a node and every link that starts or ends at it
    pub fn remove_node(&mut self, name: &NodeName) -> Option<N> {
        let index = self.nodes.iter().position(|n| n.name() == name)?;
        let node = self.nodes.remove(index);

        self.adjacency.remove(name);
        for links in self.adjacency.values_mut() {
            links.retain(|link| &link.target != name);
        }
        self.adjacency.retain(|_, links| !links.is_empty());

        debug!(node = %name, "node removed from mesh");
        Some(node)
    }

    /// Add a directed link from `from` to `to`
    ///
    /// Calling this twice for the same pair creates two parallel links.
    pub fn connect(&mut self, from: &NodeName, to: &NodeName, params: LinkParams) -> Result<()> {
        params.validate()?;
        for name in [from, to] {
            if !self.contains(name) {
                return Err(SimulationError::UnknownNode(name.to_string()));
            }
        }
        self.adjacency.entry(from.clone()).or_default().push(Link {
            target: to.clone(),
            params,
        });
        Ok(())
    }

    /// Add links in both directions with identical parameters
    pub fn connect_duplex(&mut self, a: &NodeName, b: &NodeName, params: LinkParams) -> Result<()> {
        self.connect(a, b, params)?;
        self.connect(b, a, params)
    }

    /// Replace all links with a full mesh over the nodes registered now
    ///
    /// Nodes added later are not wired in until this is called again.
    pub fn connect_full(&mut self, params: LinkParams) -> Result<()> {
        params.validate()?;

        let mut adjacency = BTreeMap::new();
        for from in &self.nodes {
            let links: Vec<Link> = self
                .nodes
                .iter()
                .filter(|to| to.name() != from.name())
                .map(|to| Link {
                    target: to.name().clone(),
                    params,
                })
                .collect();
            if !links.is_empty() {
                adjacency.insert(from.name().clone(), links);
            }
        }
        self.adjacency = adjacency;
        Ok(())
    }

    /// Offer `payload` to every outgoing link of `sender`
    pub fn send_packet(&mut self, sender: &NodeName, payload: &[u8]) -> DeliveryReport {
        self.send_packet_where(sender, payload, |_| true)
    }

    /// Offer `payload` only to the outgoing links whose target passes `filter`
    pub fn send_packet_where<F>(&mut self, sender: &NodeName, payload: &[u8], filter: F) -> DeliveryReport
    where
        F: Fn(&NodeName) -> bool,
    {
        let mut report = DeliveryReport::default();
        let Some(links) = self.adjacency.get(sender) else {
            trace!(sender = %sender, "no outgoing links");
            return report;
        };

        for link in links.iter().filter(|link| filter(&link.target)) {
            report.attempted += 1;
            if !link.should_deliver(&mut self.rng) {
                trace!(sender = %sender, target = %link.target, "packet dropped");
                continue;
            }
            let Some(target) = self.nodes.iter().find(|n| n.name() == &link.target) else {
                continue;
            };
            match target.recv_packet(payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => warn!(sender = %sender, target = %link.target, error = %e, "delivery failed"),
            }
        }
        report
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.nodes.iter().any(|n| n.name() == name)
    }

    pub fn node(&self, name: &NodeName) -> Option<&N> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn node_mut(&mut self, name: &NodeName) -> Option<&mut N> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    /// All nodes in join order
    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<NodeName> {
        self.nodes.iter().map(|n| n.name().clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Outgoing links of `name`, in the order they were added
    pub fn links_from(&self, name: &NodeName) -> &[Link] {
        self.adjacency.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Senders with at least one link targeting `name`
    pub fn links_to(&self, name: &NodeName) -> Vec<NodeName> {
        self.adjacency
            .iter()
            .filter(|(_, links)| links.iter().any(|link| &link.target == name))
            .map(|(from, _)| from.clone())
            .collect()
    }

    pub fn link_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Take every node out of the mesh, dropping all links
    pub fn drain_nodes(&mut self) -> Vec<N> {
        self.adjacency.clear();
        std::mem::take(&mut self.nodes)
    }

    /// Print a simple ASCII visualization of the mesh
    pub fn visualize(&self) -> String {
        let mut output = String::new();
        output.push_str("Mesh Topology:\n");
        output.push_str(&format!("  Nodes: {}\n", self.node_count()));
        output.push_str(&format!("  Links: {}\n\n", self.link_count()));

        for node in &self.nodes {
            let targets: Vec<String> = self
                .links_from(node.name())
                .iter()
                .map(|link| format!("{} (drop {:.2})", link.target, link.params.drop_probability))
                .collect();
            output.push_str(&format!("  {} -> [{}]\n", node.name(), targets.join(", ")));
        }
        output
    }
}

impl<N: PacketSink> Default for Mesh<N> {
    fn default() -> Self {
        Self::new()
    }
}
