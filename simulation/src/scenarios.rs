//! End-to-end scenarios
//!
//! Each scenario builds its own mesh of peer processes, schedules input,
//! and checks the delivered stream with a [`DeliveryOracle`]. Values pushed
//! into nodes are decimal sequence numbers, one per input (`"7\n"`).

use std::collections::BTreeSet;
use std::time::Duration;

use derive_more::Display;
use tracing::{debug, info, warn};

use crate::error::{Result, SimulationError};
use crate::harness::{Harness, Outcome, Scenario, ScenarioCtx, ScenarioPhase};
use crate::oracle::{DeliveryOracle, DepartureWatch, OracleError, StartAt};
use crate::peer::Packet;
use crate::types::{LinkParams, NodeName};

/// Timer actions shared by all scenarios
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Push the next sequence value into a node
    Push { node: NodeName, value: u64 },
    /// Ask a node to leave gracefully
    Leave(NodeName),
    /// Kill a node and bring in its replacement
    Fail(NodeName),
}

/// Schedule `packets` pushes into `node`, paced by the configured timing
fn schedule_stream(ctx: &ScenarioCtx<Step>, node: &NodeName, packets: u64) -> Result<()> {
    let timing = ctx.config().timing.clone();
    for value in 0..packets {
        ctx.call_later(
            timing.push_at(value)?,
            Step::Push {
                node: node.clone(),
                value,
            },
        );
    }
    Ok(())
}

fn at_least(name: &'static str, value: usize, minimum: usize) -> Result<usize> {
    if value < minimum {
        return Err(SimulationError::InvalidParameter { name, value, minimum });
    }
    Ok(value)
}

fn push_value(ctx: &mut ScenarioCtx<Step>, node: &NodeName, value: u64) {
    ctx.set_phase(ScenarioPhase::Streaming);
    if let Err(e) = ctx.push_input(node, format!("{value}\n").as_bytes()) {
        ctx.fail(e);
    }
}

/// Run one delivery through the oracle; `None` if the run has failed
fn observe(
    oracle: &mut DeliveryOracle,
    ctx: &mut ScenarioCtx<Step>,
    receiver: &NodeName,
    sender: &NodeName,
    payload: &[u8],
) -> Option<u64> {
    let result = match ctx.mesh.node(receiver) {
        Some(node) => oracle.observe(receiver, node.peers(), sender, payload),
        None => return None,
    };
    ctx.check(result)
}

fn unexpected_step(scenario: &str, step: Step) {
    warn!(scenario, ?step, "step not used by this scenario");
}

/// Two nodes on a lossless duplex link; `a` streams ten values to `b`
pub struct TwoNodeStream {
    a: NodeName,
    b: NodeName,
    packets: u64,
    oracle: DeliveryOracle,
}

impl TwoNodeStream {
    pub fn new() -> Result<Self> {
        Ok(Self {
            a: NodeName::new("a")?,
            b: NodeName::new("b")?,
            packets: 10,
            oracle: DeliveryOracle::new(StartAt::Zero),
        })
    }
}

impl Scenario for TwoNodeStream {
    type Action = Step;

    fn name(&self) -> &'static str {
        "two-node"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn setup(&mut self, ctx: &mut ScenarioCtx<Step>) -> Result<()> {
        ctx.add_mesh_node(self.a.clone())?;
        ctx.add_mesh_node(self.b.clone())?;
        ctx.mesh.connect_duplex(&self.a, &self.b, LinkParams::lossless())?;
        schedule_stream(ctx, &self.a, self.packets)
    }

    fn on_timer(&mut self, ctx: &mut ScenarioCtx<Step>, action: Step) {
        match action {
            Step::Push { node, value } => push_value(ctx, &node, value),
            other => unexpected_step(self.name(), other),
        }
    }

    fn got_output(&mut self, ctx: &mut ScenarioCtx<Step>, receiver: &NodeName, sender: &NodeName, payload: &[u8]) {
        let Some(next) = observe(&mut self.oracle, ctx, receiver, sender, payload) else {
            return;
        };
        debug!(receiver = %receiver, sender = %sender, next, "delivered");
        if receiver == &self.b && sender == &self.a && next == self.packets {
            ctx.succeed();
        }
    }
}

/// Every node streams to every other node across a uniformly lossy full mesh
pub struct LossyFullMesh {
    nodes: Vec<NodeName>,
    params: LinkParams,
    packets: u64,
    oracle: DeliveryOracle,
    /// (receiver, sender) pairs that have delivered the full stream
    complete: usize,
}

impl LossyFullMesh {
    pub fn new(nodes: usize, drop_probability: f64, packets: u64) -> Result<Self> {
        Ok(Self {
            nodes: NodeName::numbered("n", nodes)?,
            params: LinkParams::lossy(drop_probability)?,
            packets,
            oracle: DeliveryOracle::new(StartAt::Zero),
            complete: 0,
        })
    }

    fn pairs(&self) -> usize {
        self.nodes.len() * self.nodes.len().saturating_sub(1)
    }
}

impl Scenario for LossyFullMesh {
    type Action = Step;

    fn name(&self) -> &'static str {
        "lossy-mesh"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn setup(&mut self, ctx: &mut ScenarioCtx<Step>) -> Result<()> {
        for node in &self.nodes {
            ctx.add_mesh_node(node.clone())?;
        }
        ctx.mesh.connect_full(self.params)?;
        for node in &self.nodes {
            schedule_stream(ctx, node, self.packets)?;
        }
        if self.pairs() == 0 || self.packets == 0 {
            ctx.succeed();
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ScenarioCtx<Step>, action: Step) {
        match action {
            Step::Push { node, value } => push_value(ctx, &node, value),
            other => unexpected_step(self.name(), other),
        }
    }

    fn got_output(&mut self, ctx: &mut ScenarioCtx<Step>, receiver: &NodeName, sender: &NodeName, payload: &[u8]) {
        let Some(next) = observe(&mut self.oracle, ctx, receiver, sender, payload) else {
            return;
        };
        if next == self.packets {
            self.complete += 1;
            info!(receiver = %receiver, sender = %sender, complete = self.complete, total = self.pairs(), "stream complete");
            if self.complete == self.pairs() {
                ctx.succeed();
            }
        }
    }
}

/// A sender leaves after its last packets were withheld from all but one
/// observer; the others only get them by asking for a repair, and every
/// observer must drain the stream before reporting the sender gone
///
/// Routing of the withheld values relies on the reference peer's packet
/// format ([`Packet`]). Any copy of a withheld value, relayed or not, reaches
/// an observer other than the first only after that observer has NACKed it.
pub struct DepartureRepair {
    sender: NodeName,
    observers: Vec<NodeName>,
    packets: u64,
    /// First value withheld from every observer but the first
    withhold_from: u64,
    /// (requester, value) pairs seen in a NACK
    requested: BTreeSet<(NodeName, u64)>,
    /// (observer, value) pairs delivered in answer to a NACK
    repaired: BTreeSet<(NodeName, u64)>,
    oracle: DeliveryOracle,
    watch: DepartureWatch,
}

impl DepartureRepair {
    /// `observers` besides the sender; at least two, so one can be repaired
    pub fn new(observers: usize) -> Result<Self> {
        let observers = at_least("observers", observers, 2)?;
        let sender = NodeName::new("sender")?;
        let packets = 10;
        Ok(Self {
            watch: DepartureWatch::new(sender.clone(), packets),
            sender,
            observers: NodeName::numbered("o", observers)?,
            packets,
            withhold_from: packets - 2,
            requested: BTreeSet::new(),
            repaired: BTreeSet::new(),
            oracle: DeliveryOracle::new(StartAt::Zero),
        })
    }

    /// Withheld values that reached an observer through repair
    pub fn repairs(&self) -> usize {
        self.repaired.len()
    }

    fn is_withheld(&self, origin: &NodeName, seq: u64) -> bool {
        origin == &self.sender && seq >= self.withhold_from
    }

    /// Offer a withheld value to the first observer and to whoever asked for it
    fn route_withheld(&mut self, ctx: &mut ScenarioCtx<Step>, from: &NodeName, payload: &[u8], seq: u64) {
        let first = &self.observers[0];
        ctx.mesh.send_packet_where(from, payload, |target| target == first);

        let requesters: Vec<NodeName> = self
            .requested
            .iter()
            .filter(|(requester, wanted)| *wanted == seq && requester != first && requester != from)
            .map(|(requester, _)| requester.clone())
            .collect();
        for requester in requesters {
            let report = ctx.mesh.send_packet_where(from, payload, |target| target == &requester);
            if report.delivered > 0 && self.repaired.insert((requester.clone(), seq)) {
                info!(observer = %requester, relay = %from, seq, "withheld value repaired");
            }
        }
    }
}

impl Scenario for DepartureRepair {
    type Action = Step;

    fn name(&self) -> &'static str {
        "departure"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    fn setup(&mut self, ctx: &mut ScenarioCtx<Step>) -> Result<()> {
        ctx.add_mesh_node(self.sender.clone())?;
        for observer in &self.observers {
            ctx.add_mesh_node(observer.clone())?;
        }
        ctx.mesh.connect_full(LinkParams::lossless())?;
        schedule_stream(ctx, &self.sender, self.packets)?;

        let timing = &ctx.config().timing;
        let leave_at = timing.push_at(self.packets - 1)? + timing.leave_delay();
        ctx.call_later(leave_at, Step::Leave(self.sender.clone()));
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ScenarioCtx<Step>, action: Step) {
        match action {
            Step::Push { node, value } => {
                if value == self.withhold_from {
                    info!(value, first = %self.observers[0], "withholding sender packets from all but one observer");
                }
                push_value(ctx, &node, value);
            }
            Step::Leave(node) => {
                ctx.set_phase(ScenarioPhase::Departing);
                if let Err(e) = ctx.disconnect(&node) {
                    ctx.fail(e);
                }
            }
            other => unexpected_step(self.name(), other),
        }
    }

    fn send_packet(&mut self, ctx: &mut ScenarioCtx<Step>, from: &NodeName, payload: &[u8]) {
        match Packet::decode(payload) {
            Ok(Packet::Data { origin, seq, .. }) if self.is_withheld(&origin, seq) => {
                self.route_withheld(ctx, from, payload, seq);
                return;
            }
            Ok(Packet::Nack {
                requester,
                origin,
                missing,
            }) => {
                for seq in missing {
                    if self.is_withheld(&origin, seq) && self.requested.insert((requester.clone(), seq)) {
                        debug!(requester = %requester, seq, "repair requested");
                    }
                }
            }
            _ => {}
        }
        ctx.mesh.send_packet(from, payload);
    }

    fn got_output(&mut self, ctx: &mut ScenarioCtx<Step>, receiver: &NodeName, sender: &NodeName, payload: &[u8]) {
        let Some(next) = observe(&mut self.oracle, ctx, receiver, sender, payload) else {
            return;
        };
        if sender == &self.sender && next == self.packets {
            let drained = self.watch.record_drained(receiver.clone());
            info!(observer = %receiver, drained, "observer drained sender");
        }
    }

    fn left_node(&mut self, ctx: &mut ScenarioCtx<Step>, node: &NodeName, peer: &NodeName) {
        if peer != self.watch.departing() {
            debug!(node = %node, peer = %peer, "ignoring departure of other peer");
            return;
        }
        let next = self.oracle.next_expected(node, peer);
        let Some(departed) = ctx.check(self.watch.record_departure(node, next)) else {
            return;
        };
        info!(observer = %node, departed, "observer saw sender leave");
        if !self.watch.is_settled(self.observers.len()) {
            return;
        }
        if self.repaired.is_empty() {
            ctx.fail(OracleError::RepairNotExercised {
                departed: self.sender.clone(),
            });
        } else {
            info!(repairs = self.repaired.len(), "every observer drained and saw the sender leave");
            ctx.succeed();
        }
    }

    fn node_disconnected(&mut self, ctx: &mut ScenarioCtx<Step>, node: &NodeName) {
        if node == &self.sender && ctx.mesh.contains(node) {
            ctx.set_phase(ScenarioPhase::Draining);
            if let Err(e) = ctx.remove_mesh_node(node) {
                ctx.fail(e);
            }
        }
    }
}

/// A relay fails mid-stream and a fresh node joins in its place
pub struct ChurnReplacement {
    origin: NodeName,
    members: Vec<NodeName>,
    victim: NodeName,
    replacement: NodeName,
    packets: u64,
    fail_at: u64,
    oracle: DeliveryOracle,
}

impl ChurnReplacement {
    /// `nodes` initial members including the origin; at least three
    pub fn new(nodes: usize, packets: u64) -> Result<Self> {
        let nodes = at_least("nodes", nodes, 3)?;
        let members = NodeName::numbered("n", nodes)?;
        Ok(Self {
            origin: members[0].clone(),
            victim: members[2].clone(),
            replacement: NodeName::new(format!("n{nodes}"))?,
            members,
            packets,
            fail_at: packets.saturating_sub(2),
            oracle: DeliveryOracle::new(StartAt::Zero),
        })
    }

    /// Every live node except the origin has the full stream
    fn all_delivered(&self, ctx: &ScenarioCtx<Step>) -> bool {
        ctx.mesh
            .node_names()
            .iter()
            .filter(|name| *name != &self.origin)
            .all(|name| self.oracle.has_reached(name, &self.origin, self.packets))
    }

    fn replace(&mut self, ctx: &mut ScenarioCtx<Step>, failed: &NodeName) -> Result<()> {
        ctx.remove_mesh_node(failed)?;
        self.oracle.forget_receiver(failed);

        if let Some(from) = ctx.mesh.links_to(failed).into_iter().next() {
            ctx.fail(OracleError::LeakedLink {
                removed: failed.clone(),
                from,
            });
            return Ok(());
        }

        let live = ctx.mesh.node_names();
        ctx.add_mesh_node(self.replacement.clone())?;
        self.oracle.start_receiver_at(self.replacement.clone(), StartAt::FirstObserved);
        for node in &live {
            ctx.mesh.connect_duplex(&self.replacement, node, LinkParams::lossless())?;
        }

        if let Some(from) = ctx.mesh.links_to(failed).into_iter().next() {
            ctx.fail(OracleError::LeakedLink {
                removed: failed.clone(),
                from,
            });
        }
        Ok(())
    }
}

impl Scenario for ChurnReplacement {
    type Action = Step;

    fn name(&self) -> &'static str {
        "churn"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn setup(&mut self, ctx: &mut ScenarioCtx<Step>) -> Result<()> {
        for node in &self.members {
            ctx.add_mesh_node(node.clone())?;
        }
        ctx.mesh.connect_full(LinkParams::lossless())?;
        schedule_stream(ctx, &self.origin, self.packets)?;

        let timing = &ctx.config().timing;
        let fail_at = timing.push_at(self.fail_at)? + timing.push_interval() / 2;
        ctx.call_later(fail_at, Step::Fail(self.victim.clone()));
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ScenarioCtx<Step>, action: Step) {
        match action {
            Step::Push { node, value } => push_value(ctx, &node, value),
            Step::Fail(node) => {
                info!(failed = %node, replacement = %self.replacement, "replacing node");
                if let Err(e) = self.replace(ctx, &node) {
                    ctx.fail(e);
                }
            }
            other => unexpected_step(self.name(), other),
        }
    }

    fn got_output(&mut self, ctx: &mut ScenarioCtx<Step>, receiver: &NodeName, sender: &NodeName, payload: &[u8]) {
        if observe(&mut self.oracle, ctx, receiver, sender, payload).is_none() {
            return;
        }
        if ctx.mesh.contains(&self.replacement) && self.all_delivered(ctx) {
            ctx.succeed();
        }
    }

    fn lost_node(&mut self, _ctx: &mut ScenarioCtx<Step>, node: &NodeName, peer: &NodeName) {
        if peer == &self.victim {
            info!(node = %node, "failure of replaced node detected");
        } else {
            warn!(node = %node, peer = %peer, "live peer reported lost");
        }
    }
}

/// Which scenario to run, with its parameters
#[derive(Debug, Display, Clone, PartialEq)]
pub enum ScenarioKind {
    #[display("two-node")]
    TwoNode,
    #[display("lossy-mesh (nodes={nodes}, loss={loss}, packets={packets})")]
    LossyMesh { nodes: usize, loss: f64, packets: u64 },
    #[display("departure (observers={observers})")]
    Departure { observers: usize },
    #[display("churn (nodes={nodes}, packets={packets})")]
    Churn { nodes: usize, packets: u64 },
}

impl ScenarioKind {
    /// The four end-to-end scenarios with their standard parameters
    pub fn all() -> Vec<ScenarioKind> {
        vec![
            ScenarioKind::TwoNode,
            ScenarioKind::LossyMesh {
                nodes: 5,
                loss: 0.5,
                packets: 10,
            },
            ScenarioKind::Departure { observers: 3 },
            ScenarioKind::Churn { nodes: 4, packets: 10 },
        ]
    }

    /// Values each streaming node pushes
    fn packets(&self) -> u64 {
        match self {
            ScenarioKind::TwoNode | ScenarioKind::Departure { .. } => 10,
            ScenarioKind::LossyMesh { packets, .. } | ScenarioKind::Churn { packets, .. } => *packets,
        }
    }

    /// Build and run the scenario
    ///
    /// Errors only when the parameters are invalid; runtime problems are
    /// reported through the [`Outcome`].
    pub async fn run(&self, harness: &Harness) -> Result<Outcome> {
        harness.config().timing.push_at(self.packets())?;
        let outcome = match self {
            ScenarioKind::TwoNode => harness.run(&mut TwoNodeStream::new()?).await,
            ScenarioKind::LossyMesh { nodes, loss, packets } => {
                harness.run(&mut LossyFullMesh::new(*nodes, *loss, *packets)?).await
            }
            ScenarioKind::Departure { observers } => harness.run(&mut DepartureRepair::new(*observers)?).await,
            ScenarioKind::Churn { nodes, packets } => harness.run(&mut ChurnReplacement::new(*nodes, *packets)?).await,
        };
        Ok(outcome)
    }
}
