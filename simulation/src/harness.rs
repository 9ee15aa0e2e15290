//! Scenario driver
//!
//! A single event loop owns the mesh, every node process and the scenario's
//! oracle state. Node output, scheduled timers and the scenario timeout are
//! multiplexed with `select!` and handled one at a time, so hooks mutate
//! shared state without locks.
//!
//! Scenarios implement [`Scenario`]. Every hook has a default, and the
//! default `send_packet` routes through the mesh; overriding hooks is how a
//! scenario plugs in its oracle without touching the topology.

use std::mem;
use std::time::Duration;

use derive_more::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{Result, SimulationError};
use crate::node::{NodeEvent, NodeEventKind, NodeProcess};
use crate::oracle::OracleError;
use crate::protocol::Command;
use crate::topology::Mesh;
use crate::types::NodeName;

/// Where a scenario is in its lifecycle
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    AwaitingJoin,
    Streaming,
    Departing,
    Draining,
    Settled,
    Failed,
}

/// Why a run failed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Failure {
    #[error("assertion failed: {0}")]
    Assertion(#[from] OracleError),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("{scenario} timed out after {budget:?} while {phase}")]
    Timeout {
        scenario: &'static str,
        budget: Duration,
        phase: ScenarioPhase,
    },
}

impl From<SimulationError> for Failure {
    fn from(e: SimulationError) -> Self {
        Failure::Setup(e.to_string())
    }
}

/// Final result of a scenario run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Behaviour of one test scenario
///
/// `Action` is the scenario's own timer payload, delivered back through
/// [`Scenario::on_timer`] after [`ScenarioCtx::call_later`].
pub trait Scenario {
    type Action: Send + 'static;

    fn name(&self) -> &'static str;

    /// Budget before the run is declared failed
    fn timeout(&self) -> Duration;

    /// Spawn nodes, wire links and schedule the first actions
    fn setup(&mut self, ctx: &mut ScenarioCtx<Self::Action>) -> Result<()>;

    fn on_timer(&mut self, ctx: &mut ScenarioCtx<Self::Action>, action: Self::Action);

    /// `from` asked for `payload` to be transmitted
    fn send_packet(&mut self, ctx: &mut ScenarioCtx<Self::Action>, from: &NodeName, payload: &[u8]) {
        ctx.mesh.send_packet(from, payload);
    }

    /// `receiver` delivered `payload` from `sender` to its application
    fn got_output(
        &mut self,
        _ctx: &mut ScenarioCtx<Self::Action>,
        receiver: &NodeName,
        sender: &NodeName,
        payload: &[u8],
    ) {
        debug!(receiver = %receiver, sender = %sender, len = payload.len(), "output");
    }

    /// `node` announced `peer` for the first time
    fn new_node(&mut self, _ctx: &mut ScenarioCtx<Self::Action>, node: &NodeName, peer: &NodeName) {
        debug!(node = %node, peer = %peer, "new node");
    }

    /// `node` considers `peer` failed
    fn lost_node(&mut self, _ctx: &mut ScenarioCtx<Self::Action>, node: &NodeName, peer: &NodeName) {
        info!(node = %node, peer = %peer, "lost node");
    }

    /// `node` saw `peer` leave gracefully
    fn left_node(&mut self, _ctx: &mut ScenarioCtx<Self::Action>, node: &NodeName, peer: &NodeName) {
        info!(node = %node, peer = %peer, "left node");
    }

    /// `node` was spawned and added to the mesh
    fn node_connected(&mut self, _ctx: &mut ScenarioCtx<Self::Action>, node: &NodeName) {
        debug!(node = %node, "node connected");
    }

    /// `node`'s process ended or closed its output
    fn node_disconnected(&mut self, _ctx: &mut ScenarioCtx<Self::Action>, node: &NodeName) {
        debug!(node = %node, "node disconnected");
    }
}

/// Everything a hook may touch during a run
pub struct ScenarioCtx<A> {
    pub mesh: Mesh<NodeProcess>,
    config: HarnessConfig,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    timers_tx: mpsc::UnboundedSender<A>,
    phase: ScenarioPhase,
    outcome: Option<Outcome>,
    /// Spawned since the last hook returned; announced via `node_connected`
    joined: Vec<NodeName>,
    /// Removed from the mesh, still to be reaped
    retired: Vec<NodeProcess>,
}

impl<A: Send + 'static> ScenarioCtx<A> {
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Spawn a peer process for `name` and register it with the mesh
    pub fn add_mesh_node(&mut self, name: NodeName) -> Result<()> {
        if self.mesh.contains(&name) {
            return Err(SimulationError::DuplicateNode(name.to_string()));
        }
        let node = NodeProcess::spawn(&self.config.peer_binary, name.clone(), self.events_tx.clone())?;
        self.mesh.add_node(node)?;
        self.joined.push(name);
        Ok(())
    }

    /// Simulate a failure: detach the node from the mesh and kill its process
    pub fn remove_mesh_node(&mut self, name: &NodeName) -> Result<()> {
        let mut node = self
            .mesh
            .remove_node(name)
            .ok_or_else(|| SimulationError::UnknownNode(name.to_string()))?;
        node.kill();
        info!(node = %name, "node failed");
        self.retired.push(node);
        Ok(())
    }

    /// Ask a node to leave gracefully; it stays routable until it exits
    pub fn disconnect(&mut self, name: &NodeName) -> Result<()> {
        self.mesh
            .node_mut(name)
            .ok_or_else(|| SimulationError::UnknownNode(name.to_string()))?
            .close_input();
        Ok(())
    }

    /// Inject application input into a node
    pub fn push_input(&self, name: &NodeName, data: &[u8]) -> Result<()> {
        self.mesh
            .node(name)
            .ok_or_else(|| SimulationError::UnknownNode(name.to_string()))?
            .push_input(data)
    }

    /// Deliver `action` to [`Scenario::on_timer`] after `delay`
    pub fn call_later(&self, delay: Duration, action: A) {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(action);
        });
    }

    pub fn phase(&self) -> ScenarioPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ScenarioPhase) {
        if self.phase != phase && self.outcome.is_none() {
            info!(from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
        }
    }

    /// End the run successfully unless it already ended
    pub fn succeed(&mut self) {
        if self.outcome.is_none() {
            self.phase = ScenarioPhase::Settled;
            self.outcome = Some(Outcome::Success);
        }
    }

    /// End the run with `failure`; later failures in the same run are ignored
    pub fn fail(&mut self, failure: impl Into<Failure>) {
        let failure = failure.into();
        if self.outcome.is_some() {
            debug!(%failure, "ignoring failure after run ended");
            return;
        }
        match &failure {
            Failure::Timeout { .. } => warn!(%failure, "scenario timed out"),
            _ => error!(%failure, "scenario failed"),
        }
        self.phase = ScenarioPhase::Failed;
        self.outcome = Some(Outcome::Failed(failure));
    }

    /// Unwrap an oracle result, failing the run on error
    pub fn check<T>(&mut self, result: std::result::Result<T, OracleError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Stop every remaining process, giving each `grace` to exit on its own
    async fn shutdown(&mut self, grace: Duration) {
        let mut nodes = self.mesh.drain_nodes();
        nodes.extend(mem::take(&mut self.retired));

        let mut reaping = JoinSet::new();
        for node in nodes {
            reaping.spawn(node.shutdown(grace));
        }
        while reaping.join_next().await.is_some() {}
    }
}

/// Runs scenarios against a configured peer binary
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Drive `scenario` until it settles, fails or times out, then tear down
    pub async fn run<S: Scenario>(&self, scenario: &mut S) -> Outcome {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (timers_tx, mut timers_rx) = mpsc::unbounded_channel();
        let mesh = match self.config.seed {
            Some(seed) => Mesh::seeded(seed),
            None => Mesh::new(),
        };

        let mut ctx = ScenarioCtx {
            mesh,
            config: self.config.clone(),
            events_tx,
            timers_tx,
            phase: ScenarioPhase::AwaitingJoin,
            outcome: None,
            joined: Vec::new(),
            retired: Vec::new(),
        };

        let budget = self.config.timeout_or(scenario.timeout());
        info!(scenario = scenario.name(), budget_ms = budget.as_millis() as u64, "starting scenario");

        if let Err(e) = scenario.setup(&mut ctx) {
            ctx.fail(e);
        }
        debug!("{}", ctx.mesh.visualize());
        announce_joined(scenario, &mut ctx);

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        while !ctx.is_finished() {
            tokio::select! {
                Some(event) = events_rx.recv() => dispatch(scenario, &mut ctx, event),
                Some(action) = timers_rx.recv() => scenario.on_timer(&mut ctx, action),
                () = &mut deadline => {
                    let phase = ctx.phase;
                    ctx.fail(Failure::Timeout {
                        scenario: scenario.name(),
                        budget,
                        phase,
                    });
                }
            }
            announce_joined(scenario, &mut ctx);
        }

        ctx.shutdown(self.config.teardown_grace()).await;

        let outcome = ctx.outcome.take().unwrap_or(Outcome::Success);
        match &outcome {
            Outcome::Success => info!(scenario = scenario.name(), "SUCCESS"),
            Outcome::Failed(failure) => info!(scenario = scenario.name(), %failure, "FAILED"),
        }
        outcome
    }
}

fn announce_joined<S: Scenario>(scenario: &mut S, ctx: &mut ScenarioCtx<S::Action>) {
    while !ctx.joined.is_empty() {
        for node in mem::take(&mut ctx.joined) {
            scenario.node_connected(ctx, &node);
        }
    }
}

fn dispatch<S: Scenario>(scenario: &mut S, ctx: &mut ScenarioCtx<S::Action>, event: NodeEvent) {
    let NodeEvent { node, kind } = event;

    let command = match kind {
        NodeEventKind::Command(command) => command,
        NodeEventKind::Closed => {
            info!(node = %node, "peer output closed");
            scenario.node_disconnected(ctx, &node);
            return;
        }
    };

    if !ctx.mesh.contains(&node) {
        debug!(node = %node, command = command.keyword(), "ignoring command from removed node");
        return;
    }

    match command {
        Command::Send(payload) => scenario.send_packet(ctx, &node, &payload),
        Command::Output { sender, payload } => scenario.got_output(ctx, &node, &sender, &payload),
        Command::NewNode(peer) => {
            let first_time = ctx
                .mesh
                .node_mut(&node)
                .is_some_and(|process| process.record_peer(peer.clone()));
            if first_time {
                scenario.new_node(ctx, &node, &peer);
            }
        }
        Command::LostNode(peer) => scenario.lost_node(ctx, &node, &peer),
        Command::LeftNode(peer) => scenario.left_node(ctx, &node, &peer),
        Command::Input(_) | Command::Recv(_) => {
            warn!(node = %node, command = command.keyword(), "Unknown output: outbound command from peer");
        }
    }
}
