//! meshwright - lossy mesh scenario runner
//!
//! Spawns one peer process per node, carries their packets over a simulated
//! lossy mesh, and checks what every node delivers. Prints `SUCCESS` or
//! `FAILED: <reason>` and exits with 0, 1 (scenario failed) or 2 (bad
//! configuration).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use meshwright_logging::{FileConfig, LogConfig, MeshSubscriberBuilder};
use meshwright_simulation::{
    Harness, HarnessConfig, LinkParams, Mesh, NodeName, Outcome, PacketSink, ScenarioKind,
};

#[derive(Parser)]
#[command(
    name = "meshwright",
    about = "Drive peer processes over a simulated lossy mesh and check delivery",
    version
)]
struct Cli {
    /// Human-readable log output instead of JSONL
    #[arg(long, global = true)]
    pretty: bool,

    /// Default log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    level: String,

    /// Also write a JSONL run log into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// JSON harness configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Peer executable, overriding config and MESHWRIGHT_PEER
    #[arg(long, global = true)]
    peer: Option<PathBuf>,

    /// Seed for the loss model
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Timeout in seconds, overriding each scenario's own
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two nodes on a lossless link, ten values from a to b
    TwoNode,

    /// Full mesh where every node streams to every other over lossy links
    LossyMesh {
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Drop probability of every link
        #[arg(short, long, default_value = "0.5")]
        loss: f64,

        /// Values each node pushes
        #[arg(short, long, default_value = "10")]
        packets: u64,
    },

    /// A sender leaves with its last values withheld; observers must repair
    Departure {
        #[arg(short, long, default_value = "3")]
        observers: usize,
    },

    /// A node fails mid-stream and is replaced
    Churn {
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        #[arg(short, long, default_value = "10")]
        packets: u64,
    },

    /// Run every scenario in turn, stopping at the first failure
    All,

    /// Print a full mesh without spawning any process
    Topology {
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        #[arg(short, long, default_value = "0.5")]
        loss: f64,
    },
}

/// Stand-in node for printing topologies
struct Placeholder(NodeName);

impl PacketSink for Placeholder {
    fn name(&self) -> &NodeName {
        &self.0
    }

    fn recv_packet(&self, _payload: &[u8]) -> meshwright_simulation::Result<()> {
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = if cli.pretty {
        LogConfig::development()
    } else {
        LogConfig::default()
    };
    log_config.default_level = cli.level.clone();
    let mut builder = MeshSubscriberBuilder::new().with_config(log_config);
    if let Some(dir) = &cli.log_dir {
        builder = builder.with_file_output(FileConfig::run_log(dir.clone()));
    }
    let _guard = builder.init();

    let kinds = match &cli.command {
        Commands::TwoNode => vec![ScenarioKind::TwoNode],
        Commands::LossyMesh { nodes, loss, packets } => vec![ScenarioKind::LossyMesh {
            nodes: *nodes,
            loss: *loss,
            packets: *packets,
        }],
        Commands::Departure { observers } => vec![ScenarioKind::Departure { observers: *observers }],
        Commands::Churn { nodes, packets } => vec![ScenarioKind::Churn {
            nodes: *nodes,
            packets: *packets,
        }],
        Commands::All => ScenarioKind::all(),
        Commands::Topology { nodes, loss } => return print_topology(*nodes, *loss),
    };

    match run(&cli, kinds).await {
        Ok(Outcome::Success) => {
            println!("SUCCESS");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Failed(failure)) => {
            println!("FAILED: {failure}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "configuration error");
            println!("FAILED: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    }
    .with_env();

    if let Some(peer) = &cli.peer {
        config.peer_binary = peer.clone();
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    if cli.timeout.is_some() {
        config.timeout_secs = cli.timeout;
    }
    Ok(config)
}

async fn run(cli: &Cli, kinds: Vec<ScenarioKind>) -> anyhow::Result<Outcome> {
    let config = load_config(cli)?;
    if !config.peer_binary.exists() {
        anyhow::bail!(
            "peer binary {} not found (set --peer or MESHWRIGHT_PEER)",
            config.peer_binary.display()
        );
    }
    let harness = Harness::new(config);

    for kind in kinds {
        info!(scenario = %kind, "running");
        let outcome = kind.run(&harness).await?;
        if !outcome.is_success() {
            return Ok(outcome);
        }
    }
    Ok(Outcome::Success)
}

/// Print a full mesh; no verdict line, since nothing is run
fn print_topology(nodes: usize, loss: f64) -> ExitCode {
    match render_topology(nodes, loss) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "cannot build topology");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn render_topology(nodes: usize, loss: f64) -> anyhow::Result<String> {
    let mut mesh = Mesh::new();
    for name in NodeName::numbered("n", nodes)? {
        mesh.add_node(Placeholder(name))?;
    }
    mesh.connect_full(LinkParams::lossy(loss)?)?;
    Ok(mesh.visualize())
}
