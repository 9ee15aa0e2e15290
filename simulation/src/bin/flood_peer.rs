//! Reference peer for the meshwright harness
//!
//! Speaks the node control protocol on stdin/stdout and floods every packet
//! it sees. Logs go to stderr.
//!
//! Usage: flood_peer <node-name>

use std::time::Instant;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, warn};

use meshwright_logging::{LogConfig, MeshSubscriberBuilder};
use meshwright_simulation::{Command, FloodPeer, NodeName, peer::TICK};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _guard = MeshSubscriberBuilder::new().with_config(LogConfig::peer()).init();

    let name = std::env::args().nth(1).context("usage: flood_peer <node-name>")?;
    let mut peer = FloodPeer::new(NodeName::new(name)?);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(TICK);

    emit(&mut stdout, peer.start()).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let commands = match Command::parse(&line) {
                    Ok(Command::Input(data)) => peer.on_input(data),
                    Ok(Command::Recv(packet)) => peer.on_packet(&packet, Instant::now()),
                    Ok(other) => {
                        warn!(command = other.keyword(), "unexpected command from harness");
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(error = %e, "unreadable line from harness");
                        Vec::new()
                    }
                };
                emit(&mut stdout, commands).await?;
            }
            _ = tick.tick() => emit(&mut stdout, peer.on_tick(Instant::now())).await?,
        }
    }

    debug!(node = %peer.name(), "input closed, leaving");
    emit(&mut stdout, peer.on_close()).await?;
    Ok(())
}

async fn emit(stdout: &mut Stdout, commands: Vec<Command>) -> std::io::Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    for command in commands {
        stdout.write_all(command.encode().as_bytes()).await?;
    }
    stdout.flush().await
}
