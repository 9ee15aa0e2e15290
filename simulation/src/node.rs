//! Peer process wrapper
//!
//! A [`NodeProcess`] owns one spawned peer binary and its stdio pipes.
//! Writes to the process go through an unbounded channel drained by a writer
//! task, so `push_input` and `recv_packet` never block the event loop. A
//! reader task reassembles stdout into control lines and forwards every
//! parsed inbound command as a [`NodeEvent`]; stderr is surfaced in the log.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::error::{Result, SimulationError};
use crate::protocol::{Command, LineBuffer};
use crate::topology::PacketSink;
use crate::types::NodeName;

const READ_CHUNK: usize = 4096;

/// Something a peer process reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub node: NodeName,
    pub kind: NodeEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEventKind {
    /// A well-formed inbound control command
    Command(Command),
    /// stdout reached end of file: the process ended or closed its output
    Closed,
}

/// One spawned peer
#[derive(Debug)]
pub struct NodeProcess {
    name: NodeName,
    child: Child,
    /// Dropping the sender closes the process's stdin
    input: Option<mpsc::UnboundedSender<String>>,
    /// Peers this process announced with NEWNODE
    peers: BTreeSet<NodeName>,
}

impl NodeProcess {
    /// Spawn `binary` with `argv = [binary, name]` and start its I/O tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(binary: &Path, name: NodeName, events: mpsc::UnboundedSender<NodeEvent>) -> Result<Self> {
        let spawn_error = |source: std::io::Error| SimulationError::Spawn {
            node: name.to_string(),
            binary: binary.to_path_buf(),
            source,
        };

        let mut child = ProcessCommand::new(binary)
            .arg(name.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let missing = |pipe: &str| spawn_error(std::io::Error::other(format!("{pipe} not captured")));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let span = info_span!("node", node = %name);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(
            async move {
                while let Some(line) = input_rx.recv().await {
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        warn!(error = %e, "write to peer failed");
                        break;
                    }
                }
                trace!("stdin closed");
            }
            .instrument(span.clone()),
        );

        tokio::spawn(read_commands(stdout, name.clone(), events).instrument(span.clone()));

        tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(stderr = %line, "peer stderr");
                }
            }
            .instrument(span),
        );

        info!(node = %name, pid = ?child.id(), binary = %binary.display(), "spawned peer");

        Ok(Self {
            name,
            child,
            input: Some(input_tx),
            peers: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Inject local application input, as if typed into the peer
    pub fn push_input(&self, data: &[u8]) -> Result<()> {
        self.write(Command::Input(data.to_vec()))
    }

    fn write(&self, command: Command) -> Result<()> {
        trace!(node = %self.name, command = command.keyword(), "to peer");
        self.input
            .as_ref()
            .ok_or_else(|| SimulationError::InputClosed(self.name.to_string()))?
            .send(command.encode())
            .map_err(|_| SimulationError::InputClosed(self.name.to_string()))
    }

    /// Remember that the process announced `peer`; false if already known
    pub fn record_peer(&mut self, peer: NodeName) -> bool {
        self.peers.insert(peer)
    }

    pub fn peers(&self) -> &BTreeSet<NodeName> {
        &self.peers
    }

    /// Ask the peer to leave gracefully by closing its stdin
    ///
    /// The process keeps running and may still transmit (for example a BYE)
    /// until it exits on its own.
    pub fn close_input(&mut self) {
        if self.input.take().is_some() {
            debug!(node = %self.name, "closed peer input");
        }
    }

    /// Simulate an abrupt failure: kill the process without a graceful leave
    pub fn kill(&mut self) {
        self.input = None;
        if let Err(e) = self.child.start_kill() {
            warn!(node = %self.name, error = %e, "kill failed");
        }
    }

    /// Close stdin, wait up to `grace` for the process to exit, then kill it
    pub async fn shutdown(mut self, grace: Duration) {
        self.close_input();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(node = %self.name, %status, "peer exited"),
            Ok(Err(e)) => warn!(node = %self.name, error = %e, "waiting for peer failed"),
            Err(_) => {
                warn!(node = %self.name, grace_ms = grace.as_millis() as u64, "peer did not exit, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(node = %self.name, error = %e, "kill failed");
                }
            }
        }
    }
}

impl PacketSink for NodeProcess {
    fn name(&self) -> &NodeName {
        &self.name
    }

    fn recv_packet(&self, payload: &[u8]) -> Result<()> {
        self.write(Command::Recv(payload.to_vec()))
    }
}

/// Reassemble `stdout` into control lines and forward inbound commands
///
/// Malformed lines and outbound-only commands are logged as unknown output
/// and dropped. Sends [`NodeEventKind::Closed`] once the stream ends.
pub(crate) async fn read_commands<R>(mut stdout: R, node: NodeName, events: mpsc::UnboundedSender<NodeEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    forward_line(&node, &line, &events);
                }
            }
            Err(e) => {
                warn!(error = %e, "read from peer failed");
                break;
            }
        }
    }

    if let Some(tail) = buffer.finish() {
        debug!(line = %tail, "unterminated final line");
        forward_line(&node, &tail, &events);
    }

    let _ = events.send(NodeEvent {
        node,
        kind: NodeEventKind::Closed,
    });
}

fn forward_line(node: &NodeName, line: &str, events: &mpsc::UnboundedSender<NodeEvent>) {
    match Command::parse(line) {
        Ok(command) if command.is_inbound() => {
            let _ = events.send(NodeEvent {
                node: node.clone(),
                kind: NodeEventKind::Command(command),
            });
        }
        Ok(command) => warn!(line, command = command.keyword(), "Unknown output: command not accepted from peers"),
        Err(e) => warn!(line, error = %e, "Unknown output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<NodeEvent>) -> Vec<NodeEventKind> {
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_lines() {
        let stdout = tokio_test::io::Builder::new()
            .read(b"NEWNODE:b\nOUTPUT:b:M")
            .read(b"Ao=\nSEND:")
            .read(b"aGk=\n")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();

        read_commands(stdout, name("a"), tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                NodeEventKind::Command(Command::NewNode(name("b"))),
                NodeEventKind::Command(Command::Output {
                    sender: name("b"),
                    payload: b"0\n".to_vec(),
                }),
                NodeEventKind::Command(Command::Send(b"hi".to_vec())),
                NodeEventKind::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_drops_unknown_output() {
        let stdout = tokio_test::io::Builder::new()
            .read(b"DEBUG:something\nnot a command\nINPUT:MAo=\nLEFTNODE:s\n")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();

        read_commands(stdout, name("a"), tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                NodeEventKind::Command(Command::LeftNode(name("s"))),
                NodeEventKind::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_parses_unterminated_tail() {
        let stdout = tokio_test::io::Builder::new().read(b"LOSTNODE:c").build();
        let (tx, rx) = mpsc::unbounded_channel();

        read_commands(stdout, name("a"), tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                NodeEventKind::Command(Command::LostNode(name("c"))),
                NodeEventKind::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = NodeProcess::spawn(Path::new("/nonexistent/meshwright-peer"), name("a"), tx);
        assert!(matches!(result, Err(SimulationError::Spawn { .. })));
    }
}
