//! Node control protocol
//!
//! Each peer process talks to the simulator over its stdio using one
//! command per `\n`-terminated UTF-8 line:
//!
//! ```text
//! simulator -> process   INPUT:<base64>            local application input
//! simulator -> process   RECV:<base64>             inbound network packet
//! process -> simulator   SEND:<base64>             packet to transmit
//! process -> simulator   OUTPUT:<sender>:<base64>  payload delivered from sender
//! process -> simulator   NEWNODE:<name>            peer discovered
//! process -> simulator   LOSTNODE:<name>           peer considered failed
//! process -> simulator   LEFTNODE:<name>           peer left and was drained
//! ```
//!
//! Anything else is a [`ProtocolError`], which callers log and drop.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use tracing::warn;

use crate::types::NodeName;

/// Framing errors for a single control line
///
/// None of these are fatal: the offending line is logged and discarded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing ':' separator in line {0:?}")]
    MissingSeparator(String),

    #[error("Unknown command {command:?} in line {line:?}")]
    UnknownCommand { command: String, line: String },

    #[error("Invalid base64 payload in {command} line: {reason}")]
    InvalidPayload { command: &'static str, reason: String },

    #[error("Invalid node name {0:?}")]
    InvalidNodeName(String),
}

/// One control protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Local application input for the process
    Input(Vec<u8>),
    /// Simulated network delivery to the process
    Recv(Vec<u8>),
    /// The process wants a packet transmitted
    Send(Vec<u8>),
    /// The process delivered a payload from `sender` to its application
    Output { sender: NodeName, payload: Vec<u8> },
    /// The process discovered a peer
    NewNode(NodeName),
    /// The process considers a peer failed
    LostNode(NodeName),
    /// The process saw a peer leave and has delivered everything it sent
    LeftNode(NodeName),
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Input(_) => "INPUT",
            Command::Recv(_) => "RECV",
            Command::Send(_) => "SEND",
            Command::Output { .. } => "OUTPUT",
            Command::NewNode(_) => "NEWNODE",
            Command::LostNode(_) => "LOSTNODE",
            Command::LeftNode(_) => "LEFTNODE",
        }
    }

    /// Whether the command travels from a peer process to the simulator
    pub fn is_inbound(&self) -> bool {
        !matches!(self, Command::Input(_) | Command::Recv(_))
    }

    /// Parse one line, with or without its trailing newline
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let (command, rest) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;

        match command {
            "INPUT" => Ok(Command::Input(decode("INPUT", rest)?)),
            "RECV" => Ok(Command::Recv(decode("RECV", rest)?)),
            "SEND" => Ok(Command::Send(decode("SEND", rest)?)),
            "OUTPUT" => {
                // Split on the first colon only; base64 never contains one.
                let (sender, payload) = rest
                    .split_once(':')
                    .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;
                Ok(Command::Output {
                    sender: node_name(sender)?,
                    payload: decode("OUTPUT", payload)?,
                })
            }
            "NEWNODE" => Ok(Command::NewNode(node_name(rest)?)),
            "LOSTNODE" => Ok(Command::LostNode(node_name(rest)?)),
            "LEFTNODE" => Ok(Command::LeftNode(node_name(rest)?)),
            other => Err(ProtocolError::UnknownCommand {
                command: other.to_string(),
                line: line.to_string(),
            }),
        }
    }

    /// Render the command as a complete line, including the trailing `\n`
    pub fn encode(&self) -> String {
        let keyword = self.keyword();
        match self {
            Command::Input(data) | Command::Recv(data) | Command::Send(data) => {
                format!("{}:{}\n", keyword, STANDARD.encode(data))
            }
            Command::Output { sender, payload } => {
                format!("{}:{}:{}\n", keyword, sender, STANDARD.encode(payload))
            }
            Command::NewNode(name) | Command::LostNode(name) | Command::LeftNode(name) => {
                format!("{}:{}\n", keyword, name)
            }
        }
    }
}

fn decode(command: &'static str, data: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(data)
        .map_err(|e| ProtocolError::InvalidPayload {
            command,
            reason: e.to_string(),
        })
}

fn node_name(raw: &str) -> Result<NodeName, ProtocolError> {
    NodeName::new(raw).map_err(|_| ProtocolError::InvalidNodeName(raw.to_string()))
}

/// Longest control line accepted from a peer, terminator excluded
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles a byte stream into complete lines
///
/// Holds at most one incomplete line between calls, and never more than
/// [`MAX_LINE_BYTES`] of it. A longer line is logged as unknown output and
/// skipped up to its terminator. A chunk may carry any number of complete
/// lines and end in the middle of another.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Dropping the rest of an overlong line
    skipping: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without terminators
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(end) = rest.iter().position(|b| *b == b'\n') {
            if self.append(&rest[..end]) {
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            }
            self.pending.clear();
            self.skipping = false;
            rest = &rest[end + 1..];
        }
        self.append(rest);
        lines
    }

    /// Add bytes to the pending line; false while skipping an overlong one
    fn append(&mut self, bytes: &[u8]) -> bool {
        if self.skipping {
            return false;
        }
        if self.pending.len() + bytes.len() > MAX_LINE_BYTES {
            warn!(
                bytes = self.pending.len() + bytes.len(),
                limit = MAX_LINE_BYTES,
                "Unknown output: line too long, dropping"
            );
            self.pending.clear();
            self.skipping = true;
            return false;
        }
        self.pending.extend_from_slice(bytes);
        true
    }

    /// Bytes received after the last newline
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Take the unterminated tail left when the stream closes
    pub fn finish(&mut self) -> Option<String> {
        self.skipping = false;
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}
