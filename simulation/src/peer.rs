//! Reference flooding peer
//!
//! The state machine behind the `flood_peer` binary. It is a small test
//! fixture rather than a reliable-multicast protocol: every packet is
//! flooded once per node with duplicate suppression, each origin's values
//! are delivered in order, gaps are repaired with NACKs, and a BYE carries
//! the final count so receivers can report a departure once drained.
//!
//! Wire packets are space-separated text, with the data payload as the
//! raw tail of a `DATA` packet:
//!
//! ```text
//! HELLO <origin>
//! DATA <origin> <seq> <payload>
//! HAVE <origin> <count>
//! BYE <origin> <count>
//! NACK <requester> <origin> <seq>,<seq>,...
//! ```
//!
//! All methods are synchronous and return the control commands to write,
//! so the caller owns the I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::Command;
use crate::types::NodeName;

/// How often a peer announces its own stream and requests repairs
pub const TICK: Duration = Duration::from_millis(50);

/// Silence after which a peer that never said BYE is reported lost
pub const LOST_AFTER: Duration = Duration::from_secs(1);

/// Most sequence numbers requested in one NACK
const MAX_NACK: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

/// One flooded wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello { origin: NodeName },
    Data { origin: NodeName, seq: u64, payload: Vec<u8> },
    Have { origin: NodeName, count: u64 },
    Bye { origin: NodeName, count: u64 },
    Nack { requester: NodeName, origin: NodeName, missing: Vec<u64> },
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Hello { origin } => format!("HELLO {origin}").into_bytes(),
            Packet::Data { origin, seq, payload } => {
                let mut bytes = format!("DATA {origin} {seq} ").into_bytes();
                bytes.extend_from_slice(payload);
                bytes
            }
            Packet::Have { origin, count } => format!("HAVE {origin} {count}").into_bytes(),
            Packet::Bye { origin, count } => format!("BYE {origin} {count}").into_bytes(),
            Packet::Nack {
                requester,
                origin,
                missing,
            } => {
                let list: Vec<String> = missing.iter().map(u64::to_string).collect();
                format!("NACK {requester} {origin} {}", list.join(",")).into_bytes()
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let fields: Vec<&[u8]> = bytes.splitn(4, |b| *b == b' ').collect();
        Self::from_fields(&fields)
            .ok_or_else(|| PacketError::Malformed(String::from_utf8_lossy(bytes).into_owned()))
    }

    fn from_fields(fields: &[&[u8]]) -> Option<Self> {
        let text = |index: usize| fields.get(index).and_then(|field| std::str::from_utf8(field).ok());
        let node = |index: usize| text(index).and_then(|raw| NodeName::new(raw).ok());
        let number = |index: usize| text(index).and_then(|raw| raw.parse::<u64>().ok());

        let packet = match *fields.first()? {
            b"HELLO" => Packet::Hello { origin: node(1)? },
            b"HAVE" => Packet::Have {
                origin: node(1)?,
                count: number(2)?,
            },
            b"BYE" => Packet::Bye {
                origin: node(1)?,
                count: number(2)?,
            },
            b"NACK" => Packet::Nack {
                requester: node(1)?,
                origin: node(2)?,
                missing: text(3)?.split(',').map(|seq| seq.parse().ok()).collect::<Option<Vec<u64>>>()?,
            },
            b"DATA" => Packet::Data {
                origin: node(1)?,
                seq: number(2)?,
                payload: fields.get(3)?.to_vec(),
            },
            _ => return None,
        };
        Some(packet)
    }

    fn origin(&self) -> &NodeName {
        match self {
            Packet::Hello { origin }
            | Packet::Data { origin, .. }
            | Packet::Have { origin, .. }
            | Packet::Bye { origin, .. }
            | Packet::Nack { origin, .. } => origin,
        }
    }
}

fn send(packet: &Packet) -> Command {
    Command::Send(packet.encode())
}

/// What this peer knows about one remote origin
#[derive(Debug)]
struct Stream {
    /// Next sequence number to deliver
    next: u64,
    /// Every value received, kept to answer NACKs
    received: BTreeMap<u64, Vec<u8>>,
    /// Highest count the origin (or a BYE) has advertised
    announced: u64,
    bye: Option<u64>,
    left: bool,
    last_heard: Instant,
    lost: bool,
}

impl Stream {
    fn new(now: Instant) -> Self {
        Self {
            next: 0,
            received: BTreeMap::new(),
            announced: 0,
            bye: None,
            left: false,
            last_heard: now,
            lost: false,
        }
    }

    fn heard(&mut self, now: Instant) {
        self.last_heard = now;
        self.lost = false;
    }

    fn missing(&self) -> Vec<u64> {
        let seen = self.received.keys().next_back().map_or(0, |last| last + 1);
        let target = self.announced.max(seen);
        (self.next..target)
            .filter(|seq| !self.received.contains_key(seq))
            .take(MAX_NACK)
            .collect()
    }
}

/// Flooding peer state
#[derive(Debug)]
pub struct FloodPeer {
    name: NodeName,
    /// This peer's own stream, by sequence number
    sent: BTreeMap<u64, Vec<u8>>,
    streams: BTreeMap<NodeName, Stream>,
    hellos: BTreeSet<NodeName>,
}

impl FloodPeer {
    pub fn new(name: NodeName) -> Self {
        Self {
            name,
            sent: BTreeMap::new(),
            streams: BTreeMap::new(),
            hellos: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Announce this peer
    pub fn start(&self) -> Vec<Command> {
        vec![send(&Packet::Hello {
            origin: self.name.clone(),
        })]
    }

    /// Local application input becomes the next value of this peer's stream
    pub fn on_input(&mut self, data: Vec<u8>) -> Vec<Command> {
        let seq = self.sent.len() as u64;
        self.sent.insert(seq, data.clone());
        vec![send(&Packet::Data {
            origin: self.name.clone(),
            seq,
            payload: data,
        })]
    }

    /// Handle one packet from the network
    pub fn on_packet(&mut self, bytes: &[u8], now: Instant) -> Vec<Command> {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "dropping packet");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        if let Packet::Nack {
            requester,
            origin,
            missing,
        } = &packet
        {
            if requester != &self.name {
                self.answer_nack(origin, missing, &mut out);
            }
            return out;
        }
        if packet.origin() == &self.name {
            return out;
        }

        let origin = packet.origin().clone();
        let stream = self.streams.entry(origin.clone()).or_insert_with(|| {
            out.push(Command::NewNode(origin.clone()));
            Stream::new(now)
        });

        match packet {
            Packet::Hello { .. } => {
                stream.heard(now);
                if self.hellos.insert(origin) {
                    out.push(Command::Send(bytes.to_vec()));
                }
            }
            Packet::Data { seq, payload, .. } => {
                if seq < stream.next || stream.received.contains_key(&seq) {
                    return out;
                }
                stream.received.insert(seq, payload);
                out.push(Command::Send(bytes.to_vec()));
                deliver(stream, &origin, &mut out);
            }
            Packet::Have { count, .. } => {
                stream.heard(now);
                stream.announced = stream.announced.max(count);
            }
            Packet::Bye { count, .. } => {
                if stream.bye.is_none() {
                    debug!(origin = %origin, count, "bye");
                    stream.bye = Some(count);
                    stream.announced = stream.announced.max(count);
                    out.push(Command::Send(bytes.to_vec()));
                }
                deliver(stream, &origin, &mut out);
            }
            Packet::Nack { .. } => {}
        }
        out
    }

    /// Periodic work: advertise our stream, request repairs, detect failures
    pub fn on_tick(&mut self, now: Instant) -> Vec<Command> {
        let mut out = vec![send(&Packet::Have {
            origin: self.name.clone(),
            count: self.sent.len() as u64,
        })];

        for (origin, stream) in &mut self.streams {
            if stream.left {
                continue;
            }
            let missing = stream.missing();
            if !missing.is_empty() {
                out.push(send(&Packet::Nack {
                    requester: self.name.clone(),
                    origin: origin.clone(),
                    missing,
                }));
            }
            if !stream.lost && stream.bye.is_none() && now.duration_since(stream.last_heard) >= LOST_AFTER {
                stream.lost = true;
                out.push(Command::LostNode(origin.clone()));
            }
        }
        out
    }

    /// Input closed: leave, telling everyone how many values we sent
    pub fn on_close(&self) -> Vec<Command> {
        vec![send(&Packet::Bye {
            origin: self.name.clone(),
            count: self.sent.len() as u64,
        })]
    }

    fn answer_nack(&self, origin: &NodeName, missing: &[u64], out: &mut Vec<Command>) {
        let history = if origin == &self.name {
            Some(&self.sent)
        } else {
            self.streams.get(origin).map(|stream| &stream.received)
        };
        let Some(history) = history else {
            return;
        };
        for seq in missing {
            if let Some(payload) = history.get(seq) {
                out.push(send(&Packet::Data {
                    origin: origin.clone(),
                    seq: *seq,
                    payload: payload.clone(),
                }));
            }
        }
    }
}

/// Deliver every contiguous value, then report the departure once drained
fn deliver(stream: &mut Stream, origin: &NodeName, out: &mut Vec<Command>) {
    while let Some(payload) = stream.received.get(&stream.next) {
        out.push(Command::Output {
            sender: origin.clone(),
            payload: payload.clone(),
        });
        stream.next += 1;
    }
    let drained = stream.bye.is_some_and(|count| stream.next >= count);
    if drained && !stream.left {
        stream.left = true;
        out.push(Command::LeftNode(origin.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn data(origin: &str, seq: u64) -> Vec<u8> {
        Packet::Data {
            origin: name(origin),
            seq,
            payload: format!("{seq}\n").into_bytes(),
        }
        .encode()
    }

    fn outputs(commands: &[Command]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Output { payload, .. } => Some(String::from_utf8_lossy(payload).trim().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_packet_decode() {
        assert_eq!(
            Packet::decode(b"DATA a 3 7 8\n").unwrap(),
            Packet::Data {
                origin: name("a"),
                seq: 3,
                payload: b"7 8\n".to_vec(),
            }
        );
        assert_eq!(
            Packet::decode(b"NACK b a 1,4").unwrap(),
            Packet::Nack {
                requester: name("b"),
                origin: name("a"),
                missing: vec![1, 4],
            }
        );
        assert!(Packet::decode(b"BYE a").is_err());
        assert!(Packet::decode(b"PING a").is_err());
        assert!(Packet::decode(b"HAVE a x").is_err());
    }

    #[test]
    fn test_first_packet_announces_origin_before_output() {
        let mut peer = FloodPeer::new(name("b"));
        let out = peer.on_packet(&data("a", 0), Instant::now());
        assert_eq!(out[0], Command::NewNode(name("a")));
        assert_eq!(out[1], Command::Send(data("a", 0)));
        assert_eq!(outputs(&out), vec!["0"]);
    }

    #[test]
    fn test_duplicates_are_dropped_and_not_reflooded() {
        let mut peer = FloodPeer::new(name("b"));
        let now = Instant::now();
        peer.on_packet(&data("a", 0), now);
        assert!(peer.on_packet(&data("a", 0), now).is_empty());
    }

    #[test]
    fn test_reordered_values_are_delivered_in_order() {
        let mut peer = FloodPeer::new(name("b"));
        let now = Instant::now();
        assert!(outputs(&peer.on_packet(&data("a", 1), now)).is_empty());
        assert_eq!(outputs(&peer.on_packet(&data("a", 0), now)), vec!["0", "1"]);
    }

    #[test]
    fn test_tick_requests_missing_values() {
        let mut peer = FloodPeer::new(name("b"));
        let now = Instant::now();
        peer.on_packet(&data("a", 2), now);
        let out = peer.on_tick(now);
        let nack = send(&Packet::Nack {
            requester: name("b"),
            origin: name("a"),
            missing: vec![0, 1],
        });
        assert!(out.contains(&nack));
    }

    #[test]
    fn test_nack_answered_from_history() {
        let mut origin = FloodPeer::new(name("a"));
        origin.on_input(b"0\n".to_vec());
        origin.on_input(b"1\n".to_vec());

        let nack = Packet::Nack {
            requester: name("b"),
            origin: name("a"),
            missing: vec![1, 5],
        }
        .encode();
        let out = origin.on_packet(&nack, Instant::now());
        assert_eq!(out, vec![Command::Send(data("a", 1))]);
    }

    #[test]
    fn test_left_only_after_drain() {
        let mut peer = FloodPeer::new(name("b"));
        let now = Instant::now();
        peer.on_packet(&data("a", 0), now);

        let bye = Packet::Bye {
            origin: name("a"),
            count: 2,
        }
        .encode();
        let out = peer.on_packet(&bye, now);
        assert!(!out.contains(&Command::LeftNode(name("a"))));

        let out = peer.on_packet(&data("a", 1), now);
        assert_eq!(outputs(&out), vec!["1"]);
        assert_eq!(out.last(), Some(&Command::LeftNode(name("a"))));
    }

    #[test]
    fn test_silent_peer_reported_lost_once() {
        let mut peer = FloodPeer::new(name("b"));
        let start = Instant::now();
        let hello = Packet::Hello { origin: name("c") }.encode();
        peer.on_packet(&hello, start);

        let later = start + LOST_AFTER;
        assert!(peer.on_tick(later).contains(&Command::LostNode(name("c"))));
        assert!(!peer.on_tick(later).contains(&Command::LostNode(name("c"))));
    }

    #[test]
    fn test_bye_carries_sent_count() {
        let mut peer = FloodPeer::new(name("a"));
        peer.on_input(b"0\n".to_vec());
        assert_eq!(
            peer.on_close(),
            vec![send(&Packet::Bye {
                origin: name("a"),
                count: 1,
            })]
        );
    }
}
