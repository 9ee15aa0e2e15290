//! Delivery oracle
//!
//! Independent bookkeeping of what every receiver must observe next. The
//! checks here are pure: scenarios feed them events from the live mesh and
//! turn any [`OracleError`] into a failed run.
//!
//! Payloads are sequence values rendered as decimal text (`"7\n"`).

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::trace;

use crate::types::NodeName;

/// An invariant violation observed on the event stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("{receiver} delivered {actual} from {sender}, expected {expected}")]
    OutOfOrder {
        receiver: NodeName,
        sender: NodeName,
        expected: u64,
        actual: u64,
    },

    #[error("{receiver} delivered data from {sender}, which it never announced as a peer")]
    UnknownSender { receiver: NodeName, sender: NodeName },

    #[error("{receiver} delivered non-numeric payload {payload:?} from {sender}")]
    MalformedValue {
        receiver: NodeName,
        sender: NodeName,
        payload: String,
    },

    #[error("{observer} reported {departed} gone with next value {expected}, before reaching {required}")]
    PrematureDeparture {
        observer: NodeName,
        departed: NodeName,
        expected: u64,
        required: u64,
    },

    #[error("{from} still has a link to removed node {removed}")]
    LeakedLink { removed: NodeName, from: NodeName },

    #[error("{departed} left and every observer drained, but no withheld value was repaired")]
    RepairNotExercised { departed: NodeName },
}

/// Where a receiver's expectation for a sender begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// The first value delivered must be 0
    Zero,
    /// The first value delivered becomes the baseline (late joiners)
    FirstObserved,
}

/// Decode a sequence value payload
pub fn parse_value(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

/// Tracks the next expected value per (receiver, sender) pair
#[derive(Debug)]
pub struct DeliveryOracle {
    default_start: StartAt,
    overrides: BTreeMap<NodeName, StartAt>,
    expected: BTreeMap<(NodeName, NodeName), u64>,
}

impl DeliveryOracle {
    pub fn new(default_start: StartAt) -> Self {
        Self {
            default_start,
            overrides: BTreeMap::new(),
            expected: BTreeMap::new(),
        }
    }

    /// Use a different start rule for every stream `receiver` observes
    pub fn start_receiver_at(&mut self, receiver: NodeName, start: StartAt) {
        self.overrides.insert(receiver, start);
    }

    fn start_for(&self, receiver: &NodeName) -> StartAt {
        self.overrides.get(receiver).copied().unwrap_or(self.default_start)
    }

    /// Check one delivery and advance the expectation
    ///
    /// `known_peers` are the peers the receiving process has announced.
    /// Returns the new next-expected value.
    pub fn observe(
        &mut self,
        receiver: &NodeName,
        known_peers: &BTreeSet<NodeName>,
        sender: &NodeName,
        payload: &[u8],
    ) -> Result<u64, OracleError> {
        if !known_peers.contains(sender) {
            return Err(OracleError::UnknownSender {
                receiver: receiver.clone(),
                sender: sender.clone(),
            });
        }

        let actual = parse_value(payload).ok_or_else(|| OracleError::MalformedValue {
            receiver: receiver.clone(),
            sender: sender.clone(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        })?;

        let key = (receiver.clone(), sender.clone());
        let expected = match (self.expected.get(&key), self.start_for(receiver)) {
            (Some(next), _) => *next,
            (None, StartAt::Zero) => 0,
            (None, StartAt::FirstObserved) => actual,
        };

        if actual != expected {
            return Err(OracleError::OutOfOrder {
                receiver: receiver.clone(),
                sender: sender.clone(),
                expected,
                actual,
            });
        }

        let next = expected + 1;
        self.expected.insert(key, next);
        trace!(receiver = %receiver, sender = %sender, value = actual, "delivery in order");
        Ok(next)
    }

    /// Next value `receiver` must deliver from `sender`
    ///
    /// `None` while a late joiner has not delivered anything from `sender`.
    pub fn next_expected(&self, receiver: &NodeName, sender: &NodeName) -> Option<u64> {
        match self.expected.get(&(receiver.clone(), sender.clone())) {
            Some(next) => Some(*next),
            None => match self.start_for(receiver) {
                StartAt::Zero => Some(0),
                StartAt::FirstObserved => None,
            },
        }
    }

    /// Whether `receiver` has delivered every value of `sender` below `count`
    pub fn has_reached(&self, receiver: &NodeName, sender: &NodeName, count: u64) -> bool {
        self.next_expected(receiver, sender).is_some_and(|next| next >= count)
    }

    /// Forget a receiver, e.g. after it failed
    pub fn forget_receiver(&mut self, receiver: &NodeName) {
        self.expected.retain(|(r, _), _| r != receiver);
        self.overrides.remove(receiver);
    }
}

/// Drain-before-departure check for one departing node
///
/// Every observer must have delivered the departing node's full stream
/// before it reports the node gone.
#[derive(Debug)]
pub struct DepartureWatch {
    departing: NodeName,
    /// Number of values the departing node sent (`final value + 1`)
    required: u64,
    drained: BTreeSet<NodeName>,
    departed: BTreeSet<NodeName>,
}

impl DepartureWatch {
    pub fn new(departing: NodeName, required: u64) -> Self {
        Self {
            departing,
            required,
            drained: BTreeSet::new(),
            departed: BTreeSet::new(),
        }
    }

    pub fn departing(&self) -> &NodeName {
        &self.departing
    }

    /// Note that `observer` has delivered the full stream; returns the drained count
    pub fn record_drained(&mut self, observer: NodeName) -> usize {
        self.drained.insert(observer);
        self.drained.len()
    }

    /// Check a departure report from `observer`, given its next expected value
    pub fn record_departure(&mut self, observer: &NodeName, next_expected: Option<u64>) -> Result<usize, OracleError> {
        let expected = next_expected.unwrap_or(0);
        if expected < self.required || !self.drained.contains(observer) {
            return Err(OracleError::PrematureDeparture {
                observer: observer.clone(),
                departed: self.departing.clone(),
                expected,
                required: self.required,
            });
        }
        self.departed.insert(observer.clone());
        Ok(self.departed.len())
    }

    pub fn departed_count(&self) -> usize {
        self.departed.len()
    }

    /// Every one of `observers` has drained and then reported the departure
    pub fn is_settled(&self, observers: usize) -> bool {
        self.drained.len() >= observers && self.departed.len() >= observers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn peers(names: &[&str]) -> BTreeSet<NodeName> {
        names.iter().map(|n| name(n)).collect()
    }

    fn value(v: u64) -> Vec<u8> {
        format!("{v}\n").into_bytes()
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(b"0\n"), Some(0));
        assert_eq!(parse_value(b" 42 "), Some(42));
        assert_eq!(parse_value(b"x"), None);
        assert_eq!(parse_value(&[0xff]), None);
    }

    #[test]
    fn test_in_order_stream_is_accepted() {
        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        let known = peers(&["a"]);
        for v in 0..10 {
            assert_eq!(oracle.observe(&name("b"), &known, &name("a"), &value(v)).unwrap(), v + 1);
        }
        assert!(oracle.has_reached(&name("b"), &name("a"), 10));
        assert!(!oracle.has_reached(&name("b"), &name("a"), 11));
    }

    #[test]
    fn test_gap_duplicate_and_reorder_fail() {
        let known = peers(&["a"]);

        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        let err = oracle.observe(&name("b"), &known, &name("a"), &value(1)).unwrap_err();
        assert_eq!(
            err,
            OracleError::OutOfOrder {
                receiver: name("b"),
                sender: name("a"),
                expected: 0,
                actual: 1,
            }
        );

        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        oracle.observe(&name("b"), &known, &name("a"), &value(0)).unwrap();
        assert!(oracle.observe(&name("b"), &known, &name("a"), &value(0)).is_err());
    }

    #[test]
    fn test_streams_are_tracked_per_pair() {
        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        let known = peers(&["a", "c"]);
        oracle.observe(&name("b"), &known, &name("a"), &value(0)).unwrap();
        oracle.observe(&name("b"), &known, &name("c"), &value(0)).unwrap();
        oracle.observe(&name("b"), &known, &name("a"), &value(1)).unwrap();
        assert_eq!(oracle.next_expected(&name("b"), &name("a")), Some(2));
        assert_eq!(oracle.next_expected(&name("b"), &name("c")), Some(1));
        assert_eq!(oracle.next_expected(&name("d"), &name("a")), Some(0));
    }

    #[test]
    fn test_unknown_sender_fails_before_ordering() {
        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        let err = oracle
            .observe(&name("b"), &peers(&["c"]), &name("a"), &value(0))
            .unwrap_err();
        assert!(matches!(err, OracleError::UnknownSender { .. }));
        assert_eq!(oracle.next_expected(&name("b"), &name("a")), Some(0));
    }

    #[test]
    fn test_malformed_value() {
        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        let err = oracle
            .observe(&name("b"), &peers(&["a"]), &name("a"), b"hello")
            .unwrap_err();
        assert!(matches!(err, OracleError::MalformedValue { ref payload, .. } if payload == "hello"));
    }

    #[test]
    fn test_late_joiner_starts_at_first_observed() {
        let mut oracle = DeliveryOracle::new(StartAt::Zero);
        oracle.start_receiver_at(name("late"), StartAt::FirstObserved);
        let known = peers(&["a"]);

        assert_eq!(oracle.next_expected(&name("late"), &name("a")), None);
        assert!(!oracle.has_reached(&name("late"), &name("a"), 0));
        oracle.observe(&name("late"), &known, &name("a"), &value(7)).unwrap();
        oracle.observe(&name("late"), &known, &name("a"), &value(8)).unwrap();
        assert!(oracle.observe(&name("late"), &known, &name("a"), &value(10)).is_err());
        assert_eq!(oracle.next_expected(&name("late"), &name("a")), Some(9));
    }

    #[test]
    fn test_forget_receiver() {
        let mut oracle = DeliveryOracle::new(StartAt::FirstObserved);
        let known = peers(&["a"]);
        oracle.observe(&name("b"), &known, &name("a"), &value(3)).unwrap();
        oracle.forget_receiver(&name("b"));
        assert_eq!(oracle.next_expected(&name("b"), &name("a")), None);
    }

    #[test]
    fn test_departure_after_drain_is_accepted() {
        let mut watch = DepartureWatch::new(name("s"), 10);
        assert_eq!(watch.record_drained(name("o1")), 1);
        assert_eq!(watch.record_departure(&name("o1"), Some(10)).unwrap(), 1);
        assert!(watch.is_settled(1));
        assert!(!watch.is_settled(2));
    }

    #[test]
    fn test_departure_before_drain_fails() {
        let mut watch = DepartureWatch::new(name("s"), 10);
        let err = watch.record_departure(&name("o1"), Some(8)).unwrap_err();
        assert_eq!(
            err,
            OracleError::PrematureDeparture {
                observer: name("o1"),
                departed: name("s"),
                expected: 8,
                required: 10,
            }
        );
        assert!(watch.record_departure(&name("o2"), None).is_err());
        assert_eq!(watch.departed_count(), 0);
    }
}
