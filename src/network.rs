//! # Simulated Network and Cluster Composition
//!
//! The consensus core never talks to a transport: validators expose an
//! injection surface and the environment decides what arrives when. This
//! module provides that environment for verification — a deterministic
//! message queue with seeded, bounded delays, and a [`Cluster`] composing N
//! independent validator instances over it.
//!
//! Delay is modeled as bounded-but-unknown below the partial-synchrony
//! threshold: every message is delivered within `max_network_delay` ticks,
//! with the exact delay drawn from a seeded generator so runs replay exactly.
//! Adversarial senders are modeled by node behaviors, not by the network;
//! the network itself never forges or duplicates.

use crate::certificate::{Certificate, Vote};
use crate::rotor::Shred;
use crate::validator::{Equivocator, Honest, Silent, ValidatorNode};
use crate::votor::FinalizationRecord;
use crate::{Block, BlockHash, Config, ConsensusResult, Slot, TimeValue, ValidatorId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logical contract of the wire: the three message shapes validators accept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProtocolMessage {
    /// A full block (leader's local path or a reconstructed delivery)
    Block(Block),
    /// A consensus vote
    Vote(Vote),
    /// An erasure-coded block fragment
    Shred(Shred),
}

/// Addressing for an outgoing message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// One validator
    Validator(ValidatorId),
    /// Every validator except the sender
    Broadcast,
}

/// A message leaving a node, before the network assigns delivery times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Outgoing {
    /// Where the message goes
    pub recipient: Recipient,
    /// The message itself
    pub message: ProtocolMessage,
}

/// An in-flight message with its delivery time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Sending validator
    pub src: ValidatorId,
    /// Receiving validator
    pub dst: ValidatorId,
    /// Logical time the message arrives
    pub deliver_at: TimeValue,
    /// The carried message
    pub message: ProtocolMessage,
}

/// Deterministic bounded-delay message queue.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    validator_count: usize,
    max_delay: TimeValue,
    rng: ChaCha8Rng,
    /// In-flight messages ordered by delivery time; the sequence number keeps
    /// same-tick deliveries in send order.
    in_flight: BTreeMap<(TimeValue, u64), Envelope>,
    sequence: u64,
}

impl SimNetwork {
    /// Create a network for `validator_count` validators with delays in
    /// `1..=max_delay`, drawn from the given seed.
    pub fn new(validator_count: usize, max_delay: TimeValue, seed: u64) -> Self {
        Self {
            validator_count,
            max_delay: max_delay.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed ^ 0x6e65_7477_6f72_6b21),
            in_flight: BTreeMap::new(),
            sequence: 0,
        }
    }

    /// Queue an outgoing message, expanding broadcasts.
    pub fn send(&mut self, src: ValidatorId, outgoing: Outgoing, now: TimeValue) {
        let targets: Vec<ValidatorId> = match outgoing.recipient {
            Recipient::Validator(dst) => vec![dst],
            Recipient::Broadcast => (0..self.validator_count as ValidatorId)
                .filter(|dst| *dst != src)
                .collect(),
        };
        for dst in targets {
            let delay = self.rng.gen_range(1..=self.max_delay);
            let envelope = Envelope {
                src,
                dst,
                deliver_at: now + delay,
                message: outgoing.message.clone(),
            };
            self.in_flight.insert((envelope.deliver_at, self.sequence), envelope);
            self.sequence += 1;
        }
    }

    /// Remove and return every message due at or before `now`, in delivery
    /// order.
    pub fn due(&mut self, now: TimeValue) -> Vec<Envelope> {
        let pending = self.in_flight.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut self.in_flight, pending);
        due.into_values().collect()
    }

    /// Whether any message is still in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// N validator instances plus the simulated network: the composition the
/// verification harness drives.
///
/// Behaviors come from the configuration: validators in the Byzantine subset
/// equivocate, validators in the offline subset stay silent, everyone else is
/// honest.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<ValidatorNode>,
    network: SimNetwork,
    now: TimeValue,
}

impl Cluster {
    /// Build a cluster from one configuration shared by all instances.
    pub fn new(config: &Config) -> ConsensusResult<Self> {
        let mut nodes = Vec::with_capacity(config.validator_count);
        for id in 0..config.validator_count as ValidatorId {
            let node = ValidatorNode::new(id, config.clone())?;
            let node = if config.byzantine_validators.contains(&id) {
                node.with_behavior(Box::new(Equivocator))
            } else if config.offline_validators.contains(&id) {
                node.with_behavior(Box::new(Silent))
            } else {
                node.with_behavior(Box::new(Honest))
            };
            nodes.push(node);
        }
        Ok(Self {
            nodes,
            network: SimNetwork::new(config.validator_count, config.max_network_delay, config.seed),
            now: 0,
        })
    }

    /// Current logical time of the cluster driver.
    pub fn now(&self) -> TimeValue {
        self.now
    }

    /// Immutable access to one node.
    pub fn node(&self, id: ValidatorId) -> &ValidatorNode {
        &self.nodes[id as usize]
    }

    /// Mutable access to one node, for direct injection.
    pub fn node_mut(&mut self, id: ValidatorId) -> &mut ValidatorNode {
        &mut self.nodes[id as usize]
    }

    /// Number of validators in the cluster.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no validators.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leader of a slot, from the shared schedule.
    pub fn leader_of(&self, slot: Slot) -> ValidatorId {
        self.nodes[0].schedule().leader_for_slot(slot)
    }

    /// Activate a slot on every node.
    pub fn begin_slot(&mut self, slot: Slot) -> ConsensusResult<()> {
        for node in &mut self.nodes {
            node.begin_slot(slot)?;
        }
        self.flush_outboxes();
        Ok(())
    }

    /// Drive the slot's leader to propose a block.
    pub fn propose(&mut self, slot: Slot, parent: BlockHash, payload: Vec<u8>) -> ConsensusResult<()> {
        let leader = self.leader_of(slot);
        self.nodes[leader as usize].propose(slot, parent, payload)?;
        self.flush_outboxes();
        Ok(())
    }

    /// Advance the cluster by one tick: deliver due messages, move every
    /// node's clock, collect new traffic.
    pub fn step(&mut self, tick: TimeValue) -> ConsensusResult<()> {
        self.now += tick;
        for envelope in self.network.due(self.now) {
            self.nodes[envelope.dst as usize].inject(envelope.message)?;
        }
        for node in &mut self.nodes {
            node.advance_clock(tick)?;
        }
        self.flush_outboxes();
        Ok(())
    }

    /// Step with unit ticks until no message is in flight, or `max_ticks`
    /// elapsed.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> ConsensusResult<()> {
        for _ in 0..max_ticks {
            self.step(1)?;
            if self.network.is_idle() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn flush_outboxes(&mut self) {
        for id in 0..self.nodes.len() {
            for outgoing in self.nodes[id].drain_outbox() {
                self.network.send(id as ValidatorId, outgoing, self.now);
            }
        }
    }

    /// Certificates across all nodes, for the safety predicates.
    pub fn all_certificates(&self) -> Vec<Certificate> {
        self.nodes.iter().flat_map(ValidatorNode::all_certificates).collect()
    }

    /// `(slot, record)` pairs across all nodes.
    pub fn finalization_records(&self) -> Vec<(Slot, FinalizationRecord)> {
        self.nodes.iter().flat_map(ValidatorNode::finalization_records).collect()
    }

    /// One slot's record on every node.
    pub fn records_of(&self, slot: Slot) -> Vec<FinalizationRecord> {
        self.nodes.iter().map(|node| node.query_finalization(slot)).collect()
    }

    /// Terminal latencies across all nodes.
    pub fn terminal_latencies(&self) -> Vec<TimeValue> {
        self.nodes.iter().flat_map(ValidatorNode::terminal_latencies).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_everyone_but_the_sender() {
        let mut network = SimNetwork::new(4, 3, 1);
        network.send(
            0,
            Outgoing {
                recipient: Recipient::Broadcast,
                message: ProtocolMessage::Vote(Vote::skip(0, 1)),
            },
            0,
        );
        let delivered = network.due(10);
        let mut destinations: Vec<ValidatorId> =
            delivered.iter().map(|envelope| envelope.dst).collect();
        destinations.sort_unstable();
        assert_eq!(destinations, vec![1, 2, 3]);
        assert!(delivered.iter().all(|e| e.deliver_at >= 1 && e.deliver_at <= 3));
    }

    #[test]
    fn delivery_respects_the_delay_bound() {
        let mut network = SimNetwork::new(2, 5, 9);
        for _ in 0..50 {
            network.send(
                0,
                Outgoing {
                    recipient: Recipient::Validator(1),
                    message: ProtocolMessage::Vote(Vote::skip(0, 1)),
                },
                0,
            );
        }
        assert!(network.due(0).is_empty());
        let delivered = network.due(5);
        assert_eq!(delivered.len(), 50);
        assert!(network.is_idle());
    }

    #[test]
    fn same_seed_same_delays() {
        let outgoing = Outgoing {
            recipient: Recipient::Broadcast,
            message: ProtocolMessage::Vote(Vote::skip(0, 1)),
        };
        let mut a = SimNetwork::new(5, 4, 7);
        let mut b = SimNetwork::new(5, 4, 7);
        a.send(0, outgoing.clone(), 0);
        b.send(0, outgoing, 0);
        assert_eq!(a.due(10), b.due(10));
    }

    #[test]
    fn cluster_assigns_behaviors_from_config() {
        let config = Config::new()
            .with_stakes(vec![30, 25, 20, 15, 10])
            .with_byzantine_validators([4].into())
            .with_offline_validators([3].into());
        let cluster = Cluster::new(&config).unwrap();
        assert_eq!(cluster.len(), 5);
        assert_eq!(cluster.leader_of(0), cluster.node(1).schedule().leader_for_slot(0));
    }
}
