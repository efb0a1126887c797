//! # Validator Node
//!
//! Composition of one validator's consensus components behind the external
//! interface the harness drives: `inject` feeds a message, `advance_clock`
//! moves logical time, and the query methods expose read-only snapshots of
//! finalization state and certificates.
//!
//! A node is polymorphic over its voting [`Behavior`]: the harness selects
//! `Honest`, `Equivocator`, `Silent` or `DelayedResponder` per validator
//! instead of hard-coding attack logic into the core. Behaviors shape only
//! what a validator *sends*; vote ingestion, aggregation and finalization
//! always follow the protocol, which is exactly what keeps honest nodes safe
//! next to Byzantine ones.

use crate::certificate::{Certificate, CertificateStore, Vote};
use crate::leader::{LeaderSchedule, WindowManager};
use crate::network::{Outgoing, ProtocolMessage, Recipient};
use crate::rotor::{RelayAssignment, Rotor, Shred};
use crate::sampling::StakeWeightedSampler;
use crate::stake::StakeTable;
use crate::timeout::{TimeoutClock, TimeoutEvent};
use crate::votor::{FinalizationEvent, FinalizationRecord, Votor};
use crate::{
    Block, BlockHash, Config, ConsensusError, ConsensusResult, Slot, TimeValue, ValidatorId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mask applied by an equivocator to fabricate a conflicting block hash.
const EQUIVOCATION_MASK: BlockHash = 0xdead_beef_dead_beef;

/// A vote a behavior decided to emit, optionally held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingVote {
    /// The vote to broadcast
    pub vote: Vote,
    /// Logical delay before the vote leaves the node
    pub delay: TimeValue,
}

/// Voting strategy of a validator.
///
/// `cast` transforms each vote the honest protocol would emit into the votes
/// this validator actually emits.
pub trait Behavior: std::fmt::Debug {
    /// Votes actually emitted in place of the protocol-prescribed `vote`.
    fn cast(&mut self, vote: Vote) -> Vec<OutgoingVote>;

    /// Whether this validator performs its Rotor relay duty.
    fn forwards_shreds(&self) -> bool {
        true
    }
}

/// Follows the protocol exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Honest;

impl Behavior for Honest {
    fn cast(&mut self, vote: Vote) -> Vec<OutgoingVote> {
        vec![OutgoingVote { vote, delay: 0 }]
    }
}

/// Byzantine: emits a second, conflicting vote for every block vote.
#[derive(Debug, Clone, Copy, Default)]
pub struct Equivocator;

impl Behavior for Equivocator {
    fn cast(&mut self, vote: Vote) -> Vec<OutgoingVote> {
        let mut votes = vec![OutgoingVote { vote: vote.clone(), delay: 0 }];
        if let Some(block) = vote.block {
            let mut twin = vote;
            twin.block = Some(block ^ EQUIVOCATION_MASK);
            votes.push(OutgoingVote { vote: twin, delay: 0 });
        }
        votes
    }
}

/// Crashed or unreachable: emits nothing and relays nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Behavior for Silent {
    fn cast(&mut self, _vote: Vote) -> Vec<OutgoingVote> {
        Vec::new()
    }

    fn forwards_shreds(&self) -> bool {
        false
    }
}

/// Slow but honest: every vote is held back by a fixed logical delay.
#[derive(Debug, Clone, Copy)]
pub struct DelayedResponder {
    /// Hold-back applied to every vote
    pub delay: TimeValue,
}

impl Behavior for DelayedResponder {
    fn cast(&mut self, vote: Vote) -> Vec<OutgoingVote> {
        vec![OutgoingVote { vote, delay: self.delay }]
    }
}

/// One validator instance: certificate store, finalization table, Rotor state
/// and clocks, all owned exclusively by this node and mutated only by its own
/// event processing.
#[derive(Debug)]
pub struct ValidatorNode {
    id: ValidatorId,
    stake: Arc<StakeTable>,
    schedule: LeaderSchedule,
    windows: WindowManager,
    store: CertificateStore,
    votor: Votor,
    rotor: Rotor,
    clock: TimeoutClock,
    behavior: Box<dyn Behavior>,
    /// Votes held back by the behavior, with their release times.
    held: Vec<(TimeValue, Vote)>,
    /// Messages awaiting pickup by the network driver.
    outbox: Vec<Outgoing>,
    /// Finalization events awaiting pickup by the harness.
    events: Vec<FinalizationEvent>,
    /// Block this node notarize-voted per slot (vote-once rule, and the
    /// precondition for casting the slow-path finalize vote).
    voted_notar: BTreeMap<Slot, BlockHash>,
    /// Shreds already forwarded as a relay.
    forwarded: BTreeSet<(Slot, BlockHash, u32)>,
}

impl ValidatorNode {
    /// Build a node from a validated configuration, with honest behavior.
    pub fn new(id: ValidatorId, config: Config) -> ConsensusResult<Self> {
        let stake = Arc::new(StakeTable::from_config(&config)?);
        let sampler = StakeWeightedSampler::new(config.seed);
        Ok(Self {
            id,
            schedule: LeaderSchedule::new(Arc::clone(&stake), config.window_size),
            windows: WindowManager::new(config.bad_window_skip_trigger),
            store: CertificateStore::new(
                Arc::clone(&stake),
                config.fast_threshold_pct,
                config.slow_threshold_pct,
            ),
            votor: Votor::new(),
            rotor: Rotor::new(
                Arc::clone(&stake),
                sampler,
                config.data_shreds,
                config.total_shreds,
                config.fanout,
            ),
            clock: TimeoutClock::new(config.slot_timeout),
            stake,
            behavior: Box::new(Honest),
            held: Vec::new(),
            outbox: Vec::new(),
            events: Vec::new(),
            voted_notar: BTreeMap::new(),
            forwarded: BTreeSet::new(),
        })
    }

    /// Replace the voting behavior.
    pub fn with_behavior(mut self, behavior: Box<dyn Behavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// This node's validator id.
    pub fn id(&self) -> ValidatorId {
        self.id
    }

    /// The shared epoch stake table.
    pub fn stake_table(&self) -> &StakeTable {
        &self.stake
    }

    /// The leader schedule derived from the epoch stake table.
    pub fn schedule(&self) -> &LeaderSchedule {
        &self.schedule
    }

    /// Current logical time of this node.
    pub fn now(&self) -> TimeValue {
        self.clock.now()
    }

    /// Mark a slot as the active slot: its finalization record becomes
    /// `Pending` and its timeout deadline is fixed. If the slot belongs to a
    /// window already flagged bad, the node skips it pre-emptively.
    pub fn begin_slot(&mut self, slot: Slot) -> ConsensusResult<()> {
        self.votor.activate_slot(slot, self.clock.now());
        self.clock.activate(slot);
        if self.windows.should_preempt(&self.schedule, slot)
            && !self.votor.record(slot).is_terminal()
        {
            debug!(id = self.id, slot, "pre-emptive skip for flagged window");
            self.cast(Vote::skip(self.id, slot))?;
        }
        Ok(())
    }

    /// Leader entry point: build a block for `slot`, erasure-code it and hand
    /// the shreds to the relays. Fails with `ScheduleViolation` when this
    /// node does not lead the slot's window.
    pub fn propose(
        &mut self,
        slot: Slot,
        parent: BlockHash,
        payload: Vec<u8>,
    ) -> ConsensusResult<RelayAssignment> {
        self.schedule.verify_proposer(slot, self.id)?;
        let block = Block::new(slot, self.id, parent, payload);
        let (shreds, assignment) = self.rotor.disseminate(&block)?;
        for shred in shreds {
            let position = shred.index as usize % assignment.relays.len().max(1);
            if let Some(relay) = assignment.relays.get(position) {
                self.outbox.push(Outgoing {
                    recipient: Recipient::Validator(*relay),
                    message: ProtocolMessage::Shred(shred),
                });
            }
        }
        // The leader holds the block already; process it directly.
        self.on_block(block)?;
        Ok(assignment)
    }

    /// Feed one protocol message into the node.
    ///
    /// Recoverable conditions (equivocation, schedule violations, failed
    /// reconstructions) are absorbed here and turned into protocol-visible
    /// outcomes; only a detected safety violation propagates.
    pub fn inject(&mut self, message: ProtocolMessage) -> ConsensusResult<()> {
        match message {
            ProtocolMessage::Block(block) => self.on_block(block),
            ProtocolMessage::Vote(vote) => self.ingest_vote(vote),
            ProtocolMessage::Shred(shred) => self.on_shred(shred),
        }
    }

    /// Advance this node's logical clock, releasing held votes and firing
    /// slot timeouts.
    pub fn advance_clock(&mut self, duration: TimeValue) -> ConsensusResult<()> {
        let expired = self.clock.advance(duration);
        let now = self.clock.now();

        let (due, held): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.held).into_iter().partition(|(at, _)| *at <= now);
        self.held = held;
        for (_, vote) in due {
            self.emit(vote)?;
        }

        for event in expired {
            self.on_timeout(event)?;
        }
        Ok(())
    }

    /// Read-only snapshot of a slot's finalization state.
    pub fn query_finalization(&self, slot: Slot) -> FinalizationRecord {
        self.votor.record(slot)
    }

    /// Certificates this node has formed for a slot.
    pub fn query_certificates(&self, slot: Slot) -> &[Certificate] {
        self.store.certificates(slot)
    }

    /// All certificates this node has formed.
    pub fn all_certificates(&self) -> Vec<Certificate> {
        self.store.all_certificates().cloned().collect()
    }

    /// All `(slot, record)` pairs this node tracks.
    pub fn finalization_records(&self) -> Vec<(Slot, FinalizationRecord)> {
        self.votor.records().collect()
    }

    /// Terminal latencies of this node's finished slots.
    pub fn terminal_latencies(&self) -> Vec<TimeValue> {
        self.votor.terminal_latencies()
    }

    /// Equivocation evidence retained by this node's store.
    pub fn equivocation_evidence(&self) -> &[crate::certificate::EquivocationEvidence] {
        self.store.equivocation_evidence()
    }

    /// Messages produced since the last drain, for the network driver.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Finalization events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<FinalizationEvent> {
        std::mem::take(&mut self.events)
    }

    fn on_block(&mut self, block: Block) -> ConsensusResult<()> {
        if let Err(violation) = self.schedule.verify_proposer(block.slot, block.proposer) {
            warn!(id = self.id, %violation, "block rejected");
            return Ok(());
        }
        self.votor.activate_slot(block.slot, self.clock.now());
        self.clock.activate(block.slot);
        if self.votor.record(block.slot).is_terminal() {
            return Ok(());
        }

        if self.windows.should_preempt(&self.schedule, block.slot) {
            return self.cast(Vote::skip(self.id, block.slot));
        }

        // Vote once per slot: a second (conflicting or not) proposal gets nothing.
        if self.voted_notar.contains_key(&block.slot) {
            return Ok(());
        }
        self.voted_notar.insert(block.slot, block.hash);
        self.cast(Vote::notarize(self.id, block.slot, block.hash))?;
        self.cast(Vote::finalize_fast(self.id, block.slot, block.hash))
    }

    fn on_shred(&mut self, shred: Shred) -> ConsensusResult<()> {
        self.maybe_relay(&shred);
        match self.rotor.accept_shred(shred) {
            Ok(Some(block)) => self.on_block(block),
            Ok(None) => Ok(()),
            Err(failure @ ConsensusError::ReconstructionFailure { .. }) => {
                // Absorbed: the slot stays pending and drifts toward skip.
                warn!(id = self.id, %failure, "reconstruction failed");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Forward a shred to everyone if this node is the shred's relay.
    fn maybe_relay(&mut self, shred: &Shred) {
        if !self.behavior.forwards_shreds() {
            return;
        }
        let relays = self.rotor.relays_for(shred.slot, shred.proposer);
        if relays.is_empty() {
            return;
        }
        let position = shred.index as usize % relays.len();
        if relays.get(position) != Some(&self.id) {
            return;
        }
        if self.forwarded.insert((shred.slot, shred.block, shred.index)) {
            self.outbox.push(Outgoing {
                recipient: Recipient::Broadcast,
                message: ProtocolMessage::Shred(shred.clone()),
            });
        }
    }

    /// Route a protocol-prescribed vote through the behavior.
    fn cast(&mut self, vote: Vote) -> ConsensusResult<()> {
        for outgoing in self.behavior.cast(vote) {
            if outgoing.delay == 0 {
                self.emit(outgoing.vote)?;
            } else {
                self.held.push((self.clock.now() + outgoing.delay, outgoing.vote));
            }
        }
        Ok(())
    }

    /// Broadcast a vote and deliver it to this node's own store.
    fn emit(&mut self, vote: Vote) -> ConsensusResult<()> {
        self.outbox.push(Outgoing {
            recipient: Recipient::Broadcast,
            message: ProtocolMessage::Vote(vote.clone()),
        });
        self.ingest_vote(vote)
    }

    fn ingest_vote(&mut self, vote: Vote) -> ConsensusResult<()> {
        match self.store.submit_vote(vote) {
            Ok(_) => {}
            Err(equivocation @ ConsensusError::EquivocationDetected { .. }) => {
                // Evidence is retained by the store; the vote is excluded.
                warn!(id = self.id, %equivocation, "vote excluded");
            }
            Err(fatal) => return Err(fatal),
        }
        for certificate in self.store.drain_emitted() {
            self.apply_certificate(certificate)?;
        }
        Ok(())
    }

    fn apply_certificate(&mut self, certificate: Certificate) -> ConsensusResult<()> {
        let now = self.clock.now();
        let Some(event) = self.votor.on_certificate(&certificate, now) else {
            return Ok(());
        };
        self.windows.observe(&self.schedule, &event);
        match &event {
            FinalizationEvent::Notarized { slot, block, round } => {
                // Slow path round two: finalize only a block this node itself
                // notarized, at the round after the notarize certificate.
                if self.voted_notar.get(slot) == Some(block) {
                    self.cast(Vote::finalize_slow(self.id, *slot, *block, round + 1))?;
                }
            }
            FinalizationEvent::Finalized { slot, .. } | FinalizationEvent::Skipped { slot } => {
                self.clock.cancel(*slot);
            }
        }
        self.events.push(event);
        Ok(())
    }

    fn on_timeout(&mut self, event: TimeoutEvent) -> ConsensusResult<()> {
        if self.votor.record(event.slot).is_terminal() {
            return Ok(());
        }
        for failure in self.rotor.abandon_slot(event.slot) {
            warn!(id = self.id, %failure, "shreds abandoned at timeout");
        }
        debug!(id = self.id, slot = event.slot, "timeout expired, casting skip vote");
        self.cast(Vote::skip(self.id, event.slot))
    }
}
