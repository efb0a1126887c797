//! # Votor: Dual-Path Finalization
//!
//! Per-slot finalization state machine. Votor consumes certificates (and, via
//! the node, timeout expirations) and produces finalization decisions:
//!
//! - **Fast path**: a single `FinalizeFast` certificate (≥80% stake) finalizes
//!   the slot in one round
//! - **Slow path**: a `Notarize` certificate (≥60%) followed by a
//!   `FinalizeSlow` certificate in a later round (≥60%)
//! - **Skip**: a `Skip` certificate terminates a slot whose leader produced no
//!   finalizable block in time
//!
//! Transitions are monotonic (`Pending → Notarized → terminal`) and terminal
//! states are immutable; a certificate arriving after a slot finished is
//! ignored. Every transition emits a [`FinalizationEvent`] consumed by the
//! window manager and the embedding harness.

use crate::certificate::{Certificate, CertificateKind};
use crate::{BlockHash, Round, Slot, TimeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Worst-case logical time for a slot to reach a terminal state.
///
/// `delta_fast` is the delay bound for one round of votes from ≥80% of stake,
/// `delta_slow` for ≥60%. The fast path needs one such round, the slow path
/// two, so the slot terminates within the smaller of the two budgets.
pub fn finalization_bound(delta_fast: TimeValue, delta_slow: TimeValue) -> TimeValue {
    delta_fast.min(2 * delta_slow)
}

/// Finalization state of one slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FinalizationRecord {
    /// No certificate observed yet
    Pending,
    /// A notarize certificate exists; awaiting the second round
    Notarized(BlockHash),
    /// Finalized via the single-round fast path (terminal)
    FastFinalized(BlockHash),
    /// Finalized via two rounds of the slow path (terminal)
    SlowFinalized(BlockHash),
    /// Skipped via a skip certificate (terminal)
    Skipped,
}

impl FinalizationRecord {
    /// Whether the record can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FinalizationRecord::FastFinalized(_)
                | FinalizationRecord::SlowFinalized(_)
                | FinalizationRecord::Skipped
        )
    }

    /// Whether no certificate has been observed for the slot.
    pub fn is_pending(self) -> bool {
        matches!(self, FinalizationRecord::Pending)
    }

    /// The finalized block, if the slot finalized on either path.
    pub fn finalized_block(self) -> Option<BlockHash> {
        match self {
            FinalizationRecord::FastFinalized(block) | FinalizationRecord::SlowFinalized(block) => {
                Some(block)
            }
            _ => None,
        }
    }
}

/// Which path finalized a slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FinalizationPath {
    /// Single round, ≥80% stake
    Fast,
    /// Two rounds, ≥60% stake each
    Slow,
}

/// Event emitted on every slot transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FinalizationEvent {
    /// The slot's block was notarized (intermediate, slow path round one)
    Notarized { slot: Slot, block: BlockHash, round: Round },
    /// The slot finalized (terminal)
    Finalized { slot: Slot, block: BlockHash, path: FinalizationPath },
    /// The slot was skipped (terminal)
    Skipped { slot: Slot },
}

/// Progress bookkeeping for one slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotProgress {
    /// Current finalization state
    pub record: FinalizationRecord,
    /// Logical time the slot became active (`Pending`)
    pub activated_at: TimeValue,
    /// Logical time a terminal state was reached
    pub terminal_at: Option<TimeValue>,
    /// Round of the notarize certificate, when one was observed
    pub notarize_round: Option<Round>,
}

impl SlotProgress {
    fn new(activated_at: TimeValue) -> Self {
        Self {
            record: FinalizationRecord::Pending,
            activated_at,
            terminal_at: None,
            notarize_round: None,
        }
    }

    /// Logical time from activation to the terminal state.
    pub fn terminal_latency(&self) -> Option<TimeValue> {
        self.terminal_at.map(|at| at.saturating_sub(self.activated_at))
    }
}

/// The per-slot finalization table of one validator instance.
///
/// Owned exclusively by that instance and mutated only through the
/// certificates and timeout events it consumes.
#[derive(Debug, Clone, Default)]
pub struct Votor {
    slots: BTreeMap<Slot, SlotProgress>,
}

impl Votor {
    /// Create an empty finalization table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a slot active at `now`. Idempotent; the activation time anchors
    /// the slot's timeout deadline and its finalization latency.
    pub fn activate_slot(&mut self, slot: Slot, now: TimeValue) {
        self.slots.entry(slot).or_insert_with(|| SlotProgress::new(now));
    }

    /// Read-only snapshot of a slot's finalization state.
    pub fn record(&self, slot: Slot) -> FinalizationRecord {
        self.slots.get(&slot).map(|p| p.record).unwrap_or(FinalizationRecord::Pending)
    }

    /// Full progress bookkeeping for a slot, when it was activated.
    pub fn progress(&self, slot: Slot) -> Option<&SlotProgress> {
        self.slots.get(&slot)
    }

    /// All `(slot, record)` pairs tracked so far.
    pub fn records(&self) -> impl Iterator<Item = (Slot, FinalizationRecord)> + '_ {
        self.slots.iter().map(|(slot, progress)| (*slot, progress.record))
    }

    /// Terminal latencies of all finished slots.
    pub fn terminal_latencies(&self) -> Vec<TimeValue> {
        self.slots.values().filter_map(SlotProgress::terminal_latency).collect()
    }

    /// Consume a certificate and transition the slot's state machine.
    ///
    /// Returns the transition event, or `None` when the certificate does not
    /// advance the slot (already terminal, duplicate, or not applicable).
    pub fn on_certificate(&mut self, cert: &Certificate, now: TimeValue) -> Option<FinalizationEvent> {
        let progress = self.slots.entry(cert.slot).or_insert_with(|| SlotProgress::new(now));
        if progress.record.is_terminal() {
            return None;
        }

        match (cert.kind, cert.block) {
            (CertificateKind::FinalizeFast, Some(block)) => {
                progress.record = FinalizationRecord::FastFinalized(block);
                progress.terminal_at = Some(now);
                info!(slot = cert.slot, block, "slot fast-finalized");
                Some(FinalizationEvent::Finalized {
                    slot: cert.slot,
                    block,
                    path: FinalizationPath::Fast,
                })
            }
            (CertificateKind::Notarize, Some(block)) => match progress.record {
                FinalizationRecord::Pending => {
                    progress.record = FinalizationRecord::Notarized(block);
                    progress.notarize_round = Some(cert.round);
                    debug!(slot = cert.slot, block, round = cert.round, "slot notarized");
                    Some(FinalizationEvent::Notarized { slot: cert.slot, block, round: cert.round })
                }
                _ => None,
            },
            (CertificateKind::FinalizeSlow, Some(block)) => match progress.record {
                // The store emits a slow certificate only after the matching
                // notarize certificate, so `Pending` here just means both
                // arrived in one batch.
                FinalizationRecord::Pending | FinalizationRecord::Notarized(_) => {
                    if let FinalizationRecord::Notarized(notarized) = progress.record {
                        if notarized != block {
                            return None;
                        }
                    }
                    progress.record = FinalizationRecord::SlowFinalized(block);
                    progress.terminal_at = Some(now);
                    info!(slot = cert.slot, block, "slot slow-finalized");
                    Some(FinalizationEvent::Finalized {
                        slot: cert.slot,
                        block,
                        path: FinalizationPath::Slow,
                    })
                }
                _ => None,
            },
            (CertificateKind::Skip, None) => {
                progress.record = FinalizationRecord::Skipped;
                progress.terminal_at = Some(now);
                info!(slot = cert.slot, "slot skipped");
                Some(FinalizationEvent::Skipped { slot: cert.slot })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn cert(slot: Slot, kind: CertificateKind, block: Option<BlockHash>, round: Round) -> Certificate {
        Certificate {
            slot,
            block,
            kind,
            round,
            stake: 90,
            validators: BTreeSet::from([0, 1, 2, 3]),
        }
    }

    #[test]
    fn fast_certificate_finalizes_from_pending() {
        let mut votor = Votor::new();
        votor.activate_slot(1, 0);
        let event = votor.on_certificate(&cert(1, CertificateKind::FinalizeFast, Some(7), 1), 3);
        assert_eq!(
            event,
            Some(FinalizationEvent::Finalized { slot: 1, block: 7, path: FinalizationPath::Fast })
        );
        assert_eq!(votor.record(1), FinalizationRecord::FastFinalized(7));
        assert_eq!(votor.progress(1).unwrap().terminal_latency(), Some(3));
    }

    #[test]
    fn slow_path_passes_through_notarized() {
        let mut votor = Votor::new();
        votor.activate_slot(2, 0);
        let event = votor.on_certificate(&cert(2, CertificateKind::Notarize, Some(9), 1), 1);
        assert_eq!(event, Some(FinalizationEvent::Notarized { slot: 2, block: 9, round: 1 }));
        assert_eq!(votor.record(2), FinalizationRecord::Notarized(9));

        let event = votor.on_certificate(&cert(2, CertificateKind::FinalizeSlow, Some(9), 2), 4);
        assert_eq!(
            event,
            Some(FinalizationEvent::Finalized { slot: 2, block: 9, path: FinalizationPath::Slow })
        );
        assert_eq!(votor.record(2), FinalizationRecord::SlowFinalized(9));
    }

    #[test]
    fn fast_certificate_dominates_notarized() {
        let mut votor = Votor::new();
        votor.activate_slot(3, 0);
        votor.on_certificate(&cert(3, CertificateKind::Notarize, Some(5), 1), 1);
        let event = votor.on_certificate(&cert(3, CertificateKind::FinalizeFast, Some(5), 1), 2);
        assert!(matches!(
            event,
            Some(FinalizationEvent::Finalized { path: FinalizationPath::Fast, .. })
        ));
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut votor = Votor::new();
        votor.activate_slot(4, 0);
        votor.on_certificate(&cert(4, CertificateKind::FinalizeFast, Some(1), 1), 1);
        // Neither a skip nor another finalization can move a finished slot.
        assert!(votor.on_certificate(&cert(4, CertificateKind::Skip, None, 1), 2).is_none());
        assert!(votor.on_certificate(&cert(4, CertificateKind::FinalizeSlow, Some(1), 2), 2).is_none());
        assert_eq!(votor.record(4), FinalizationRecord::FastFinalized(1));
    }

    #[test]
    fn skip_terminates_pending_and_notarized() {
        let mut votor = Votor::new();
        votor.activate_slot(5, 0);
        assert_eq!(
            votor.on_certificate(&cert(5, CertificateKind::Skip, None, 1), 2),
            Some(FinalizationEvent::Skipped { slot: 5 })
        );

        votor.activate_slot(6, 0);
        votor.on_certificate(&cert(6, CertificateKind::Notarize, Some(3), 1), 1);
        assert_eq!(
            votor.on_certificate(&cert(6, CertificateKind::Skip, None, 1), 2),
            Some(FinalizationEvent::Skipped { slot: 6 })
        );
    }

    #[test]
    fn slow_certificate_for_other_block_is_ignored() {
        let mut votor = Votor::new();
        votor.activate_slot(7, 0);
        votor.on_certificate(&cert(7, CertificateKind::Notarize, Some(1), 1), 1);
        assert!(votor.on_certificate(&cert(7, CertificateKind::FinalizeSlow, Some(2), 2), 2).is_none());
        assert_eq!(votor.record(7), FinalizationRecord::Notarized(1));
    }

    #[test]
    fn activation_is_idempotent() {
        let mut votor = Votor::new();
        votor.activate_slot(8, 5);
        votor.activate_slot(8, 9);
        assert_eq!(votor.progress(8).unwrap().activated_at, 5);
    }

    #[test]
    fn bound_is_min_of_fast_and_two_slow_rounds() {
        assert_eq!(finalization_bound(100, 40), 80);
        assert_eq!(finalization_bound(70, 40), 70);
        assert_eq!(finalization_bound(100, 60), 100);
    }
}
