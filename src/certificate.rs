//! # Certificate Aggregation
//!
//! This module ingests votes, detects equivocation, aggregates stake and emits
//! certificates. It owns the vote/certificate ledger of a single validator
//! instance; vote submission is sequential and each vote is processed
//! atomically with respect to certificate emission, so no certificate can be
//! formed from a stake total that double-counts a validator.
//!
//! ## Thresholds
//!
//! - `Notarize` ≥ 60% of total stake
//! - `FinalizeFast` ≥ 80% in a single round
//! - `FinalizeSlow` ≥ 60%, requiring a prior `Notarize` certificate for the
//!   same block at a strictly earlier round
//! - `Skip` ≥ 60% of stake that timed out on the slot
//!
//! The uniqueness of finalizing certificates follows from a stake-overlap
//! argument over these constants: with ≤20% Byzantine stake, two disjoint
//! supermajorities over conflicting blocks cannot both form. The store still
//! re-checks the invariant at emission time and fails with
//! `ConflictingCertificate` if it is ever violated.

use crate::stake::StakeTable;
use crate::{BlockHash, ConsensusError, ConsensusResult, Round, Slot, StakeAmount, ValidatorId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Vote kinds in the dual-path protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoteKind {
    /// First-round vote for a block (slow path round one)
    Notarize,
    /// Single-round fast-path finalization vote
    FinalizeFast,
    /// Second-round finalization vote for a notarized block
    FinalizeSlow,
    /// Vote to skip the slot after timeout expiry
    Skip,
}

impl VoteKind {
    /// Certificate kind produced when this vote kind crosses its threshold.
    pub fn certificate_kind(self) -> CertificateKind {
        match self {
            VoteKind::Notarize => CertificateKind::Notarize,
            VoteKind::FinalizeFast => CertificateKind::FinalizeFast,
            VoteKind::FinalizeSlow => CertificateKind::FinalizeSlow,
            VoteKind::Skip => CertificateKind::Skip,
        }
    }
}

/// Certificate kinds emitted by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertificateKind {
    /// ≥60% of stake voted for one block in one round
    Notarize,
    /// ≥80% of stake voted to finalize in a single round
    FinalizeFast,
    /// ≥60% of stake voted to finalize a previously notarized block
    FinalizeSlow,
    /// ≥60% of stake voted to skip the slot
    Skip,
}

impl CertificateKind {
    /// Whether this certificate finalizes a block. At most one finalizing
    /// certificate may exist per slot.
    pub fn is_finalizing(self) -> bool {
        matches!(self, CertificateKind::FinalizeFast | CertificateKind::FinalizeSlow)
    }
}

/// A signed vote from one validator.
///
/// `block` is `None` only for skip votes. One honest validator casts at most
/// one vote of a given kind per slot and round; a second vote for a different
/// block is equivocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Vote {
    /// Validator casting the vote
    pub voter: ValidatorId,
    /// Slot being voted on
    pub slot: Slot,
    /// Block hash, or `None` for a skip vote
    pub block: Option<BlockHash>,
    /// Kind of vote
    pub kind: VoteKind,
    /// Voting round within the slot
    pub round: Round,
}

impl Vote {
    /// First-round notarize vote for a block.
    pub fn notarize(voter: ValidatorId, slot: Slot, block: BlockHash) -> Self {
        Self { voter, slot, block: Some(block), kind: VoteKind::Notarize, round: 1 }
    }

    /// Single-round fast-path finalization vote.
    pub fn finalize_fast(voter: ValidatorId, slot: Slot, block: BlockHash) -> Self {
        Self { voter, slot, block: Some(block), kind: VoteKind::FinalizeFast, round: 1 }
    }

    /// Second-round finalization vote for a notarized block.
    pub fn finalize_slow(voter: ValidatorId, slot: Slot, block: BlockHash, round: Round) -> Self {
        Self { voter, slot, block: Some(block), kind: VoteKind::FinalizeSlow, round }
    }

    /// Skip vote cast after the slot's timeout expired.
    pub fn skip(voter: ValidatorId, slot: Slot) -> Self {
        Self { voter, slot, block: None, kind: VoteKind::Skip, round: 1 }
    }
}

/// A certificate: agreement of a stake supermajority on one block (or on
/// skipping the slot).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Certificate {
    /// Slot the certificate covers
    pub slot: Slot,
    /// Block hash, or `None` for a skip certificate
    pub block: Option<BlockHash>,
    /// Kind of certificate
    pub kind: CertificateKind,
    /// Round the contributing votes were cast in
    pub round: Round,
    /// Aggregated stake behind the certificate
    pub stake: StakeAmount,
    /// Validators whose votes contributed
    pub validators: BTreeSet<ValidatorId>,
}

/// Retained record of a conflicting vote pair from one validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EquivocationEvidence {
    /// The equivocating validator
    pub voter: ValidatorId,
    /// Slot the conflicting votes cover
    pub slot: Slot,
    /// Kind of the conflicting votes
    pub kind: VoteKind,
    /// Round of the conflicting votes
    pub round: Round,
    /// Block the store accepted first
    pub accepted: Option<BlockHash>,
    /// Block of the rejected conflicting vote
    pub conflicting: Option<BlockHash>,
}

/// Vote ledger and certificate emitter for one validator instance.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    stake: Arc<StakeTable>,
    fast_threshold_pct: u64,
    slow_threshold_pct: u64,
    /// First accepted vote per validator, keyed by what is being voted on.
    accepted: HashMap<(Slot, VoteKind, Round), BTreeMap<ValidatorId, Option<BlockHash>>>,
    /// Emitted certificates per slot.
    certificates: BTreeMap<Slot, Vec<Certificate>>,
    /// Emission guard so crossing a threshold twice cannot re-emit.
    emitted: BTreeSet<(Slot, VoteKind, Round, Option<BlockHash>)>,
    /// Equivocation evidence, retained but never counted.
    evidence: Vec<EquivocationEvidence>,
    /// Certificates emitted since the last drain, including cascades.
    pending: Vec<Certificate>,
}

impl CertificateStore {
    /// Create a store over the epoch stake table.
    pub fn new(stake: Arc<StakeTable>, fast_threshold_pct: u64, slow_threshold_pct: u64) -> Self {
        Self {
            stake,
            fast_threshold_pct,
            slow_threshold_pct,
            accepted: HashMap::new(),
            certificates: BTreeMap::new(),
            emitted: BTreeSet::new(),
            evidence: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Ingest one vote.
    ///
    /// Returns the certificate emitted by this vote, if its stake crossed the
    /// kind's threshold. Resubmitting an identical vote is a no-op. A vote
    /// conflicting with the voter's earlier vote for the same slot, kind and
    /// round fails with `EquivocationDetected`; the earlier vote keeps
    /// counting and the conflict is retained as evidence.
    pub fn submit_vote(&mut self, vote: Vote) -> ConsensusResult<Option<Certificate>> {
        if vote.block.is_none() != (vote.kind == VoteKind::Skip) {
            warn!(voter = vote.voter, slot = vote.slot, kind = ?vote.kind, "malformed vote ignored");
            return Ok(None);
        }

        let ledger = self.accepted.entry((vote.slot, vote.kind, vote.round)).or_default();
        match ledger.get(&vote.voter).copied() {
            Some(prev) if prev == vote.block => return Ok(None),
            Some(prev) => {
                let evidence = EquivocationEvidence {
                    voter: vote.voter,
                    slot: vote.slot,
                    kind: vote.kind,
                    round: vote.round,
                    accepted: prev,
                    conflicting: vote.block,
                };
                warn!(
                    voter = vote.voter,
                    slot = vote.slot,
                    kind = ?vote.kind,
                    "equivocation detected, vote excluded"
                );
                self.evidence.push(evidence);
                return Err(ConsensusError::EquivocationDetected {
                    voter: vote.voter,
                    slot: vote.slot,
                    round: vote.round,
                    kind: vote.kind,
                });
            }
            None => {
                ledger.insert(vote.voter, vote.block);
            }
        }

        let emitted = self.try_emit(vote.slot, vote.kind, vote.round, vote.block)?;
        if let Some(cert) = &emitted {
            self.pending.push(cert.clone());
            if cert.kind == CertificateKind::Notarize {
                // A notarize certificate can unblock finalize-slow votes that
                // arrived out of order; re-check those tallies now.
                self.retry_finalize_slow(vote.slot, vote.block, vote.round)?;
            }
        }
        Ok(emitted)
    }

    /// Attempt emission for one `(slot, kind, round, block)` tally.
    fn try_emit(
        &mut self,
        slot: Slot,
        kind: VoteKind,
        round: Round,
        block: Option<BlockHash>,
    ) -> ConsensusResult<Option<Certificate>> {
        if self.emitted.contains(&(slot, kind, round, block)) {
            return Ok(None);
        }

        let voters: BTreeSet<ValidatorId> = self
            .accepted
            .get(&(slot, kind, round))
            .map(|ledger| {
                ledger
                    .iter()
                    .filter(|(_, voted)| **voted == block)
                    .map(|(voter, _)| *voter)
                    .collect()
            })
            .unwrap_or_default();
        let stake = self.stake.sum_stake(voters.iter().copied());

        let threshold_pct = match kind {
            VoteKind::FinalizeFast => self.fast_threshold_pct,
            _ => self.slow_threshold_pct,
        };
        if !self.stake.meets_threshold(stake, threshold_pct) {
            return Ok(None);
        }

        if kind == VoteKind::FinalizeSlow && !self.has_notarize_before(slot, block, round) {
            // Two rounds of ≥60% are required; without the earlier notarize
            // certificate the slow tally stays parked until it arrives.
            return Ok(None);
        }

        let cert_kind = kind.certificate_kind();
        if cert_kind.is_finalizing() {
            if let Some(existing) = self
                .certificates
                .get(&slot)
                .and_then(|certs| certs.iter().find(|c| c.kind.is_finalizing()))
            {
                if existing.block != block {
                    let trace = serde_json::to_string(&(existing, cert_kind, block, round, stake))
                        .unwrap_or_default();
                    return Err(ConsensusError::ConflictingCertificate { slot, trace });
                }
                // The slot is already finalized; at most one finalizing
                // certificate may ever exist for it.
                return Ok(None);
            }
        }

        let certificate = Certificate {
            slot,
            block,
            kind: cert_kind,
            round,
            stake,
            validators: voters,
        };
        debug!(slot, kind = ?cert_kind, stake, round, "certificate emitted");
        self.emitted.insert((slot, kind, round, block));
        self.certificates.entry(slot).or_default().push(certificate.clone());
        Ok(Some(certificate))
    }

    /// Re-attempt finalize-slow emission for rounds after a fresh notarize
    /// certificate; any cascade is queued for `drain_emitted`.
    fn retry_finalize_slow(
        &mut self,
        slot: Slot,
        block: Option<BlockHash>,
        notarized_round: Round,
    ) -> ConsensusResult<()> {
        let rounds: Vec<Round> = self
            .accepted
            .keys()
            .filter(|(s, kind, round)| {
                *s == slot && *kind == VoteKind::FinalizeSlow && *round > notarized_round
            })
            .map(|(_, _, round)| *round)
            .collect();
        for round in rounds {
            if let Some(cert) = self.try_emit(slot, VoteKind::FinalizeSlow, round, block)? {
                self.pending.push(cert);
            }
        }
        Ok(())
    }

    /// Whether a notarize certificate for `block` exists at a round before
    /// `round`.
    fn has_notarize_before(&self, slot: Slot, block: Option<BlockHash>, round: Round) -> bool {
        self.certificates.get(&slot).is_some_and(|certs| {
            certs
                .iter()
                .any(|c| c.kind == CertificateKind::Notarize && c.block == block && c.round < round)
        })
    }

    /// Certificates emitted for a slot, in emission order.
    pub fn certificates(&self, slot: Slot) -> &[Certificate] {
        self.certificates.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All certificates across slots.
    pub fn all_certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.values().flatten()
    }

    /// Certificates emitted since the last call, including cascades that were
    /// unblocked by another emission.
    pub fn drain_emitted(&mut self) -> Vec<Certificate> {
        std::mem::take(&mut self.pending)
    }

    /// Retained equivocation evidence.
    pub fn equivocation_evidence(&self) -> &[EquivocationEvidence] {
        &self.evidence
    }

    /// Aggregated stake currently tallied for a vote target.
    pub fn tallied_stake(
        &self,
        slot: Slot,
        kind: VoteKind,
        round: Round,
        block: Option<BlockHash>,
    ) -> StakeAmount {
        self.accepted
            .get(&(slot, kind, round))
            .map(|ledger| {
                self.stake.sum_stake(
                    ledger
                        .iter()
                        .filter(|(_, voted)| **voted == block)
                        .map(|(voter, _)| *voter),
                )
            })
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn insert_certificate(&mut self, cert: Certificate) {
        self.certificates.entry(cert.slot).or_default().push(cert);
    }
}
