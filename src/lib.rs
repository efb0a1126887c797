//! # Alpenglow Consensus Core
//!
//! This library implements the consensus core of the Alpenglow dual-path
//! finality protocol: stake-weighted certificate aggregation, the Votor
//! finalization state machine, Rotor erasure-coded block dissemination,
//! deterministic leader windows and timeout-driven skip handling.
//!
//! ## Architecture
//!
//! The core consists of several components, each owned by a single validator
//! instance and communicating only through events:
//!
//! - **StakeTable**: immutable per-epoch validator → stake mapping, the basis
//!   for all thresholds and sampling
//! - **CertificateStore**: ingests votes, detects equivocation, aggregates
//!   stake into certificates
//! - **Votor**: per-slot dual-path state machine (fast path ≥80% stake, slow
//!   path two rounds of ≥60% stake)
//! - **Rotor**: erasure-coded block propagation over stake-weighted relays
//! - **LeaderSchedule / WindowManager**: deterministic leader rotation and
//!   BadWindow tracking
//! - **TimeoutClock**: fixed per-slot deadlines on a logical clock
//!
//! ## Usage
//!
//! ```rust
//! use alpenglow_core::{Config, ValidatorNode};
//!
//! let config = Config::new().with_validators(4).with_seed(7);
//! let node = ValidatorNode::new(0, config).unwrap();
//! assert!(node.query_finalization(1).is_pending());
//! ```
//!
//! All timing is logical: the embedding harness injects messages and advances
//! each validator's clock explicitly, so executions are exactly reproducible
//! given the same configuration seed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub mod certificate;
pub mod leader;
pub mod network;
pub mod rotor;
pub mod sampling;
pub mod stake;
pub mod timeout;
pub mod validator;
pub mod votor;

pub use certificate::{Certificate, CertificateKind, CertificateStore, EquivocationEvidence, Vote, VoteKind};
pub use leader::{LeaderSchedule, WindowManager, WindowState};
pub use network::{Cluster, Envelope, Outgoing, ProtocolMessage, Recipient, SimNetwork};
pub use rotor::{RelayAssignment, Rotor, Shred};
pub use sampling::{recommended_fanout, StakeWeightedSampler};
pub use stake::StakeTable;
pub use timeout::{TimeoutClock, TimeoutEvent};
pub use validator::{
    Behavior, DelayedResponder, Equivocator, Honest, OutgoingVote, Silent, ValidatorNode,
};
pub use votor::{finalization_bound, FinalizationEvent, FinalizationPath, FinalizationRecord, Votor};

/// Validator identifier type
pub type ValidatorId = u32;

/// Slot number type; slots increase monotonically and never reuse
pub type Slot = u64;

/// Voting round within a slot (1 for the first round)
pub type Round = u64;

/// Stake amount type; the epoch total is the denominator of all thresholds
pub type StakeAmount = u64;

/// Block hash type; a 64-bit digest of the block payload
pub type BlockHash = u64;

/// Logical time value advanced by the embedding driver
pub type TimeValue = u64;

/// Leader window index (`slot / window_size`)
pub type WindowIndex = u64;

/// 64-bit FNV-1a digest used as the model-level block hash.
pub fn payload_hash(payload: &[u8]) -> BlockHash {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in payload {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// A block proposed by a window leader.
///
/// Blocks are immutable once created and identified by `(slot, hash)`; two
/// blocks with the same slot but different hashes are conflicting proposals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Block {
    /// Slot this block is proposed for
    pub slot: Slot,
    /// Validator that produced the block
    pub proposer: ValidatorId,
    /// Hash of the parent block
    pub parent: BlockHash,
    /// Digest of the payload, the block's identity within its slot
    pub hash: BlockHash,
    /// Opaque payload bytes carried through Rotor
    pub payload: Vec<u8>,
}

impl Block {
    /// Create a block, deriving the hash from the payload.
    pub fn new(slot: Slot, proposer: ValidatorId, parent: BlockHash, payload: Vec<u8>) -> Self {
        let hash = payload_hash(&payload);
        Self { slot, proposer, parent, hash, payload }
    }
}

/// Error taxonomy of the consensus core.
///
/// Recoverable conditions (`EquivocationDetected`, `ReconstructionFailure`,
/// `ScheduleViolation`) are absorbed at component boundaries and turned into
/// protocol-visible outcomes. `ConflictingCertificate` is the one fatal
/// variant: it indicates a safety violation and carries a serialized trace of
/// the offending certificates for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Error)]
pub enum ConsensusError {
    /// A validator cast conflicting votes of the same kind for one slot/round
    #[error("validator {voter} equivocated with a {kind:?} vote for slot {slot} round {round}")]
    EquivocationDetected {
        voter: ValidatorId,
        slot: Slot,
        round: Round,
        kind: VoteKind,
    },

    /// Two finalizing certificates for one slot reference different blocks
    #[error("conflicting finalizing certificates for slot {slot}: {trace}")]
    ConflictingCertificate { slot: Slot, trace: String },

    /// Fewer than K distinct shreds were collected for a block
    #[error("slot {slot} block {block:#018x}: {have} of {need} shreds, cannot reconstruct")]
    ReconstructionFailure {
        slot: Slot,
        block: BlockHash,
        have: usize,
        need: usize,
    },

    /// A block arrived from a validator that does not lead the slot's window
    #[error("slot {slot} belongs to leader {expected}, block came from {actual}")]
    ScheduleViolation {
        slot: Slot,
        expected: ValidatorId,
        actual: ValidatorId,
    },

    /// Configuration rejected at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for consensus core operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Configuration of a validator instance and its epoch parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Number of validators in the epoch
    pub validator_count: usize,

    /// Stake per validator, indexed by validator id
    pub stakes: Vec<StakeAmount>,

    /// Fast-path threshold as a percentage of total stake
    pub fast_threshold_pct: u64,

    /// Slow-path / notarize / skip threshold as a percentage of total stake
    pub slow_threshold_pct: u64,

    /// Number of consecutive slots assigned to one leader
    pub window_size: u64,

    /// Per-slot timeout on the logical clock, fixed at slot activation
    pub slot_timeout: TimeValue,

    /// Number of relays sampled per disseminated block
    pub fanout: usize,

    /// Erasure coding data shred count (K)
    pub data_shreds: usize,

    /// Erasure coding total shred count (N)
    pub total_shreds: usize,

    /// Consecutive skipped slots in a window before BadWindow is set
    pub bad_window_skip_trigger: u32,

    /// Validators simulated as Byzantine by the harness
    pub byzantine_validators: BTreeSet<ValidatorId>,

    /// Validators simulated as offline by the harness
    pub offline_validators: BTreeSet<ValidatorId>,

    /// Upper bound on simulated network delay
    pub max_network_delay: TimeValue,

    /// Seed for all randomized sampling; same seed, same execution
    pub seed: u64,
}

impl Config {
    /// Create a configuration with default protocol parameters and no
    /// validators; callers chain `with_validators` or `with_stakes`.
    pub fn new() -> Self {
        Self {
            validator_count: 0,
            stakes: Vec::new(),
            fast_threshold_pct: 80,
            slow_threshold_pct: 60,
            window_size: 4,
            slot_timeout: 100,
            fanout: 3,
            data_shreds: 2,
            total_shreds: 4,
            bad_window_skip_trigger: 2,
            byzantine_validators: BTreeSet::new(),
            offline_validators: BTreeSet::new(),
            max_network_delay: 5,
            seed: 42,
        }
    }

    /// Set the validator count with an equal stake distribution.
    pub fn with_validators(mut self, count: usize) -> Self {
        self.validator_count = count;
        self.stakes = vec![1000; count];
        self.fanout = recommended_fanout(count, 0.8).min(count.saturating_sub(1)).max(1);
        self
    }

    /// Set an explicit stake distribution, one entry per validator.
    pub fn with_stakes(mut self, stakes: Vec<StakeAmount>) -> Self {
        self.validator_count = stakes.len();
        self.stakes = stakes;
        self.fanout = recommended_fanout(self.validator_count, 0.8)
            .min(self.validator_count.saturating_sub(1))
            .max(1);
        self
    }

    /// Override the finalization thresholds (percent of total stake).
    pub fn with_thresholds(mut self, fast_pct: u64, slow_pct: u64) -> Self {
        self.fast_threshold_pct = fast_pct;
        self.slow_threshold_pct = slow_pct;
        self
    }

    /// Set the leader window size in slots.
    pub fn with_window_size(mut self, window_size: u64) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the per-slot timeout.
    pub fn with_slot_timeout(mut self, timeout: TimeValue) -> Self {
        self.slot_timeout = timeout;
        self
    }

    /// Set the erasure coding parameters: any K of N shreds reconstruct.
    pub fn with_erasure_coding(mut self, k: usize, n: usize) -> Self {
        self.data_shreds = k;
        self.total_shreds = n;
        self
    }

    /// Set the relay fanout explicitly.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Mark a subset of validators Byzantine for adversarial simulation.
    pub fn with_byzantine_validators(mut self, validators: BTreeSet<ValidatorId>) -> Self {
        self.byzantine_validators = validators;
        self
    }

    /// Mark a subset of validators offline for adversarial simulation.
    pub fn with_offline_validators(mut self, validators: BTreeSet<ValidatorId>) -> Self {
        self.offline_validators = validators;
        self
    }

    /// Set the simulated network delay bound.
    pub fn with_max_network_delay(mut self, delay: TimeValue) -> Self {
        self.max_network_delay = delay;
        self
    }

    /// Set the sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Total stake across the epoch.
    pub fn total_stake(&self) -> StakeAmount {
        self.stakes.iter().sum()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.validator_count == 0 {
            return Err(ConsensusError::InvalidConfig("validator count must be positive".into()));
        }
        if self.stakes.len() != self.validator_count {
            return Err(ConsensusError::InvalidConfig(
                "stake distribution must have one entry per validator".into(),
            ));
        }
        if self.total_stake() == 0 {
            return Err(ConsensusError::InvalidConfig("total stake must be positive".into()));
        }
        if self.fast_threshold_pct <= self.slow_threshold_pct {
            return Err(ConsensusError::InvalidConfig(
                "fast threshold must exceed slow threshold".into(),
            ));
        }
        if self.slow_threshold_pct <= 50 || self.fast_threshold_pct > 100 {
            return Err(ConsensusError::InvalidConfig(
                "thresholds must satisfy 50 < slow < fast <= 100".into(),
            ));
        }
        if self.data_shreds == 0 || self.total_shreds <= self.data_shreds {
            return Err(ConsensusError::InvalidConfig(
                "erasure coding requires 0 < K < N".into(),
            ));
        }
        if self.total_shreds > 255 {
            return Err(ConsensusError::InvalidConfig(
                "erasure coding supports at most 255 shreds".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(ConsensusError::InvalidConfig("window size must be positive".into()));
        }
        if self.slot_timeout == 0 {
            return Err(ConsensusError::InvalidConfig("slot timeout must be positive".into()));
        }
        if self.fanout == 0 || self.fanout >= self.validator_count {
            return Err(ConsensusError::InvalidConfig(
                "fanout must be positive and leave room for the leader".into(),
            ));
        }
        if let Some(id) = self
            .byzantine_validators
            .iter()
            .chain(self.offline_validators.iter())
            .find(|id| **id as usize >= self.validator_count)
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "validator {id} out of range"
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().with_validators(4)
    }
}

/// Cross-validator property predicates.
///
/// The verification harness collects certificates and finalization records
/// from every validator instance and checks these predicates over the union;
/// each corresponds to one of the protocol's testable properties.
pub mod properties {
    use super::*;
    use std::collections::HashMap;

    /// At most one finalizing certificate exists per slot, and all finalizing
    /// certificates for a slot reference the same block.
    pub fn certificate_uniqueness(certs: &[Certificate]) -> bool {
        let mut finalized: HashMap<Slot, BlockHash> = HashMap::new();
        for cert in certs.iter().filter(|c| c.kind.is_finalizing()) {
            let Some(block) = cert.block else { return false };
            match finalized.get(&cert.slot) {
                Some(existing) if *existing != block => return false,
                _ => {
                    finalized.insert(cert.slot, block);
                }
            }
        }
        true
    }

    /// No validator contributes stake to certificates for two different
    /// blocks under the same `(slot, kind, round)`.
    pub fn non_equivocation(certs: &[Certificate]) -> bool {
        let mut seen: HashMap<(Slot, CertificateKind, Round, ValidatorId), Option<BlockHash>> =
            HashMap::new();
        for cert in certs {
            for voter in &cert.validators {
                let key = (cert.slot, cert.kind, cert.round, *voter);
                match seen.get(&key) {
                    Some(block) if *block != cert.block => return false,
                    _ => {
                        seen.insert(key, cert.block);
                    }
                }
            }
        }
        true
    }

    /// All finalized records for a slot agree on the block across validators.
    pub fn no_conflicting_finalization(records: &[(Slot, FinalizationRecord)]) -> bool {
        let mut finalized: HashMap<Slot, BlockHash> = HashMap::new();
        for (slot, record) in records {
            if let Some(block) = record.finalized_block() {
                match finalized.get(slot) {
                    Some(existing) if *existing != block => return false,
                    _ => {
                        finalized.insert(*slot, block);
                    }
                }
            }
        }
        true
    }

    /// Every terminal slot reached its terminal state within `bound` logical
    /// time of activation.
    pub fn bounded_finalization(latencies: &[TimeValue], bound: TimeValue) -> bool {
        latencies.iter().all(|latency| *latency <= bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.validator_count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_empty_validator_set() {
        assert!(Config::new().validate().is_err());
    }

    #[test]
    fn config_rejects_inverted_thresholds() {
        let config = Config::new().with_validators(4).with_thresholds(60, 80);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_low_slow_threshold() {
        // A slow threshold at or below 50% breaks the stake-overlap argument.
        let config = Config::new().with_validators(4).with_thresholds(80, 50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_degenerate_erasure_coding() {
        let config = Config::new().with_validators(4).with_erasure_coding(4, 4);
        assert!(config.validate().is_err());
        let config = Config::new().with_validators(4).with_erasure_coding(0, 4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn stakes_follow_distribution() {
        let config = Config::new().with_stakes(vec![30, 25, 20, 15, 10]);
        assert_eq!(config.validator_count, 5);
        assert_eq!(config.total_stake(), 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn payload_hash_is_stable_and_discriminating() {
        let a = payload_hash(b"block a");
        assert_eq!(a, payload_hash(b"block a"));
        assert_ne!(a, payload_hash(b"block b"));
    }

    #[test]
    fn block_identity_derives_from_payload() {
        let block = Block::new(3, 1, 0, b"payload".to_vec());
        assert_eq!(block.hash, payload_hash(b"payload"));
        assert_eq!(block.slot, 3);
    }
}
