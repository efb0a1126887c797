//! # Rotor: Erasure-Coded Block Dissemination
//!
//! The window leader erasure-codes each block payload into `N` shreds of
//! which any `K` reconstruct, then deals the shreds round-robin over a relay
//! set drawn by stake-weighted sampling. A validator reconstructs the block
//! once it holds `K` distinct shreds, regardless of which relays they came
//! from, and hands the block to Votor as a notarize-eligible candidate.
//!
//! Reconstruction tolerates up to `N − K` lost or withheld shreds; with
//! stake-weighted relays and ≤20% faulty stake the expected number of honest
//! deliveries exceeds `K` for any fanout sized per
//! [`recommended_fanout`](crate::sampling::recommended_fanout). A validator
//! that never reaches `K` shreds by the slot timeout reports a
//! reconstruction failure and leaves the slot eligible only for skip.

use crate::sampling::StakeWeightedSampler;
use crate::stake::StakeTable;
use crate::{payload_hash, Block, BlockHash, ConsensusError, ConsensusResult, Slot, ValidatorId};
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// One erasure-coded fragment of a block payload.
///
/// Shreds carry enough metadata to rebuild the block without any side
/// channel; the payload digest doubles as the block identity the shred
/// belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Shred {
    /// Slot of the block being disseminated
    pub slot: Slot,
    /// Digest of the full block payload
    pub block: BlockHash,
    /// Parent hash carried for block reconstruction
    pub parent: BlockHash,
    /// Leader that produced the block
    pub proposer: ValidatorId,
    /// Shred index in `0..total`
    pub index: u32,
    /// Total number of shreds for this block
    pub total: u32,
    /// This fragment's shard bytes
    pub shard: Vec<u8>,
}

/// Relay set and per-relay shred indices for one disseminated block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayAssignment {
    /// Slot of the disseminated block
    pub slot: Slot,
    /// Digest of the disseminated block
    pub block: BlockHash,
    /// Sampled relays in selection order
    pub relays: Vec<ValidatorId>,
    /// Shred indices each relay forwards
    pub shreds_by_relay: Vec<(ValidatorId, SmallVec<[u32; 4]>)>,
}

impl RelayAssignment {
    /// Shred indices assigned to one relay.
    pub fn indices_for(&self, relay: ValidatorId) -> &[u32] {
        self.shreds_by_relay
            .iter()
            .find(|(id, _)| *id == relay)
            .map(|(_, indices)| indices.as_slice())
            .unwrap_or(&[])
    }
}

/// Per-validator dissemination and reconstruction state.
#[derive(Debug, Clone)]
pub struct Rotor {
    stake: Arc<StakeTable>,
    sampler: StakeWeightedSampler,
    data_shreds: usize,
    total_shreds: usize,
    fanout: usize,
    /// Shreds collected per block, keyed by index to ignore duplicates.
    received: HashMap<(Slot, BlockHash), BTreeMap<u32, Shred>>,
    /// Blocks already reconstructed; further shreds are dropped.
    delivered: BTreeSet<(Slot, BlockHash)>,
}

impl Rotor {
    /// Create a Rotor instance over the epoch stake table.
    pub fn new(
        stake: Arc<StakeTable>,
        sampler: StakeWeightedSampler,
        data_shreds: usize,
        total_shreds: usize,
        fanout: usize,
    ) -> Self {
        Self {
            stake,
            sampler,
            data_shreds,
            total_shreds,
            fanout,
            received: HashMap::new(),
            delivered: BTreeSet::new(),
        }
    }

    fn coder(&self) -> ConsensusResult<ReedSolomon> {
        ReedSolomon::new(self.data_shreds, self.total_shreds - self.data_shreds)
            .map_err(|e| ConsensusError::InvalidConfig(format!("erasure coder: {e:?}")))
    }

    /// Erasure-code a block and sample its relay set.
    ///
    /// Called by the slot leader. The shreds are dealt round-robin over the
    /// relays; each relay forwards its indices to all validators.
    pub fn disseminate(&self, block: &Block) -> ConsensusResult<(Vec<Shred>, RelayAssignment)> {
        let shreds = self.encode(block)?;
        let relays =
            self.sampler
                .sample_relays(&self.stake, block.slot, block.proposer, self.fanout);

        let mut shreds_by_relay: Vec<(ValidatorId, SmallVec<[u32; 4]>)> =
            relays.iter().map(|relay| (*relay, SmallVec::new())).collect();
        if !shreds_by_relay.is_empty() {
            for shred in &shreds {
                let position = shred.index as usize % shreds_by_relay.len();
                shreds_by_relay[position].1.push(shred.index);
            }
        }

        debug!(
            slot = block.slot,
            block = block.hash,
            relays = relays.len(),
            shreds = shreds.len(),
            "block disseminated"
        );
        let assignment = RelayAssignment { slot: block.slot, block: block.hash, relays, shreds_by_relay };
        Ok((shreds, assignment))
    }

    /// Split a block payload into `K` data shards plus `N − K` parity shards.
    /// The payload is length-prefixed and zero-padded so the original bytes
    /// can be recovered exactly.
    fn encode(&self, block: &Block) -> ConsensusResult<Vec<Shred>> {
        let coder = self.coder()?;
        let mut buffer = (block.payload.len() as u64).to_le_bytes().to_vec();
        buffer.extend_from_slice(&block.payload);

        let shard_size = buffer.len().div_ceil(self.data_shreds).max(1);
        buffer.resize(self.data_shreds * shard_size, 0);

        let mut shards: Vec<Vec<u8>> =
            buffer.chunks(shard_size).map(<[u8]>::to_vec).collect();
        shards.resize(self.total_shreds, vec![0; shard_size]);
        coder
            .encode(&mut shards)
            .map_err(|e| ConsensusError::InvalidConfig(format!("erasure encode: {e:?}")))?;

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| Shred {
                slot: block.slot,
                block: block.hash,
                parent: block.parent,
                proposer: block.proposer,
                index: index as u32,
                total: self.total_shreds as u32,
                shard,
            })
            .collect())
    }

    /// Accept one shred, reconstructing the block once `K` distinct indices
    /// are held.
    ///
    /// Duplicate shreds and shreds for already-delivered blocks are ignored.
    /// A reconstruction that yields bytes not matching the advertised digest
    /// fails with `ReconstructionFailure`; the caller absorbs this and the
    /// slot stays pending.
    pub fn accept_shred(&mut self, shred: Shred) -> ConsensusResult<Option<Block>> {
        if shred.total as usize != self.total_shreds || shred.index as usize >= self.total_shreds {
            warn!(slot = shred.slot, index = shred.index, "shred with foreign geometry ignored");
            return Ok(None);
        }
        let key = (shred.slot, shred.block);
        if self.delivered.contains(&key) {
            return Ok(None);
        }

        let collected = self.received.entry(key).or_default();
        collected.entry(shred.index).or_insert(shred);
        if collected.len() < self.data_shreds {
            return Ok(None);
        }

        let block = self.reconstruct(key)?;
        self.delivered.insert(key);
        self.received.remove(&key);
        debug!(slot = block.slot, block = block.hash, "block reconstructed");
        Ok(Some(block))
    }

    /// Rebuild the block from collected shards.
    fn reconstruct(&self, key: (Slot, BlockHash)) -> ConsensusResult<Block> {
        let (slot, block_hash) = key;
        let collected = self.received.get(&key).ok_or(ConsensusError::ReconstructionFailure {
            slot,
            block: block_hash,
            have: 0,
            need: self.data_shreds,
        })?;
        let template = collected.values().next().ok_or(ConsensusError::ReconstructionFailure {
            slot,
            block: block_hash,
            have: 0,
            need: self.data_shreds,
        })?;
        let (parent, proposer) = (template.parent, template.proposer);

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.total_shreds];
        for (index, shred) in collected {
            shards[*index as usize] = Some(shred.shard.clone());
        }
        let coder = self.coder()?;
        coder.reconstruct(&mut shards).map_err(|_| ConsensusError::ReconstructionFailure {
            slot,
            block: block_hash,
            have: collected.len(),
            need: self.data_shreds,
        })?;

        let mut buffer = Vec::new();
        for shard in shards.into_iter().take(self.data_shreds).flatten() {
            buffer.extend_from_slice(&shard);
        }
        if buffer.len() < 8 {
            return Err(ConsensusError::ReconstructionFailure {
                slot,
                block: block_hash,
                have: self.data_shreds,
                need: self.data_shreds,
            });
        }
        let payload_len = u64::from_le_bytes(
            buffer[..8].try_into().unwrap_or_default(),
        ) as usize;
        if buffer.len() < 8 + payload_len {
            return Err(ConsensusError::ReconstructionFailure {
                slot,
                block: block_hash,
                have: self.data_shreds,
                need: self.data_shreds,
            });
        }
        let payload = buffer[8..8 + payload_len].to_vec();

        if payload_hash(&payload) != block_hash {
            warn!(slot, block = block_hash, "reconstructed payload does not match digest");
            return Err(ConsensusError::ReconstructionFailure {
                slot,
                block: block_hash,
                have: self.data_shreds,
                need: self.data_shreds,
            });
        }

        Ok(Block { slot, proposer, parent, hash: block_hash, payload })
    }

    /// Whether a block has been reconstructed and handed to Votor.
    pub fn is_delivered(&self, slot: Slot, block: BlockHash) -> bool {
        self.delivered.contains(&(slot, block))
    }

    /// Recompute the relay set for a slot. Sampling is keyed on the shared
    /// seed and the slot, so every validator derives the same set and a relay
    /// recognizes its own duty without being told.
    pub fn relays_for(&self, slot: Slot, proposer: ValidatorId) -> Vec<ValidatorId> {
        self.sampler.sample_relays(&self.stake, slot, proposer, self.fanout)
    }

    /// Drop incomplete shred buffers for a slot that timed out, reporting one
    /// `ReconstructionFailure` per abandoned block. The caller logs them; the
    /// slot proceeds toward skip.
    pub fn abandon_slot(&mut self, slot: Slot) -> Vec<ConsensusError> {
        let keys: Vec<(Slot, BlockHash)> =
            self.received.keys().filter(|(s, _)| *s == slot).copied().collect();
        keys.into_iter()
            .map(|key| {
                let have = self.received.remove(&key).map(|c| c.len()).unwrap_or(0);
                ConsensusError::ReconstructionFailure {
                    slot,
                    block: key.1,
                    have,
                    need: self.data_shreds,
                }
            })
            .collect()
    }
}
