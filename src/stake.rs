//! # Stake Table
//!
//! Immutable per-epoch mapping of validator to stake weight. Every threshold
//! comparison and every sampling decision in the core is parameterized by this
//! table; it is shared read-only across components for the whole epoch.

use crate::{Config, ConsensusError, ConsensusResult, StakeAmount, ValidatorId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Validator → stake mapping for one epoch.
///
/// Backed by an insertion-ordered map so that cumulative-stake walks (leader
/// selection, relay sampling) iterate in the same order on every validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeTable {
    stakes: IndexMap<ValidatorId, StakeAmount>,
    total: StakeAmount,
}

impl StakeTable {
    /// Build the epoch stake table from a validated configuration.
    pub fn from_config(config: &Config) -> ConsensusResult<Self> {
        config.validate()?;
        let mut stakes = IndexMap::with_capacity(config.validator_count);
        for (id, stake) in config.stakes.iter().enumerate() {
            stakes.insert(id as ValidatorId, *stake);
        }
        let total = config.total_stake();
        Ok(Self { stakes, total })
    }

    /// Stake held by `validator`, zero for unknown ids.
    pub fn stake_of(&self, validator: ValidatorId) -> StakeAmount {
        self.stakes.get(&validator).copied().unwrap_or(0)
    }

    /// Fixed denominator for all percentage thresholds.
    pub fn total_stake(&self) -> StakeAmount {
        self.total
    }

    /// Number of validators in the epoch.
    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    /// Whether the epoch has no validators.
    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    /// Validator ids in table order.
    pub fn validators(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.stakes.keys().copied()
    }

    /// `(validator, stake)` pairs in table order.
    pub fn entries(&self) -> impl Iterator<Item = (ValidatorId, StakeAmount)> + '_ {
        self.stakes.iter().map(|(id, stake)| (*id, *stake))
    }

    /// Sum the stake of a set of validators, counting each id once.
    pub fn sum_stake<I>(&self, validators: I) -> StakeAmount
    where
        I: IntoIterator<Item = ValidatorId>,
    {
        let mut seen = std::collections::BTreeSet::new();
        validators
            .into_iter()
            .filter(|id| seen.insert(*id))
            .map(|id| self.stake_of(id))
            .sum()
    }

    /// Whether `stake` meets `pct` percent of total stake. Widened to 128-bit
    /// so large epoch totals cannot overflow the comparison.
    pub fn meets_threshold(&self, stake: StakeAmount, pct: u64) -> bool {
        u128::from(stake) * 100 >= u128::from(self.total) * u128::from(pct)
    }

    /// Fraction of total stake held by `stake`, for diagnostics.
    pub fn fraction(&self, stake: StakeAmount) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            stake as f64 / self.total as f64
        }
    }

    /// Map a point in `[0, total)` onto a validator by cumulative stake.
    /// The walk order is the table order, so the mapping is identical on
    /// every validator holding the same epoch table.
    pub fn validator_at(&self, point: StakeAmount) -> ConsensusResult<ValidatorId> {
        let mut cumulative = 0;
        for (id, stake) in self.entries() {
            cumulative += stake;
            if point < cumulative {
                return Ok(id);
            }
        }
        Err(ConsensusError::InvalidConfig(format!(
            "stake point {point} beyond total {}",
            self.total
        )))
    }
}
