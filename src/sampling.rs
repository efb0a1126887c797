//! # Stake-Weighted Sampling
//!
//! Seeded, deterministic sampling of validators proportional to stake,
//! without replacement. Rotor draws its relay sets from here; because the
//! generator is parameterized by an explicit configuration seed (never hidden
//! global state), every execution is exactly reproducible for verification.

use crate::stake::StakeTable;
use crate::{Slot, StakeAmount, ValidatorId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Tolerated probability that a block fails to reach a validator.
const DELIVERY_FAILURE_BOUND: f64 = 1e-3;

/// Relay fanout sized as `⌈ln(n/ε)/p_honest⌉`: enough stake-weighted relays
/// that the expected number of honest shred deliveries exceeds the
/// reconstruction threshold except with probability ε.
pub fn recommended_fanout(validator_count: usize, honest_fraction: f64) -> usize {
    if validator_count == 0 || honest_fraction <= 0.0 {
        return 1;
    }
    let n = validator_count as f64;
    ((n / DELIVERY_FAILURE_BOUND).ln() / honest_fraction).ceil() as usize
}

/// Deterministic stake-weighted sampler.
///
/// Each draw removes the selected validator from the pool, so a sample never
/// repeats a validator; selection probability at every step is proportional
/// to remaining stake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StakeWeightedSampler {
    seed: u64,
}

impl StakeWeightedSampler {
    /// Create a sampler from the configuration seed.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// The configured seed, reported back for replay.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Sample up to `count` relays for `slot`, excluding the leader.
    ///
    /// The RNG is keyed on `(seed, slot)`, so every validator holding the
    /// same epoch table computes the same relay set without communication.
    pub fn sample_relays(
        &self,
        stake: &StakeTable,
        slot: Slot,
        leader: ValidatorId,
        count: usize,
    ) -> Vec<ValidatorId> {
        let mut pool: Vec<(ValidatorId, StakeAmount)> = stake
            .entries()
            .filter(|(id, weight)| *id != leader && *weight > 0)
            .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(
            self.seed ^ slot.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        );

        let mut selected = Vec::with_capacity(count.min(pool.len()));
        while selected.len() < count && !pool.is_empty() {
            let remaining: StakeAmount = pool.iter().map(|(_, weight)| *weight).sum();
            let point = rng.gen_range(0..remaining);
            let mut cumulative = 0;
            let mut index = pool.len() - 1;
            for (i, (_, weight)) in pool.iter().enumerate() {
                cumulative += *weight;
                if point < cumulative {
                    index = i;
                    break;
                }
            }
            selected.push(pool.swap_remove(index).0);
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use proptest::prelude::*;

    fn table(stakes: Vec<StakeAmount>) -> StakeTable {
        StakeTable::from_config(&Config::new().with_stakes(stakes)).unwrap()
    }

    #[test]
    fn same_seed_same_relays() {
        let table = table(vec![30, 25, 20, 15, 10]);
        let a = StakeWeightedSampler::new(7).sample_relays(&table, 3, 0, 3);
        let b = StakeWeightedSampler::new(7).sample_relays(&table, 3, 0, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_decorrelate() {
        let table = table(vec![100; 20]);
        let a = StakeWeightedSampler::new(1).sample_relays(&table, 1, 0, 10);
        let b = StakeWeightedSampler::new(2).sample_relays(&table, 1, 0, 10);
        assert_ne!(a, b);
    }

    #[test]
    fn heavy_stake_dominates_selection() {
        let table = table(vec![900, 25, 25, 25, 25]);
        let sampler = StakeWeightedSampler::new(11);
        let hits = (0..200)
            .filter(|slot| sampler.sample_relays(&table, *slot, 4, 1).contains(&0))
            .count();
        // Validator 0 holds 90% of the non-leader stake.
        assert!(hits > 120, "heavy validator selected only {hits}/200 times");
    }

    #[test]
    fn fanout_formula_grows_with_cluster_size() {
        assert!(recommended_fanout(100, 0.8) > recommended_fanout(10, 0.8));
        assert!(recommended_fanout(10, 0.6) > recommended_fanout(10, 0.9));
        assert_eq!(recommended_fanout(0, 0.8), 1);
    }

    proptest! {
        #[test]
        fn relay_sets_are_valid(
            stakes in prop::collection::vec(1u64..1000, 2..12),
            seed in any::<u64>(),
            slot in 0u64..1000,
        ) {
            let table = table(stakes.clone());
            let leader = 0;
            let count = stakes.len() - 1;
            let relays = StakeWeightedSampler::new(seed)
                .sample_relays(&table, slot, leader, count);

            // Never the leader, never a duplicate, never more than requested.
            prop_assert!(!relays.contains(&leader));
            let mut unique = relays.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(unique.len(), relays.len());
            prop_assert!(relays.len() <= count);
        }
    }
}
