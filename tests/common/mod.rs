//! Shared helpers for the integration suites.

#![allow(dead_code)]

use alpenglow_core::{Cluster, Config, ConsensusResult, Slot, TimeValue};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The reference configuration used across the suites: five validators with
/// stakes 30/25/20/15/10 (total 100), tight network delays, fixed seed.
pub fn example_config() -> Config {
    Config::new()
        .with_stakes(vec![30, 25, 20, 15, 10])
        .with_max_network_delay(2)
        .with_seed(42)
}

/// Drive one proposed slot to quiescence: activate it everywhere, let the
/// leader propose, then run the cluster.
pub fn run_proposed_slot(
    cluster: &mut Cluster,
    slot: Slot,
    parent: u64,
    payload: &[u8],
    ticks: u64,
) -> ConsensusResult<()> {
    cluster.begin_slot(slot)?;
    cluster.propose(slot, parent, payload.to_vec())?;
    run(cluster, ticks)
}

/// Step the cluster `ticks` times with unit ticks.
pub fn run(cluster: &mut Cluster, ticks: u64) -> ConsensusResult<()> {
    for _ in 0..ticks {
        cluster.step(1)?;
    }
    Ok(())
}

/// A latency budget for one voting round in the simulated network: shred
/// fan-out, relay re-broadcast and one vote exchange each take at most one
/// network delay.
pub fn round_delta(config: &Config) -> TimeValue {
    4 * config.max_network_delay
}
