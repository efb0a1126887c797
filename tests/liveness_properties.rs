//! Liveness and bounded-finalization properties.
//!
//! With responsive stake above the thresholds and a synchronizing network,
//! every slot reaches a terminal state — and does so inside the explicit
//! `min(δ_80%, 2·δ_60%)` budget, not just eventually.

mod common;
use common::*;

use alpenglow_core::{
    finalization_bound, properties, CertificateKind, Cluster, FinalizationRecord,
};

#[test]
fn fast_path_finalizes_within_one_round() {
    init_tracing();
    // Unit delay: one full vote exchange per tick, so the single-round fast
    // path always completes before any second-round vote can land.
    let config = example_config().with_max_network_delay(1);
    let mut cluster = Cluster::new(&config).unwrap();

    run_proposed_slot(&mut cluster, 0, 0, b"all hands on deck", 60).unwrap();

    // 100% responsive stake: single-round fast finalization everywhere.
    let records = cluster.records_of(0);
    let block = records[0].finalized_block().expect("slot 0 finalized");
    for record in records {
        assert_eq!(record, FinalizationRecord::FastFinalized(block));
    }

    let delta = round_delta(&config);
    let bound = finalization_bound(delta, delta);
    assert!(
        properties::bounded_finalization(&cluster.terminal_latencies(), bound),
        "latencies {:?} exceed bound {bound}",
        cluster.terminal_latencies()
    );
}

#[test]
fn slow_path_finalizes_between_sixty_and_eighty_percent() {
    init_tracing();
    // Validators 3 and 4 offline: 75% responsive stake, below the fast
    // threshold but above the slow one.
    let config = example_config()
        .with_max_network_delay(1)
        .with_offline_validators([3, 4].into());
    let mut cluster = Cluster::new(&config).unwrap();

    run_proposed_slot(&mut cluster, 0, 0, b"three of five", 80).unwrap();

    let records = cluster.records_of(0);
    let block = records[0].finalized_block().expect("slot 0 finalized");
    for record in records {
        assert_eq!(record, FinalizationRecord::SlowFinalized(block));
    }
    // The fast path was out of reach: no fast certificate anywhere.
    assert!(cluster
        .all_certificates()
        .iter()
        .all(|cert| cert.kind != CertificateKind::FinalizeFast));

    let delta = round_delta(&config);
    let bound = finalization_bound(delta, delta);
    assert!(
        properties::bounded_finalization(&cluster.terminal_latencies(), bound),
        "latencies {:?} exceed bound {bound}",
        cluster.terminal_latencies()
    );
}

#[test]
fn silent_leader_is_skipped() {
    init_tracing();
    let probe = Cluster::new(&example_config()).unwrap();
    let leader = probe.leader_of(0);
    let config = example_config().with_offline_validators([leader].into());
    let mut cluster = Cluster::new(&config).unwrap();

    // Nobody proposes; the slot times out and the responsive 70% skip it.
    cluster.begin_slot(0).unwrap();
    run(&mut cluster, config.slot_timeout + 20).unwrap();

    for record in cluster.records_of(0) {
        assert_eq!(record, FinalizationRecord::Skipped);
    }
}

#[test]
fn bad_window_accelerates_skipping() {
    init_tracing();
    let config = example_config();
    let mut cluster = Cluster::new(&config).unwrap();

    // Two unproposed slots in window zero: both time out, flagging the window.
    for slot in [0u64, 1] {
        cluster.begin_slot(slot).unwrap();
        run(&mut cluster, config.slot_timeout + 20).unwrap();
        for record in cluster.records_of(slot) {
            assert_eq!(record, FinalizationRecord::Skipped);
        }
    }

    // The third slot of the flagged window is skipped pre-emptively, long
    // before its timeout could fire.
    let before = cluster.now();
    cluster.begin_slot(2).unwrap();
    run(&mut cluster, 20).unwrap();
    assert!(cluster.now() - before < config.slot_timeout);
    for record in cluster.records_of(2) {
        assert_eq!(record, FinalizationRecord::Skipped);
    }

    // The next window belongs to a fresh leader and proposals finalize again.
    run_proposed_slot(&mut cluster, 4, 0, b"new window", 60).unwrap();
    for record in cluster.records_of(4) {
        assert!(record.finalized_block().is_some(), "slot 4 stuck at {record:?}");
    }
}

#[test]
fn progress_spans_multiple_windows() {
    init_tracing();
    let config = example_config();
    let mut cluster = Cluster::new(&config).unwrap();

    let mut parent = 0;
    for slot in 0..6u64 {
        run_proposed_slot(&mut cluster, slot, parent, format!("block {slot}").as_bytes(), 60)
            .unwrap();
        let record = cluster.records_of(slot)[0];
        parent = record.finalized_block().unwrap_or_else(|| panic!("slot {slot} not finalized"));
    }

    // Six consecutive slots across two leader windows, all finalized and
    // consistent on every node.
    assert!(properties::no_conflicting_finalization(&cluster.finalization_records()));
    for slot in 0..6u64 {
        for record in cluster.records_of(slot) {
            assert!(record.finalized_block().is_some());
        }
    }
}

#[test]
fn delayed_majority_still_finalizes() {
    init_tracing();
    // Everyone honest, but the network is slower; liveness only needs
    // eventual synchrony, so finalization just takes more rounds.
    let config = example_config().with_max_network_delay(6);
    let mut cluster = Cluster::new(&config).unwrap();

    run_proposed_slot(&mut cluster, 0, 0, b"slow wire", 90).unwrap();

    let records = cluster.records_of(0);
    let block = records[0].finalized_block().expect("slot 0 finalized");
    for record in records {
        assert_eq!(record.finalized_block(), Some(block));
    }
}
