//! # Leader Schedule and Window Management
//!
//! Slots are grouped into contiguous windows of `window_size` slots, each
//! assigned to one leader. Leader assignment is a deterministic function of
//! the epoch stake table and the window index — a stake-weighted round-robin
//! with no hidden randomness — so every validator computes the same schedule
//! without communication.
//!
//! The window manager watches finalization events for the BadWindow
//! heuristic: a configurable number of consecutive skipped slots flags the
//! window's leader as unavailable or Byzantine. Flagged leaders keep their
//! place in the rotation (the flag is a heuristic, not a proof of fault), but
//! validators pre-emptively skip the flagged window's remaining slots instead
//! of waiting out each timeout.

use crate::stake::StakeTable;
use crate::votor::FinalizationEvent;
use crate::{ConsensusError, ConsensusResult, Slot, ValidatorId, WindowIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Multiplier scrambling window indices across the cumulative stake line.
const WINDOW_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Deterministic leader assignment for an epoch.
#[derive(Debug, Clone)]
pub struct LeaderSchedule {
    stake: Arc<StakeTable>,
    window_size: u64,
}

impl LeaderSchedule {
    /// Create the schedule over the epoch stake table.
    pub fn new(stake: Arc<StakeTable>, window_size: u64) -> Self {
        Self { stake, window_size }
    }

    /// Window containing `slot`.
    pub fn window_of(&self, slot: Slot) -> WindowIndex {
        slot / self.window_size
    }

    /// The slot range of a window.
    pub fn window_slots(&self, window: WindowIndex) -> Range<Slot> {
        let start = window * self.window_size;
        start..start + self.window_size
    }

    /// Leader of a window: the window index is scrambled onto the cumulative
    /// stake line, so leadership frequency is proportional to stake and the
    /// assignment is reproducible from public state alone.
    pub fn leader_for_window(&self, window: WindowIndex) -> ValidatorId {
        let point = window.wrapping_mul(WINDOW_MIX) % self.stake.total_stake();
        match self.stake.validator_at(point) {
            Ok(leader) => leader,
            // point < total holds by construction; keep the schedule total anyway.
            Err(_) => self.stake.validators().next().unwrap_or(0),
        }
    }

    /// Leader of the window containing `slot`.
    pub fn leader_for_slot(&self, slot: Slot) -> ValidatorId {
        self.leader_for_window(self.window_of(slot))
    }

    /// Reject a block whose proposer does not own the slot's window.
    pub fn verify_proposer(&self, slot: Slot, proposer: ValidatorId) -> ConsensusResult<()> {
        let expected = self.leader_for_slot(slot);
        if proposer == expected {
            Ok(())
        } else {
            Err(ConsensusError::ScheduleViolation { slot, expected, actual: proposer })
        }
    }
}

/// Observed state of one leader window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WindowState {
    /// The window's leader
    pub leader: ValidatorId,
    /// Current run of consecutively skipped slots
    pub consecutive_skips: u32,
    /// Whether the window is flagged as failing
    pub bad_window: bool,
}

/// Tracks repeated non-finalization per window and raises the BadWindow flag.
#[derive(Debug, Clone)]
pub struct WindowManager {
    skip_trigger: u32,
    windows: BTreeMap<WindowIndex, WindowState>,
}

impl WindowManager {
    /// Create a manager that flags a window after `skip_trigger` consecutive
    /// skipped slots.
    pub fn new(skip_trigger: u32) -> Self {
        Self { skip_trigger, windows: BTreeMap::new() }
    }

    /// Consume a finalization event and update the slot's window.
    pub fn observe(&mut self, schedule: &LeaderSchedule, event: &FinalizationEvent) {
        let slot = match event {
            FinalizationEvent::Notarized { .. } => return,
            FinalizationEvent::Finalized { slot, .. } | FinalizationEvent::Skipped { slot } => *slot,
        };
        let window = schedule.window_of(slot);
        let state = self.windows.entry(window).or_insert_with(|| WindowState {
            leader: schedule.leader_for_window(window),
            consecutive_skips: 0,
            bad_window: false,
        });

        match event {
            FinalizationEvent::Skipped { .. } => {
                state.consecutive_skips += 1;
                if state.consecutive_skips >= self.skip_trigger && !state.bad_window {
                    state.bad_window = true;
                    warn!(window, leader = state.leader, "window flagged as bad");
                }
            }
            FinalizationEvent::Finalized { .. } => {
                if state.consecutive_skips > 0 {
                    debug!(window, "skip streak reset by finalization");
                }
                state.consecutive_skips = 0;
            }
            FinalizationEvent::Notarized { .. } => {}
        }
    }

    /// Whether a window carries the BadWindow flag.
    pub fn is_bad_window(&self, window: WindowIndex) -> bool {
        self.windows.get(&window).is_some_and(|state| state.bad_window)
    }

    /// Whether a validator should pre-emptively skip `slot` rather than wait
    /// for its timeout: the slot's window is flagged, so its leader's
    /// remaining slots converge to `Skipped` immediately. A liveness
    /// optimization only; safety never depends on it.
    pub fn should_preempt(&self, schedule: &LeaderSchedule, slot: Slot) -> bool {
        self.is_bad_window(schedule.window_of(slot))
    }

    /// Observed state of a window, if any of its slots terminated.
    pub fn window_state(&self, window: WindowIndex) -> Option<&WindowState> {
        self.windows.get(&window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::votor::FinalizationPath;
    use crate::Config;

    fn schedule(stakes: Vec<u64>, window_size: u64) -> LeaderSchedule {
        let config = Config::new().with_stakes(stakes);
        LeaderSchedule::new(Arc::new(StakeTable::from_config(&config).unwrap()), window_size)
    }

    #[test]
    fn leader_assignment_is_reproducible() {
        let a = schedule(vec![30, 25, 20, 15, 10], 4);
        let b = schedule(vec![30, 25, 20, 15, 10], 4);
        for window in 0..50 {
            assert_eq!(a.leader_for_window(window), b.leader_for_window(window));
        }
    }

    #[test]
    fn rotation_reaches_multiple_leaders() {
        let schedule = schedule(vec![30, 25, 20, 15, 10], 4);
        let leaders: std::collections::BTreeSet<ValidatorId> =
            (0..100).map(|w| schedule.leader_for_window(w)).collect();
        assert!(leaders.len() > 1, "rotation stuck on one leader");
    }

    #[test]
    fn slots_map_to_windows() {
        let schedule = schedule(vec![100; 4], 4);
        assert_eq!(schedule.window_of(0), 0);
        assert_eq!(schedule.window_of(3), 0);
        assert_eq!(schedule.window_of(4), 1);
        assert_eq!(schedule.window_slots(2), 8..12);
        let leader = schedule.leader_for_window(1);
        for slot in schedule.window_slots(1) {
            assert_eq!(schedule.leader_for_slot(slot), leader);
        }
    }

    #[test]
    fn foreign_proposer_is_a_schedule_violation() {
        let schedule = schedule(vec![100; 4], 4);
        let leader = schedule.leader_for_slot(0);
        assert!(schedule.verify_proposer(0, leader).is_ok());
        let intruder = (leader + 1) % 4;
        let err = schedule.verify_proposer(0, intruder).unwrap_err();
        assert!(matches!(err, ConsensusError::ScheduleViolation { slot: 0, .. }));
    }

    #[test]
    fn bad_window_after_consecutive_skips() {
        let schedule = schedule(vec![100; 4], 4);
        let mut manager = WindowManager::new(2);
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 0 });
        assert!(!manager.is_bad_window(0));
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 1 });
        assert!(manager.is_bad_window(0));
        assert!(manager.should_preempt(&schedule, 2));
        // Other windows are unaffected; rotation continues through the flagged leader.
        assert!(!manager.should_preempt(&schedule, 4));
    }

    #[test]
    fn finalization_resets_the_skip_streak() {
        let schedule = schedule(vec![100; 4], 4);
        let mut manager = WindowManager::new(2);
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 0 });
        manager.observe(
            &schedule,
            &FinalizationEvent::Finalized { slot: 1, block: 9, path: FinalizationPath::Fast },
        );
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 2 });
        assert!(!manager.is_bad_window(0));
        assert_eq!(manager.window_state(0).unwrap().consecutive_skips, 1);
    }

    #[test]
    fn notarization_does_not_touch_the_streak() {
        let schedule = schedule(vec![100; 4], 4);
        let mut manager = WindowManager::new(2);
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 0 });
        manager.observe(&schedule, &FinalizationEvent::Notarized { slot: 1, block: 3, round: 1 });
        manager.observe(&schedule, &FinalizationEvent::Skipped { slot: 1 });
        assert!(manager.is_bad_window(0));
    }
}
