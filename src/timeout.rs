//! # Timeout Clock
//!
//! Per-slot deadlines on a logical clock. A slot's deadline is fixed when the
//! slot becomes active and is never moved by partial progress — receiving
//! some but not enough votes does not buy a leader more time, which keeps the
//! worst-case finalization bound provable. Expiry is a discrete event handed
//! to the caller by `advance`, never a background timer, so executions replay
//! deterministically.

use crate::{Slot, TimeValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Discrete expiry event for one slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeoutEvent {
    /// The expired slot
    pub slot: Slot,
    /// The deadline that passed
    pub deadline: TimeValue,
}

/// Logical clock with fixed per-slot deadlines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutClock {
    timeout: TimeValue,
    now: TimeValue,
    deadlines: BTreeMap<Slot, TimeValue>,
    fired: BTreeSet<Slot>,
}

impl TimeoutClock {
    /// Create a clock with the given per-slot timeout.
    pub fn new(timeout: TimeValue) -> Self {
        Self { timeout, now: 0, deadlines: BTreeMap::new(), fired: BTreeSet::new() }
    }

    /// Current logical time.
    pub fn now(&self) -> TimeValue {
        self.now
    }

    /// Fix a slot's deadline at `now + timeout`. Re-activation is a no-op;
    /// the first deadline stands.
    pub fn activate(&mut self, slot: Slot) {
        let deadline = self.now + self.timeout;
        self.deadlines.entry(slot).or_insert(deadline);
    }

    /// The slot's deadline, if it was activated.
    pub fn deadline_of(&self, slot: Slot) -> Option<TimeValue> {
        self.deadlines.get(&slot).copied()
    }

    /// Suppress the expiry of a slot that already reached a terminal state.
    pub fn cancel(&mut self, slot: Slot) {
        self.fired.insert(slot);
    }

    /// Advance logical time and return every expiry crossed, oldest deadline
    /// first. Each slot fires at most once.
    pub fn advance(&mut self, duration: TimeValue) -> Vec<TimeoutEvent> {
        self.now += duration;
        let mut expired: Vec<TimeoutEvent> = self
            .deadlines
            .iter()
            .filter(|(slot, deadline)| **deadline <= self.now && !self.fired.contains(slot))
            .map(|(slot, deadline)| TimeoutEvent { slot: *slot, deadline: *deadline })
            .collect();
        expired.sort_by_key(|event| (event.deadline, event.slot));
        for event in &expired {
            self.fired.insert(event.slot);
            debug!(slot = event.slot, deadline = event.deadline, "slot timeout expired");
        }
        expired
    }
}
