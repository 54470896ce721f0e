//! Controller-side resend queue for start/stop fire intents
//!
//! Every intent goes out once immediately and is then retransmitted from a
//! per-weapon pending list on a fixed drain interval until the authority's
//! acknowledged index covers it. Duplicate deliveries are harmless because the
//! authority's sequence window drops anything it has already accepted.

use std::collections::VecDeque;

use crate::util::time::TimeMs;

use super::scheduler::{Scheduler, TaskId};
use super::sequence::{SequenceIndex, RESYNC_SEQUENCE};
use super::weapon::{FireModeId, WeaponKind};

/// Copies of each intent appended to the pending list on emission
pub const RESEND_COPIES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireEventKind {
    Start,
    Stop,
}

/// One start/stop intent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireEventRecord {
    pub weapon: WeaponKind,
    pub fire_mode: FireModeId,
    pub kind: FireEventKind,
    pub sequence: SequenceIndex,
    /// Vertical view offset applied to the muzzle
    pub aux_offset: Option<f32>,
    /// The controller's own trace hit a combatant
    pub locally_hit: bool,
}

/// Pending intents for one weapon
#[derive(Debug)]
pub struct FireEventQueue {
    weapon: WeaponKind,
    pending: VecDeque<FireEventRecord>,
    last_issued: SequenceIndex,
    acknowledged: Option<SequenceIndex>,
    drain_timer: Option<TaskId>,
    drain_interval_ms: TimeMs,
}

impl FireEventQueue {
    pub fn new(weapon: WeaponKind, drain_interval_ms: TimeMs) -> Self {
        Self {
            weapon,
            pending: VecDeque::new(),
            // First issued index is 0
            last_issued: SequenceIndex(RESYNC_SEQUENCE - 1),
            acknowledged: None,
            drain_timer: None,
            drain_interval_ms: drain_interval_ms.max(1),
        }
    }

    pub fn weapon(&self) -> WeaponKind {
        self.weapon
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.drain_timer.is_some()
    }

    pub fn acknowledged(&self) -> Option<SequenceIndex> {
        self.acknowledged
    }

    pub fn last_issued(&self) -> SequenceIndex {
        self.last_issued
    }

    /// Reserve the next sequence index
    pub fn next_sequence(&mut self) -> SequenceIndex {
        self.last_issued = self.last_issued.next();
        self.last_issued
    }

    /// Build a record with a fresh sequence index
    pub fn record(
        &mut self,
        fire_mode: FireModeId,
        kind: FireEventKind,
        aux_offset: Option<f32>,
        locally_hit: bool,
    ) -> FireEventRecord {
        FireEventRecord {
            weapon: self.weapon,
            fire_mode,
            kind,
            sequence: self.next_sequence(),
            aux_offset,
            locally_hit,
        }
    }

    /// Queue resend copies of `record` and return it for immediate transmission
    pub fn emit<T: Clone>(
        &mut self,
        record: FireEventRecord,
        now: TimeMs,
        timers: &mut Scheduler<WeaponKind, T>,
        drain_task: T,
    ) -> FireEventRecord {
        for _ in 0..RESEND_COPIES {
            self.pending.push_back(record);
        }
        if self.drain_timer.is_none() {
            self.arm(now, timers, drain_task);
        }
        record
    }

    /// Drain timer fired: drop acknowledged entries and retransmit one.
    ///
    /// Re-arms the timer while entries remain.
    pub fn drain<T: Clone>(
        &mut self,
        now: TimeMs,
        timers: &mut Scheduler<WeaponKind, T>,
        drain_task: T,
    ) -> Option<FireEventRecord> {
        // The scheduler already consumed the task that got us here
        self.drain_timer = None;
        self.discard_acknowledged();

        let resend = self.pending.pop_front();
        self.discard_acknowledged();

        if !self.pending.is_empty() {
            self.arm(now, timers, drain_task);
        }
        resend
    }

    /// The authority's last accepted index for this weapon
    pub fn acknowledge<T>(&mut self, index: SequenceIndex, timers: &mut Scheduler<WeaponKind, T>) {
        if index.is_resync() {
            return;
        }
        let advances = match self.acknowledged {
            Some(current) => index.is_ahead_of(current),
            None => true,
        };
        if advances {
            self.acknowledged = Some(index);
        }
        self.discard_acknowledged();
        if self.pending.is_empty() {
            self.cancel_timer(timers);
        }
    }

    /// Drop everything and stop the timer (weapon switched, owner invalid)
    pub fn flush<T>(&mut self, timers: &mut Scheduler<WeaponKind, T>) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.cancel_timer(timers);
        dropped
    }

    /// Forget acknowledgement state after a resync
    pub fn reset_acknowledged(&mut self, index: SequenceIndex) {
        self.acknowledged = Some(index);
        self.last_issued = index;
    }

    fn discard_acknowledged(&mut self) {
        let Some(acked) = self.acknowledged else {
            return;
        };
        while self
            .pending
            .front()
            .is_some_and(|head| acked.covers(head.sequence))
        {
            self.pending.pop_front();
        }
    }

    fn arm<T>(&mut self, now: TimeMs, timers: &mut Scheduler<WeaponKind, T>, drain_task: T) {
        self.drain_timer = Some(timers.schedule(now, self.drain_interval_ms, self.weapon, drain_task));
    }

    fn cancel_timer<T>(&mut self, timers: &mut Scheduler<WeaponKind, T>) {
        if let Some(id) = self.drain_timer.take() {
            timers.cancel(id);
        }
    }
}
