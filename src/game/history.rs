//! Recorded combatant positions for lag-compensated rewind

use std::collections::{HashMap, VecDeque};

use glam::Vec3;

use crate::util::time::TimeMs;

use super::capabilities::PositionHistory;
use super::weapon::CombatantId;

/// How far back positions are kept by default
pub const DEFAULT_HISTORY_MS: TimeMs = 1_000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    time: TimeMs,
    position: Vec3,
}

/// Ring of recent positions per combatant
#[derive(Debug, Clone)]
pub struct PositionRecorder {
    samples: HashMap<CombatantId, VecDeque<Sample>>,
    max_age_ms: TimeMs,
}

impl PositionRecorder {
    pub fn new(max_age_ms: TimeMs) -> Self {
        Self {
            samples: HashMap::new(),
            max_age_ms,
        }
    }

    /// Record a position; samples must arrive in time order per combatant
    pub fn record(&mut self, combatant: CombatantId, time: TimeMs, position: Vec3) {
        let ring = self.samples.entry(combatant).or_default();
        if let Some(last) = ring.back_mut() {
            if last.time == time {
                last.position = position;
                return;
            }
            if last.time > time {
                return;
            }
        }
        ring.push_back(Sample { time, position });

        let horizon = time.saturating_sub(self.max_age_ms);
        // Keep one sample older than the horizon so rewinds to the edge interpolate
        while ring.len() > 2 && ring[1].time <= horizon {
            ring.pop_front();
        }
    }

    pub fn forget(&mut self, combatant: &CombatantId) {
        self.samples.remove(combatant);
    }

    pub fn sample_count(&self, combatant: &CombatantId) -> usize {
        self.samples.get(combatant).map(VecDeque::len).unwrap_or(0)
    }
}

impl Default for PositionRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_MS)
    }
}

impl PositionHistory for PositionRecorder {
    fn position_at(&self, combatant: CombatantId, time: TimeMs) -> Option<Vec3> {
        let ring = self.samples.get(&combatant)?;
        let first = ring.front()?;
        let last = ring.back()?;

        if time <= first.time {
            return Some(first.position);
        }
        if time >= last.time {
            return Some(last.position);
        }

        // First sample strictly after `time`; the one before brackets it
        let after_idx = ring.partition_point(|s| s.time <= time);
        let before = ring[after_idx - 1];
        let after = ring[after_idx];
        let span = (after.time - before.time) as f32;
        let alpha = (time - before.time) as f32 / span;
        Some(before.position.lerp(after.position, alpha))
    }
}
