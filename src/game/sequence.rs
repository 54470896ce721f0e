//! Fire event sequence numbers on a ring of 256 values
//!
//! An index is "ahead" of the last accepted one when `(last - idx) mod 256`
//! falls outside `[0, 128)`. The half-open stale zone means an index exactly
//! 128 steps ahead is accepted, and one 129 steps ahead reads as 127 behind.

use serde::{Deserialize, Serialize};

use super::error::FireRejection;

/// Width of the backward-stale zone
pub const STALE_WINDOW: u8 = 128;

/// Reserved index that bypasses the acceptance window (full resync)
pub const RESYNC_SEQUENCE: u8 = u8::MAX;

/// One position on the sequence ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceIndex(pub u8);

impl SequenceIndex {
    pub const RESYNC: SequenceIndex = SequenceIndex(RESYNC_SEQUENCE);

    pub fn is_resync(self) -> bool {
        self.0 == RESYNC_SEQUENCE
    }

    /// Next index for the controller counter, skipping the reserved value
    pub fn next(self) -> SequenceIndex {
        let next = self.0.wrapping_add(1);
        if next == RESYNC_SEQUENCE {
            SequenceIndex(0)
        } else {
            SequenceIndex(next)
        }
    }

    /// Index the counter issued just before this one
    pub fn previous(self) -> SequenceIndex {
        match self.0 {
            0 => SequenceIndex(RESYNC_SEQUENCE - 1),
            n => SequenceIndex(n - 1),
        }
    }

    /// `self` is strictly ahead of `other` on the ring
    pub fn is_ahead_of(self, other: SequenceIndex) -> bool {
        other.0.wrapping_sub(self.0) >= STALE_WINDOW
    }

    /// `self` is `other` or ahead of it
    pub fn covers(self, other: SequenceIndex) -> bool {
        self.0.wrapping_sub(other.0) < STALE_WINDOW
    }
}

/// Authoritative acceptance state for one weapon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceWindow {
    last_accepted: SequenceIndex,
}

impl SequenceWindow {
    pub fn new(last_accepted: SequenceIndex) -> Self {
        Self { last_accepted }
    }

    pub fn last_accepted(&self) -> SequenceIndex {
        self.last_accepted
    }

    /// Accept `index` if it is ahead of the last accepted value.
    ///
    /// The resync sentinel is always accepted and leaves the window untouched.
    pub fn accept(&mut self, index: SequenceIndex) -> Result<(), FireRejection> {
        if index.is_resync() {
            return Ok(());
        }
        if !index.is_ahead_of(self.last_accepted) {
            return Err(FireRejection::StaleEvent {
                index: index.0,
                last_accepted: self.last_accepted.0,
            });
        }
        self.last_accepted = index;
        Ok(())
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        // The controller's first index is 0, which must read as ahead.
        Self::new(SequenceIndex(RESYNC_SEQUENCE - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(v: u8) -> SequenceIndex {
        SequenceIndex(v)
    }

    #[test]
    fn in_order_indices_are_accepted() {
        let mut window = SequenceWindow::new(idx(9));
        for i in [10, 11, 12] {
            assert!(window.accept(idx(i)).is_ok());
        }
        assert_eq!(window.last_accepted(), idx(12));
    }

    #[test]
    fn duplicates_are_no_ops() {
        let mut window = SequenceWindow::new(idx(9));
        assert!(window.accept(idx(10)).is_ok());
        assert_eq!(
            window.accept(idx(10)),
            Err(FireRejection::StaleEvent {
                index: 10,
                last_accepted: 10
            })
        );
        assert!(window.accept(idx(11)).is_ok());
        assert_eq!(window.last_accepted(), idx(11));
    }

    #[test]
    fn behind_values_are_rejected() {
        let mut window = SequenceWindow::new(idx(40));
        assert!(window.accept(idx(39)).is_err());
        assert!(window.accept(idx(0)).is_err());
        assert_eq!(window.last_accepted(), idx(40));
    }

    #[test]
    fn acceptance_wraps_around_the_ring() {
        let mut window = SequenceWindow::new(idx(250));
        assert!(window.accept(idx(3)).is_ok());
        assert!(window.accept(idx(251)).is_err());
        assert_eq!(window.last_accepted(), idx(3));
    }

    #[test]
    fn distance_of_exactly_128_is_ahead() {
        let mut window = SequenceWindow::new(idx(0));
        assert!(window.accept(idx(128)).is_ok());

        let mut window = SequenceWindow::new(idx(0));
        assert!(window.accept(idx(129)).is_err());

        let mut window = SequenceWindow::new(idx(200));
        assert!(window.accept(idx(72)).is_ok());
    }

    #[test]
    fn acceptance_is_exactly_the_ahead_half_of_the_ring() {
        for last in 0..=u8::MAX {
            for incoming in 0..=u8::MAX {
                if incoming == RESYNC_SEQUENCE {
                    continue;
                }
                let in_stale_zone = last.wrapping_sub(incoming) < STALE_WINDOW;
                let mut window = SequenceWindow::new(idx(last));
                assert_eq!(window.accept(idx(incoming)).is_ok(), !in_stale_zone);
            }
        }
    }

    #[test]
    fn resync_bypasses_the_window() {
        let mut window = SequenceWindow::new(idx(17));
        assert!(window.accept(SequenceIndex::RESYNC).is_ok());
        assert!(window.accept(SequenceIndex::RESYNC).is_ok());
        assert_eq!(window.last_accepted(), idx(17));
    }

    #[test]
    fn counter_skips_the_reserved_value() {
        assert_eq!(idx(253).next(), idx(254));
        assert_eq!(idx(254).next(), idx(0));
    }

    #[test]
    fn previous_steps_back_over_the_reserved_value() {
        assert_eq!(idx(1).previous(), idx(0));
        assert_eq!(idx(0).previous(), idx(254));
        for i in 0..RESYNC_SEQUENCE {
            assert_eq!(idx(i).next().previous(), idx(i));
        }
    }

    #[test]
    fn first_controller_index_is_accepted_by_a_fresh_window() {
        let mut window = SequenceWindow::default();
        assert!(window.accept(idx(0)).is_ok());
    }

    #[test]
    fn covers_includes_equal_and_behind() {
        assert!(idx(10).covers(idx(10)));
        assert!(idx(10).covers(idx(9)));
        assert!(!idx(10).covers(idx(11)));
        assert!(idx(2).covers(idx(250)));
    }
}
