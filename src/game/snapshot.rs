//! Replicated weapon snapshots

use crate::ws::protocol::{AuthorityMsg, WeaponSnapshot};

use super::weapon::WeaponInstance;

/// Read-only copy of a weapon's authoritative fields
pub fn snapshot_weapon(weapon: &WeaponInstance, equipped: bool) -> WeaponSnapshot {
    WeaponSnapshot {
        owner: weapon.reference().owner,
        weapon: weapon.kind(),
        equipped,
        state: weapon.state(),
        ammo: weapon.ammo(),
        max_ammo: weapon.max_ammo(),
        zoom: weapon.zoom(),
        last_accepted: weapon.last_accepted(),
        flash_count: weapon.flash_count(),
    }
}

/// Decides when to publish snapshots and wraps them for the wire
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
    total_snapshots: u64,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
            total_snapshots: 0,
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (joins, resyncs)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    pub fn total_snapshots(&self) -> u64 {
        self.total_snapshots
    }

    /// Build a snapshot message
    pub fn build(&mut self, tick: u64, weapons: Vec<WeaponSnapshot>) -> AuthorityMsg {
        self.total_snapshots += 1;
        AuthorityMsg::WeaponSnapshots { tick, weapons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::weapon::{ContextRole, WeaponKind, WeaponRef, WeaponSpec, WeaponState};
    use uuid::Uuid;

    #[test]
    fn sends_every_interval() {
        let mut builder = SnapshotBuilder::new(3);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);

        builder.force_next();
        assert!(builder.should_send());
    }

    #[test]
    fn snapshot_mirrors_weapon() {
        let owner = Uuid::new_v4();
        let weapon = WeaponInstance::new(
            WeaponRef::new(owner, WeaponKind::SniperRifle),
            WeaponSpec::for_kind(WeaponKind::SniperRifle),
            ContextRole::Authority,
        );
        let snap = snapshot_weapon(&weapon, false);
        assert_eq!(snap.owner, owner);
        assert_eq!(snap.state, WeaponState::Inactive);
        assert_eq!(snap.ammo, 10);
        assert_eq!(snap.max_ammo, 35);
        assert_eq!(snap.last_accepted, weapon.last_accepted());

        let mut builder = SnapshotBuilder::new(1);
        match builder.build(4, vec![snap.clone()]) {
            AuthorityMsg::WeaponSnapshots { tick, weapons } => {
                assert_eq!(tick, 4);
                assert_eq!(weapons, vec![snap]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(builder.total_snapshots(), 1);
    }
}
