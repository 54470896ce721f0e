//! Collaborator interfaces the engine consumes
//!
//! The engine never reaches for a global world; each operation receives the
//! collaborators it needs through these traits.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::util::time::TimeMs;

use super::weapon::{CombatantId, FireModeId, WeaponRef};

/// Where a shot leaves from and which way it points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Muzzle {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// Something that can aim a weapon
pub trait Fireable {
    /// Muzzle for `shooter`, raised by the optional vertical view offset
    fn muzzle(&self, shooter: CombatantId, aux_offset: Option<f32>) -> Option<Muzzle>;
}

/// Outcome of a damage application
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DamageReport {
    pub target: CombatantId,
    pub amount: f32,
    pub remaining_health: f32,
    pub killed: bool,
}

/// Damage-application service
pub trait Damageable {
    fn apply_damage(
        &mut self,
        target: CombatantId,
        amount: f32,
        cause: &'static str,
        momentum: Vec3,
        instigator: Option<CombatantId>,
    ) -> Option<DamageReport>;
}

/// Combatant position-history service
pub trait PositionHistory {
    /// Position of `combatant` as of `time`, if any history covers it
    fn position_at(&self, combatant: CombatantId, time: TimeMs) -> Option<Vec3>;
}

/// Cosmetic effect playback, fire-and-forget
pub trait EffectSink {
    fn firing_state(
        &mut self,
        weapon: WeaponRef,
        mode: FireModeId,
        flash_count: u8,
        flash_location: Option<Vec3>,
    );
}

/// Identity of a piece of world geometry or a traced object
pub type ObjectId = u32;

/// Nearest blocking world hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldHit {
    pub point: Vec3,
    pub normal: Vec3,
    /// Fraction of the trace travelled
    pub fraction: f32,
    pub object: ObjectId,
}

/// World-geometry query service
pub trait WorldGeometry {
    /// Sweep a ray (`radius == 0`) or a sphere from `start` to `end`,
    /// skipping anything in `ignore`
    fn trace(&self, start: Vec3, end: Vec3, radius: f32, ignore: &[ObjectId]) -> Option<WorldHit>;

    /// Nothing blocks a ray from `start` to `end`
    fn line_clear(&self, start: Vec3, end: Vec3) -> bool {
        self.trace(start, end, 0.0, &[]).is_none()
    }
}
