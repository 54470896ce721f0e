//! Combatant roster - health, hitboxes and damage application

use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::capabilities::{DamageReport, Damageable, Fireable, Muzzle};
use super::geometry::Capsule;
use super::weapon::CombatantId;

/// Movement state reported by the (external) movement system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    #[default]
    Grounded,
    Airborne,
    Swimming,
    /// Knocked down / feigning; firing is refused by default
    Incapacitated,
}

/// Hitbox dimensions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitboxStats {
    pub radius: f32,
    pub half_height: f32,
    /// Eye height above the capsule center
    pub eye_height: f32,
    pub max_health: f32,
}

impl Default for HitboxStats {
    fn default() -> Self {
        Self {
            radius: 34.0,
            half_height: 88.0,
            eye_height: 64.0,
            max_health: 100.0,
        }
    }
}

/// One combatant as the authority sees it
#[derive(Debug, Clone)]
pub struct Combatant {
    pub id: CombatantId,
    /// None in free-for-all
    pub team: Option<u8>,
    pub position: Vec3,
    /// Normalised view direction
    pub aim: Vec3,
    pub movement: MovementState,
    pub hitbox: HitboxStats,
    pub health: f32,
    pub alive: bool,
    /// Momentum received since the movement system last consumed it
    pub pending_momentum: Vec3,
    pub damage_taken: f32,
}

impl Combatant {
    pub fn new(id: CombatantId, team: Option<u8>, position: Vec3) -> Self {
        let hitbox = HitboxStats::default();
        Self {
            id,
            team,
            position,
            aim: Vec3::X,
            movement: MovementState::Grounded,
            hitbox,
            health: hitbox.max_health,
            alive: true,
            pending_momentum: Vec3::ZERO,
            damage_taken: 0.0,
        }
    }

    pub fn with_hitbox(mut self, hitbox: HitboxStats) -> Self {
        self.hitbox = hitbox;
        self.health = hitbox.max_health;
        self
    }

    /// Hitbox at the given center
    pub fn capsule_at(&self, center: Vec3) -> Capsule {
        Capsule::vertical(center, self.hitbox.radius, self.hitbox.half_height)
    }

    pub fn is_teammate_of(&self, other: &Combatant) -> bool {
        matches!((self.team, other.team), (Some(a), Some(b)) if a == b)
    }
}

/// Apply damage to health, returns (new_health, is_dead)
pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
    let new_health = (current_health - damage.max(0.0)).max(0.0);
    (new_health, new_health <= 0.0)
}

/// All combatants in a session
#[derive(Debug, Clone, Default)]
pub struct Roster {
    combatants: HashMap<CombatantId, Combatant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, combatant: Combatant) {
        self.combatants.insert(combatant.id, combatant);
    }

    pub fn remove(&mut self, id: &CombatantId) -> Option<Combatant> {
        self.combatants.remove(id)
    }

    pub fn get(&self, id: &CombatantId) -> Option<&Combatant> {
        self.combatants.get(id)
    }

    pub fn get_mut(&mut self, id: &CombatantId) -> Option<&mut Combatant> {
        self.combatants.get_mut(id)
    }

    pub fn is_alive(&self, id: &CombatantId) -> bool {
        self.get(id).map(|c| c.alive).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Combatant> {
        self.combatants.values()
    }

    pub fn len(&self) -> usize {
        self.combatants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combatants.is_empty()
    }

    /// Bring a combatant back at full health
    pub fn respawn(&mut self, id: &CombatantId, position: Vec3) -> bool {
        match self.combatants.get_mut(id) {
            Some(c) => {
                c.position = position;
                c.health = c.hitbox.max_health;
                c.alive = true;
                c.pending_momentum = Vec3::ZERO;
                true
            }
            None => false,
        }
    }
}

impl Fireable for Roster {
    fn muzzle(&self, shooter: CombatantId, aux_offset: Option<f32>) -> Option<Muzzle> {
        let c = self.get(&shooter).filter(|c| c.alive)?;
        let height = c.hitbox.eye_height + aux_offset.unwrap_or(0.0);
        Some(Muzzle {
            origin: c.position + Vec3::Z * height,
            direction: c.aim.normalize_or(Vec3::X),
        })
    }
}

impl Damageable for Roster {
    fn apply_damage(
        &mut self,
        target: CombatantId,
        amount: f32,
        _cause: &'static str,
        momentum: Vec3,
        _instigator: Option<CombatantId>,
    ) -> Option<DamageReport> {
        let c = self.combatants.get_mut(&target).filter(|c| c.alive)?;
        let (new_health, killed) = apply_damage(c.health, amount);
        let dealt = c.health - new_health;
        c.health = new_health;
        c.damage_taken += dealt;
        c.pending_momentum += momentum;
        if killed {
            c.alive = false;
        }
        Some(DamageReport {
            target,
            amount: dealt,
            remaining_health: new_health,
            killed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn damage_clamps_and_kills() {
        assert_eq!(apply_damage(50.0, 20.0), (30.0, false));
        assert_eq!(apply_damage(10.0, 20.0), (0.0, true));
        assert_eq!(apply_damage(10.0, -5.0), (10.0, false));
    }

    #[test]
    fn roster_applies_damage_once_dead() {
        let mut roster = Roster::new();
        let id = Uuid::new_v4();
        roster.insert(Combatant::new(id, None, Vec3::ZERO));

        let report = roster
            .apply_damage(id, 60.0, "test", Vec3::X, None)
            .unwrap();
        assert_eq!(report.remaining_health, 40.0);
        assert!(!report.killed);

        let report = roster
            .apply_damage(id, 60.0, "test", Vec3::X, None)
            .unwrap();
        assert!(report.killed);
        assert_eq!(report.amount, 40.0);
        assert!(!roster.is_alive(&id));
        assert!(roster.apply_damage(id, 1.0, "test", Vec3::ZERO, None).is_none());

        assert!(roster.respawn(&id, Vec3::ONE));
        assert!(roster.is_alive(&id));
    }

    #[test]
    fn muzzle_sits_at_eye_height_plus_offset() {
        let mut roster = Roster::new();
        let id = Uuid::new_v4();
        roster.insert(Combatant::new(id, None, Vec3::ZERO));
        let muzzle = roster.muzzle(id, Some(6.0)).unwrap();
        assert_eq!(muzzle.origin, Vec3::new(0.0, 0.0, 70.0));
        assert_eq!(muzzle.direction, Vec3::X);
    }
}
