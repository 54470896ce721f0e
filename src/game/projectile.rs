//! Predicted projectiles
//!
//! Controllers spawn a non-damaging fake the moment they fire. The authority
//! spawns the real projectile and fast-forwards it by the shooter's
//! prediction time so it lines up with what the shooter already sees. When the
//! shooter's latency exceeds what prediction covers, the authoritative spawn
//! is deferred by the sleep time instead.

use glam::Vec3;

use crate::util::time::{ms_to_secs, TimeMs};

use super::capabilities::WorldGeometry;
use super::combat::Roster;
use super::prediction::PredictionContext;
use super::sequence::SequenceIndex;
use super::weapon::{CombatantId, ProjectileSpec, WeaponRef};

/// Floor for an authoritative lifespan shortened by fast-forwarding
pub const MIN_LIFESPAN_MS: TimeMs = 100;

pub type ProjectileId = u32;

/// Identifies one fired shot on every context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShotKey {
    pub weapon: WeaponRef,
    pub sequence: SequenceIndex,
    pub shot_number: u32,
}

/// Everything needed to put a projectile in the world
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileLaunch {
    pub key: ShotKey,
    pub origin: Vec3,
    pub direction: Vec3,
    pub spec: ProjectileSpec,
    pub damage: f32,
    pub momentum: f32,
    pub cause: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileInstance {
    pub id: ProjectileId,
    pub key: ShotKey,
    /// Only authoritative projectiles collide with combatants or deal damage
    pub authoritative: bool,
    pub spawn_tick: TimeMs,
    pub lifespan_remaining_ms: TimeMs,
    /// Already advanced by the shooter's prediction time
    pub forward_ticked: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    pub radius: f32,
    pub damage: f32,
    pub momentum: f32,
    pub cause: &'static str,
}

impl ProjectileInstance {
    pub fn owner(&self) -> CombatantId {
        self.key.weapon.owner
    }
}

/// An authoritative projectile struck something
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileImpact {
    pub projectile: ProjectileId,
    pub key: ShotKey,
    pub point: Vec3,
    pub target: Option<CombatantId>,
    pub damage: f32,
    /// Impulse for the target
    pub momentum: Vec3,
    pub cause: &'static str,
}

/// How the authority should bring a projectile into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPlan {
    Immediate { fast_forward_ms: TimeMs },
    /// Wait, then spawn fast-forwarded by the capped prediction time
    Deferred { delay_ms: TimeMs, fast_forward_ms: TimeMs },
}

impl SpawnPlan {
    pub fn for_shooter(prediction: &PredictionContext) -> Self {
        let fast_forward_ms = prediction.prediction_time_ms();
        match prediction.sleep_time_ms() {
            0 => SpawnPlan::Immediate { fast_forward_ms },
            delay_ms => SpawnPlan::Deferred {
                delay_ms,
                fast_forward_ms,
            },
        }
    }
}

/// Lifespan of a locally spawned fake
pub fn fake_lifespan_ms(configured_ms: TimeMs, sleep_time_bound_ms: TimeMs) -> TimeMs {
    configured_ms.min(sleep_time_bound_ms.saturating_mul(2))
}

/// Lifespan of an authoritative projectile after fast-forwarding
pub fn fast_forwarded_lifespan_ms(configured_ms: TimeMs, fast_forward_ms: TimeMs) -> TimeMs {
    configured_ms
        .saturating_sub(fast_forward_ms)
        .max(MIN_LIFESPAN_MS.min(configured_ms))
}

/// Live projectiles on one context
#[derive(Debug, Default)]
pub struct ProjectileSet {
    projectiles: Vec<ProjectileInstance>,
    next_id: ProjectileId,
}

impl ProjectileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.projectiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projectiles.is_empty()
    }

    pub fn get(&self, id: ProjectileId) -> Option<&ProjectileInstance> {
        self.projectiles.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectileInstance> {
        self.projectiles.iter()
    }

    fn allocate(&mut self, launch: &ProjectileLaunch, authoritative: bool, now: TimeMs, lifespan_ms: TimeMs) -> ProjectileId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.projectiles.push(ProjectileInstance {
            id,
            key: launch.key,
            authoritative,
            spawn_tick: now,
            lifespan_remaining_ms: lifespan_ms,
            forward_ticked: false,
            position: launch.origin,
            velocity: launch.direction.normalize_or(Vec3::X) * launch.spec.speed,
            radius: launch.spec.radius,
            damage: launch.damage,
            momentum: launch.momentum,
            cause: launch.cause,
        });
        id
    }

    /// Controller side: cosmetic stand-in with a capped lifespan
    pub fn spawn_fake(&mut self, launch: &ProjectileLaunch, prediction: &PredictionContext, now: TimeMs) -> ProjectileId {
        let lifespan = fake_lifespan_ms(launch.spec.lifespan_ms, prediction.sleep_time_bound_ms());
        self.allocate(launch, false, now, lifespan)
    }

    /// Authority side: spawn and immediately advance by `fast_forward_ms`.
    ///
    /// Returns the new id and anything the catch-up step already struck.
    pub fn spawn_authoritative<W: WorldGeometry>(
        &mut self,
        launch: &ProjectileLaunch,
        fast_forward_ms: TimeMs,
        now: TimeMs,
        world: &W,
        roster: &Roster,
    ) -> (ProjectileId, Vec<ProjectileImpact>) {
        let lifespan = if fast_forward_ms > 0 {
            fast_forwarded_lifespan_ms(launch.spec.lifespan_ms, fast_forward_ms)
        } else {
            launch.spec.lifespan_ms
        };
        let id = self.allocate(launch, true, now, lifespan);
        if fast_forward_ms == 0 {
            return (id, Vec::new());
        }

        let mut impacts = Vec::new();
        let idx = self.projectiles.len() - 1;
        let projectile = &mut self.projectiles[idx];
        projectile.forward_ticked = true;
        if let Some(impact) = Self::sweep(projectile, fast_forward_ms, world, roster) {
            impacts.push(impact);
            self.projectiles.pop();
        }
        (id, impacts)
    }

    /// Advance every projectile by `dt_ms`; expired and collided ones are removed
    pub fn tick<W: WorldGeometry>(&mut self, dt_ms: TimeMs, world: &W, roster: &Roster) -> Vec<ProjectileImpact> {
        let mut impacts = Vec::new();
        self.projectiles.retain_mut(|projectile| {
            if projectile.lifespan_remaining_ms == 0 {
                return false;
            }
            let step = dt_ms.min(projectile.lifespan_remaining_ms);
            projectile.lifespan_remaining_ms -= step;
            match Self::sweep(projectile, step, world, roster) {
                Some(impact) => {
                    // Fakes just vanish on contact
                    if projectile.authoritative {
                        impacts.push(impact);
                    }
                    false
                }
                None => projectile.lifespan_remaining_ms > 0,
            }
        });
        impacts
    }

    /// Drop the fakes standing in for a shot the authority has now spawned
    pub fn reconcile(&mut self, weapon: WeaponRef, shot_number: u32) -> usize {
        let before = self.projectiles.len();
        self.projectiles
            .retain(|p| p.authoritative || p.key.weapon != weapon || p.key.shot_number != shot_number);
        before - self.projectiles.len()
    }

    /// Remove everything fired by `owner`
    pub fn remove_owner(&mut self, owner: CombatantId) -> usize {
        let before = self.projectiles.len();
        self.projectiles.retain(|p| p.owner() != owner);
        before - self.projectiles.len()
    }

    fn sweep<W: WorldGeometry>(
        projectile: &mut ProjectileInstance,
        dt_ms: TimeMs,
        world: &W,
        roster: &Roster,
    ) -> Option<ProjectileImpact> {
        let start = projectile.position;
        let end = start + projectile.velocity * ms_to_secs(dt_ms);
        projectile.position = end;

        let world_hit = world.trace(start, end, projectile.radius, &[]);
        let mut nearest_fraction = world_hit.map(|h| h.fraction).unwrap_or(f32::INFINITY);
        let mut target = None;

        if projectile.authoritative {
            let owner = projectile.owner();
            for combatant in roster.iter().filter(|c| c.alive && c.id != owner) {
                let capsule = combatant.capsule_at(combatant.position);
                if let Some(contact) = capsule.test_segment(start, end, projectile.radius) {
                    let closer = contact.fraction < nearest_fraction
                        || (contact.fraction == nearest_fraction
                            && target.is_some_and(|t: CombatantId| combatant.id < t));
                    if closer {
                        nearest_fraction = contact.fraction;
                        target = Some(combatant.id);
                    }
                }
            }
        }

        if !nearest_fraction.is_finite() {
            return None;
        }
        let point = start.lerp(end, nearest_fraction);
        projectile.position = point;
        Some(ProjectileImpact {
            projectile: projectile.id,
            key: projectile.key,
            point,
            target,
            damage: projectile.damage,
            momentum: projectile.velocity.normalize_or_zero() * projectile.momentum,
            cause: projectile.cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::Combatant;
    use crate::game::hitscan::{HitScanner, ScanConfig, ScanRequest, ShotTrace};
    use crate::game::history::PositionRecorder;
    use crate::game::weapon::{WeaponKind, WeaponSpec};
    use crate::game::world::{StaticWorld, WorldBox};
    use uuid::Uuid;

    fn launch(owner: CombatantId, shot_number: u32) -> ProjectileLaunch {
        let spec = WeaponSpec::for_kind(WeaponKind::RocketLauncher);
        let mode = spec.mode(0).unwrap().clone();
        ProjectileLaunch {
            key: ShotKey {
                weapon: WeaponRef::new(owner, WeaponKind::RocketLauncher),
                sequence: SequenceIndex(0),
                shot_number,
            },
            origin: Vec3::ZERO,
            direction: Vec3::X,
            spec: mode.projectile.unwrap(),
            damage: mode.damage,
            momentum: mode.momentum,
            cause: mode.cause,
        }
    }

    fn shooter_rtt(rtt: TimeMs, fudge: TimeMs, max: TimeMs) -> PredictionContext {
        let mut ctx = PredictionContext::new(fudge, max);
        ctx.set_round_trip(rtt);
        ctx
    }

    #[test]
    fn fake_lifespan_is_capped_by_twice_the_bound() {
        let ctx = shooter_rtt(80, 20, 120);
        let mut set = ProjectileSet::new();
        let id = set.spawn_fake(&launch(Uuid::new_v4(), 0), &ctx, 0);
        let fake = set.get(id).unwrap();
        assert!(!fake.authoritative);
        assert_eq!(fake.lifespan_remaining_ms, 2 * ctx.sleep_time_bound_ms());
        assert_eq!(fake_lifespan_ms(200, 500), 200);
        assert_eq!(fake_lifespan_ms(10_000, 0), 0);
    }

    #[test]
    fn authoritative_spawn_fast_forwards_by_prediction_time() {
        let ctx = shooter_rtt(150, 0, 150);
        let plan = SpawnPlan::for_shooter(&ctx);
        assert_eq!(plan, SpawnPlan::Immediate { fast_forward_ms: 150 });

        let mut set = ProjectileSet::new();
        let l = launch(Uuid::new_v4(), 0);
        let (id, impacts) = set.spawn_authoritative(&l, 150, 1_000, &StaticWorld::new(), &Roster::new());
        assert!(impacts.is_empty());

        let rocket = set.get(id).unwrap();
        assert!(rocket.authoritative);
        assert!(rocket.forward_ticked);
        assert_eq!(rocket.lifespan_remaining_ms, l.spec.lifespan_ms - 150);
        assert!((rocket.position.x - l.spec.speed * 0.15).abs() < 1.0e-3);
    }

    #[test]
    fn shortened_lifespan_is_floored() {
        assert_eq!(fast_forwarded_lifespan_ms(10_000, 150), 9_850);
        assert_eq!(fast_forwarded_lifespan_ms(200, 150), MIN_LIFESPAN_MS);
        assert_eq!(fast_forwarded_lifespan_ms(60, 150), 60);
    }

    #[test]
    fn excess_latency_defers_the_spawn() {
        let ctx = shooter_rtt(300, 20, 120);
        assert_eq!(
            SpawnPlan::for_shooter(&ctx),
            SpawnPlan::Deferred {
                delay_ms: 160,
                fast_forward_ms: 120
            }
        );
    }

    #[test]
    fn authoritative_projectile_damages_and_fakes_do_not() {
        let owner = Uuid::from_u128(1);
        let target = Uuid::from_u128(2);
        let mut roster = Roster::new();
        roster.insert(Combatant::new(owner, None, Vec3::ZERO));
        roster.insert(Combatant::new(target, None, Vec3::new(500.0, 0.0, 0.0)));
        let world = StaticWorld::new();
        let ctx = shooter_rtt(0, 20, 120);

        let mut set = ProjectileSet::new();
        set.spawn_fake(&launch(owner, 0), &ctx, 0);
        set.spawn_authoritative(&launch(owner, 0), 0, 0, &world, &roster);

        let mut impacts = Vec::new();
        for _ in 0..30 {
            impacts.extend(set.tick(16, &world, &roster));
        }
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].target, Some(target));
        assert!(impacts[0].momentum.x > 0.0);
    }

    #[test]
    fn fakes_expire_quickly() {
        let ctx = shooter_rtt(0, 20, 120);
        let mut set = ProjectileSet::new();
        set.spawn_fake(&launch(Uuid::new_v4(), 0), &ctx, 0);
        let world = StaticWorld::new();
        let roster = Roster::new();
        let mut elapsed = 0;
        while !set.is_empty() {
            set.tick(16, &world, &roster);
            elapsed += 16;
        }
        assert!(elapsed <= 2 * ctx.sleep_time_bound_ms() + 16);
    }

    #[test]
    fn world_blocks_projectiles() {
        let owner = Uuid::new_v4();
        let world = StaticWorld::new().with_box(WorldBox::new(
            1,
            Vec3::new(300.0, -100.0, -100.0),
            Vec3::new(320.0, 100.0, 100.0),
        ));
        let mut set = ProjectileSet::new();
        set.spawn_authoritative(&launch(owner, 0), 0, 0, &world, &Roster::new());
        let mut impacts = Vec::new();
        for _ in 0..10 {
            impacts.extend(set.tick(16, &world, &Roster::new()));
        }
        assert_eq!(impacts.len(), 1);
        assert_eq!(impacts[0].target, None);
        assert!(impacts[0].point.x <= 300.0);
        assert!(set.is_empty());
    }

    #[test]
    fn reconcile_removes_only_matching_fakes() {
        let owner = Uuid::new_v4();
        let ctx = shooter_rtt(0, 20, 120);
        let mut set = ProjectileSet::new();
        set.spawn_fake(&launch(owner, 0), &ctx, 0);
        set.spawn_fake(&launch(owner, 1), &ctx, 0);
        let weapon = WeaponRef::new(owner, WeaponKind::RocketLauncher);
        assert_eq!(set.reconcile(weapon, 0), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.reconcile(weapon, 0), 0);
    }

    #[test]
    fn fakes_never_show_up_as_hit_candidates() {
        let owner = Uuid::from_u128(1);
        let mut roster = Roster::new();
        roster.insert(Combatant::new(owner, None, Vec3::ZERO));
        let ctx = shooter_rtt(40, 20, 120);
        let mut set = ProjectileSet::new();
        let mut fake = launch(Uuid::from_u128(9), 0);
        fake.origin = Vec3::new(600.0, 0.0, 0.0);
        set.spawn_fake(&fake, &ctx, 0);

        let world = StaticWorld::new();
        let history = PositionRecorder::default();
        let scanner = HitScanner::new(
            &world,
            &history,
            &roster,
            ScanConfig {
                friendly_fire: false,
                hit_padding: 10.0,
            },
        );
        let result = scanner.point_trace(&ScanRequest {
            shooter: owner,
            trace: ShotTrace::new(Vec3::ZERO, Vec3::X, 2_000.0, 0.0),
            now: 0,
            rewind_ms: 0,
            sequence: SequenceIndex(0),
            ignore: Vec::new(),
            reported: None,
        });
        assert_eq!(result.target, None);
        assert_eq!(result.travel_fraction, 1.0);
    }
}
