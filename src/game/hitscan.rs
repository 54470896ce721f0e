//! Lag-compensated hit scanning
//!
//! Two entry points: `point_trace` resolves the single nearest blocking hit,
//! `cone_trace` returns every combatant inside an angular limit. Both rewind
//! remote combatants to where the shooter saw them, test their capsules
//! against the shot segment, and merge the result with a world trace.
//!
//! Results depend only on the inputs: candidates are ordered by travel
//! fraction with ties broken by combatant id, never by map iteration order.

use std::cmp::Ordering;

use glam::Vec3;

use crate::util::time::TimeMs;

use super::capabilities::{ObjectId, PositionHistory, WorldGeometry, WorldHit};
use super::combat::{Combatant, Roster};
use super::geometry::{angle_to_point, Capsule, CapsuleContact};
use super::sequence::SequenceIndex;
use super::weapon::CombatantId;

/// World retraces allowed when the nearest hit is pass-through geometry
pub const MAX_TRACE_RETRIES: usize = 4;

/// Outcome of one trace
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitScanResult {
    pub point: Vec3,
    pub normal: Vec3,
    pub target: Option<CombatantId>,
    /// Fraction of the full range travelled before the hit (1 = no hit)
    pub travel_fraction: f32,
}

/// Geometry of a shot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotTrace {
    pub origin: Vec3,
    /// Normalised on construction
    pub direction: Vec3,
    pub range: f32,
    /// 0 for a ray, otherwise the swept sphere radius
    pub radius: f32,
}

impl ShotTrace {
    pub fn new(origin: Vec3, direction: Vec3, range: f32, radius: f32) -> Self {
        Self {
            origin,
            direction: direction.normalize_or(Vec3::X),
            range,
            radius: radius.max(0.0),
        }
    }

    pub fn end(&self) -> Vec3 {
        self.origin + self.direction * self.range
    }

    fn miss(&self) -> HitScanResult {
        HitScanResult {
            point: self.end(),
            normal: -self.direction,
            target: None,
            travel_fraction: 1.0,
        }
    }
}

/// A hit the controlling context claims it saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedHit {
    pub target: CombatantId,
    pub sequence: SequenceIndex,
}

/// Everything one resolution needs besides the collaborators
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub shooter: CombatantId,
    pub trace: ShotTrace,
    pub now: TimeMs,
    /// How far back to rewind remote combatants (0 = current positions)
    pub rewind_ms: TimeMs,
    /// Sequence index of the intent being resolved
    pub sequence: SequenceIndex,
    /// Pass-through geometry to retrace past
    pub ignore: Vec<ObjectId>,
    /// Most recent client-reported hit for this weapon
    pub reported: Option<ReportedHit>,
}

/// Tunables for candidate selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    pub friendly_fire: bool,
    /// Acceptance widening for recently reported targets
    pub hit_padding: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: CombatantId,
    capsule: Capsule,
    contact: CapsuleContact,
    /// Fraction at which the shot enters the (inflated) capsule
    entry_fraction: f32,
}

fn by_fraction_then_id(a: &Candidate, b: &Candidate) -> Ordering {
    a.entry_fraction
        .total_cmp(&b.entry_fraction)
        .then_with(|| a.id.cmp(&b.id))
}

/// Resolves shots against a world, a roster and its position history
pub struct HitScanner<'a, W, H> {
    world: &'a W,
    history: &'a H,
    roster: &'a Roster,
    config: ScanConfig,
}

impl<'a, W, H> HitScanner<'a, W, H>
where
    W: WorldGeometry,
    H: PositionHistory,
{
    pub fn new(world: &'a W, history: &'a H, roster: &'a Roster, config: ScanConfig) -> Self {
        Self {
            world,
            history,
            roster,
            config,
        }
    }

    /// Nearest blocking world hit, retracing past ignored objects
    pub fn world_trace(&self, trace: &ShotTrace, ignore: &[ObjectId]) -> Option<WorldHit> {
        let start = trace.origin;
        let end = trace.end();
        let mut skipped: Vec<ObjectId> = Vec::new();
        let mut hit = self.world.trace(start, end, trace.radius, &skipped);

        for _ in 0..MAX_TRACE_RETRIES {
            match hit {
                Some(h) if ignore.contains(&h.object) => {
                    skipped.push(h.object);
                    hit = self.world.trace(start, end, trace.radius, &skipped);
                }
                _ => break,
            }
        }
        hit
    }

    /// Where `combatant` was when the shooter fired
    pub fn rewound_position(&self, combatant: &Combatant, now: TimeMs, rewind_ms: TimeMs) -> Vec3 {
        if rewind_ms == 0 {
            return combatant.position;
        }
        self.history
            .position_at(combatant.id, now.saturating_sub(rewind_ms))
            .unwrap_or(combatant.position)
    }

    fn eligible<'r>(&'r self, shooter: CombatantId) -> impl Iterator<Item = &'r Combatant> + 'r {
        let shooter = self.roster.get(&shooter);
        let friendly_fire = self.config.friendly_fire;
        self.roster.iter().filter(move |c| {
            if !c.alive {
                return false;
            }
            match shooter {
                Some(s) if s.id == c.id => false,
                Some(s) if !friendly_fire && s.is_teammate_of(c) => false,
                _ => true,
            }
        })
    }

    fn recently_reported(&self, request: &ScanRequest, target: CombatantId) -> bool {
        request.reported.is_some_and(|r| {
            r.target == target
                && !r.sequence.is_resync()
                && (r.sequence == request.sequence || r.sequence == request.sequence.previous())
        })
    }

    fn candidate(&self, request: &ScanRequest, combatant: &Combatant) -> Option<Candidate> {
        let trace = &request.trace;
        let center = self.rewound_position(combatant, request.now, request.rewind_ms);
        let capsule = combatant.capsule_at(center);
        let start = trace.origin;
        let end = trace.end();

        let exact_reach = capsule.radius + trace.radius;
        let contact = match capsule.test_segment(start, end, trace.radius) {
            Some(contact) => contact,
            None if self.recently_reported(request, combatant.id) => {
                let padded = capsule.test_segment(start, end, trace.radius + self.config.hit_padding)?;
                // Padded only: make sure nothing solid sits in front of the target
                let surface = capsule.surface_point_toward(start);
                if !self.world.line_clear(start, surface) {
                    return None;
                }
                padded
            }
            None => return None,
        };

        let reach = exact_reach.max(contact.separation);
        let along = contact.fraction * trace.range;
        let back_off = (reach * reach - contact.separation * contact.separation).max(0.0).sqrt();
        let entry_fraction = if trace.range > 0.0 {
            ((along - back_off) / trace.range).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Some(Candidate {
            id: combatant.id,
            capsule,
            contact,
            entry_fraction,
        })
    }

    /// Single nearest blocking hit: world or combatant, whichever is closer
    pub fn point_trace(&self, request: &ScanRequest) -> HitScanResult {
        let trace = &request.trace;
        let world_hit = self.world_trace(trace, &request.ignore);

        let best = self
            .eligible(request.shooter)
            .filter_map(|c| self.candidate(request, c))
            .min_by(by_fraction_then_id);

        let world_fraction = world_hit.map(|h| h.fraction).unwrap_or(f32::INFINITY);
        match best {
            Some(c) if c.entry_fraction <= world_fraction => HitScanResult {
                point: trace.origin + trace.direction * (c.entry_fraction * trace.range),
                normal: c.contact.normal(),
                target: Some(c.id),
                travel_fraction: c.entry_fraction,
            },
            _ => match world_hit {
                Some(h) => HitScanResult {
                    point: h.point,
                    normal: h.normal,
                    target: None,
                    travel_fraction: h.fraction,
                },
                None => trace.miss(),
            },
        }
    }

    /// Every combatant within `half_angle` of the aim, nearest first. Each one
    /// must have an unobstructed line from the origin.
    pub fn cone_trace(&self, request: &ScanRequest, half_angle: f32) -> Vec<HitScanResult> {
        let trace = &request.trace;
        let world_fraction = self
            .world_trace(trace, &request.ignore)
            .map(|h| h.fraction)
            .unwrap_or(1.0);

        let mut passing: Vec<Candidate> = self
            .eligible(request.shooter)
            .filter_map(|c| {
                if let Some(direct) = self.candidate(request, c) {
                    return Some(direct);
                }
                let center = self.rewound_position(c, request.now, request.rewind_ms);
                let capsule = c.capsule_at(center);
                let contact = capsule.closest_approach(trace.origin, trace.end());
                let distance = trace.origin.distance(contact.axis_point);
                if distance > trace.range + capsule.radius
                    || angle_to_point(trace.origin, trace.direction, contact.axis_point) > half_angle
                {
                    return None;
                }
                Some(Candidate {
                    id: c.id,
                    capsule,
                    contact,
                    entry_fraction: (distance / trace.range.max(f32::EPSILON)).min(1.0),
                })
            })
            .filter(|c| c.entry_fraction <= world_fraction)
            .collect();

        passing.sort_by(by_fraction_then_id);

        passing
            .into_iter()
            .filter_map(|c| {
                let surface = c.capsule.surface_point_toward(trace.origin);
                if !self.world.line_clear(trace.origin, surface) {
                    return None;
                }
                Some(HitScanResult {
                    point: surface,
                    normal: (surface - c.contact.axis_point).normalize_or(-trace.direction),
                    target: Some(c.id),
                    travel_fraction: c.entry_fraction,
                })
            })
            .collect()
    }
}
