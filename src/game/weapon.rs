//! Weapon catalogue and firing/zoom state machine
//!
//! The same state machine runs on the controlling context (to predict) and on
//! the authority (to decide). Illegal transitions come back as
//! `FireRejection::IllegalTransition` and leave the machine untouched apart
//! from the pending flag bookkeeping; callers drop them on the floor.

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::time::TimeMs;

use super::combat::MovementState;
use super::error::FireRejection;
use super::scheduler::TaskId;
use super::sequence::{SequenceIndex, SequenceWindow};

/// Participant / combatant identity
pub type CombatantId = Uuid;

/// Index of a fire mode within a weapon
pub type FireModeId = u8;

/// Upper bound on fire modes per weapon (pending flags are a bitmask)
pub const MAX_FIRE_MODES: usize = 8;

/// Weapons in the catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponKind {
    /// Hitscan sidearm
    Pistol,
    /// Long range hitscan with a zoom alt mode
    SniperRifle,
    /// Cone hit, several targets per shot
    Scattergun,
    /// Slow predicted projectile
    RocketLauncher,
}

impl WeaponKind {
    pub const ALL: [WeaponKind; 4] = [
        WeaponKind::Pistol,
        WeaponKind::SniperRifle,
        WeaponKind::Scattergun,
        WeaponKind::RocketLauncher,
    ];
}

/// A specific weapon carried by a specific combatant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeaponRef {
    pub owner: CombatantId,
    pub kind: WeaponKind,
}

impl WeaponRef {
    pub fn new(owner: CombatantId, kind: WeaponKind) -> Self {
        Self { owner, kind }
    }
}

/// What a fire mode does when it goes off
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FireKind {
    /// Single nearest blocking hit
    InstantHit,
    /// Every target within `half_angle` radians of the aim
    ConeHit { half_angle: f32 },
    /// Spawns a projectile
    Projectile,
    /// Holds the zoom; never shoots
    Zoom,
}

/// Projectile stats for projectile fire modes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectileSpec {
    /// Units per second
    pub speed: f32,
    pub lifespan_ms: TimeMs,
    /// Collision radius
    pub radius: f32,
}

/// Stats for one fire mode
#[derive(Debug, Clone, PartialEq)]
pub struct FireModeSpec {
    pub kind: FireKind,
    pub ammo_cost: u32,
    pub refire_ms: TimeMs,
    pub damage: f32,
    /// Impulse applied along the shot direction
    pub momentum: f32,
    pub range: f32,
    /// Radius swept by the trace (0 for a ray)
    pub trace_radius: f32,
    /// Max random deviation in radians
    pub spread: f32,
    /// Tag passed to damage application
    pub cause: &'static str,
    pub projectile: Option<ProjectileSpec>,
}

impl FireModeSpec {
    fn instant(damage: f32, range: f32, refire_ms: TimeMs, cause: &'static str) -> Self {
        Self {
            kind: FireKind::InstantHit,
            ammo_cost: 1,
            refire_ms,
            damage,
            momentum: 5_000.0,
            range,
            trace_radius: 0.0,
            spread: 0.0,
            cause,
            projectile: None,
        }
    }

    fn zoom() -> Self {
        Self {
            kind: FireKind::Zoom,
            ammo_cost: 0,
            refire_ms: 0,
            damage: 0.0,
            momentum: 0.0,
            range: 0.0,
            trace_radius: 0.0,
            spread: 0.0,
            cause: "zoom",
            projectile: None,
        }
    }
}

/// Zoom tuning for weapons with a zoom mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomSpec {
    /// Time to go from fully out to fully in
    pub zoom_time_ms: TimeMs,
}

/// Static weapon definition
#[derive(Debug, Clone, PartialEq)]
pub struct WeaponSpec {
    pub kind: WeaponKind,
    pub max_ammo: u32,
    pub initial_ammo: u32,
    pub equip_ms: TimeMs,
    pub put_down_ms: TimeMs,
    /// Higher is preferred when auto-switching
    pub priority: i32,
    pub modes: Vec<FireModeSpec>,
    pub zoom: Option<ZoomSpec>,
}

impl WeaponSpec {
    pub fn for_kind(kind: WeaponKind) -> Self {
        match kind {
            WeaponKind::Pistol => Self {
                kind,
                max_ammo: 50,
                initial_ammo: 30,
                equip_ms: 300,
                put_down_ms: 200,
                priority: 1,
                modes: vec![
                    FireModeSpec::instant(20.0, 10_000.0, 400, "pistol"),
                    FireModeSpec {
                        refire_ms: 250,
                        spread: 0.05,
                        ..FireModeSpec::instant(16.0, 10_000.0, 250, "pistol_burst")
                    },
                ],
                zoom: None,
            },
            WeaponKind::SniperRifle => Self {
                kind,
                max_ammo: 35,
                initial_ammo: 10,
                equip_ms: 450,
                put_down_ms: 300,
                priority: 4,
                modes: vec![
                    FireModeSpec {
                        momentum: 10_000.0,
                        ..FireModeSpec::instant(70.0, 30_000.0, 1_300, "sniper")
                    },
                    FireModeSpec::zoom(),
                ],
                zoom: Some(ZoomSpec { zoom_time_ms: 400 }),
            },
            WeaponKind::Scattergun => Self {
                kind,
                max_ammo: 40,
                initial_ammo: 20,
                equip_ms: 350,
                put_down_ms: 250,
                priority: 3,
                modes: vec![FireModeSpec {
                    kind: FireKind::ConeHit {
                        half_angle: 0.12,
                    },
                    ammo_cost: 1,
                    refire_ms: 900,
                    damage: 45.0,
                    momentum: 20_000.0,
                    range: 2_500.0,
                    trace_radius: 0.0,
                    spread: 0.0,
                    cause: "scattergun",
                    projectile: None,
                }],
                zoom: None,
            },
            WeaponKind::RocketLauncher => Self {
                kind,
                max_ammo: 48,
                initial_ammo: 18,
                equip_ms: 450,
                put_down_ms: 300,
                priority: 5,
                modes: vec![FireModeSpec {
                    kind: FireKind::Projectile,
                    ammo_cost: 1,
                    refire_ms: 1_000,
                    damage: 100.0,
                    momentum: 140_000.0,
                    range: 0.0,
                    trace_radius: 0.0,
                    spread: 0.0,
                    cause: "rocket",
                    projectile: Some(ProjectileSpec {
                        speed: 2_700.0,
                        lifespan_ms: 10_000,
                        radius: 12.0,
                    }),
                }],
                zoom: None,
            },
        }
    }

    pub fn mode(&self, mode: FireModeId) -> Option<&FireModeSpec> {
        self.modes.get(mode as usize)
    }

    /// Ammo cost of the cheapest mode that actually fires
    pub fn min_ammo_cost(&self) -> Option<u32> {
        self.modes
            .iter()
            .filter(|m| m.kind != FireKind::Zoom)
            .map(|m| m.ammo_cost)
            .min()
    }
}

/// Behaviour supplied by the embedding game instead of script overrides
#[derive(Clone)]
pub struct FireHooks {
    /// Whether the owner's movement state allows starting to fire
    pub movement_allows_fire: Arc<dyn Fn(MovementState) -> bool + Send + Sync>,
    /// Called when a second mode is pressed while another is firing
    pub on_multi_press: Arc<dyn Fn(WeaponRef, FireModeId, FireModeId) + Send + Sync>,
    /// Scales base damage by distance travelled
    pub damage_scale: Arc<dyn Fn(&FireModeSpec, f32) -> f32 + Send + Sync>,
}

impl Default for FireHooks {
    fn default() -> Self {
        Self {
            movement_allows_fire: Arc::new(|movement| movement != MovementState::Incapacitated),
            on_multi_press: Arc::new(|_, _, _| {}),
            damage_scale: Arc::new(|_, _| 1.0),
        }
    }
}

impl fmt::Debug for FireHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FireHooks").finish_non_exhaustive()
    }
}

/// Conditions outside the weapon that gate starting to fire
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireGate {
    pub owner_alive: bool,
    pub movement: MovementState,
    /// Global suppression (round over, spawn protection, ...)
    pub fire_suppressed: bool,
}

impl FireGate {
    pub fn open() -> Self {
        Self {
            owner_alive: true,
            movement: MovementState::Grounded,
            fire_suppressed: false,
        }
    }
}

/// A fresh press whose quick release is held back until the press has fired.
///
/// Both contexts open one per accepted press (multi-presses excepted) so a
/// tap landing in the refire cooldown fires on each side exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapWindow {
    pub started_at: TimeMs,
    pub shots_at_start: u32,
    /// Fallback timer applying the held-back release
    pub deferred_stop: Option<TaskId>,
}

impl TapWindow {
    /// Open before `begin_firing` so a shot fired by the press itself counts
    pub fn open(weapon: &WeaponInstance, now: TimeMs) -> Self {
        Self {
            started_at: now,
            shots_at_start: weapon.shots_fired(),
            deferred_stop: None,
        }
    }

    /// Releasing `mode` now would swallow the press before its first shot
    pub fn holds_release(&self, weapon: &WeaponInstance, mode: FireModeId, now: TimeMs, grace_ms: TimeMs) -> bool {
        grace_ms > 0
            && now.saturating_sub(self.started_at) <= grace_ms
            && weapon.shots_fired() == self.shots_at_start
            && weapon.is_pending(mode)
    }

    /// Latest the held-back release waits: one refire plus the grace window
    pub fn fallback_ms(weapon: &WeaponInstance, mode: FireModeId, grace_ms: TimeMs) -> TimeMs {
        weapon.spec().mode(mode).map(|m| m.refire_ms).unwrap_or(0) + grace_ms
    }
}

/// Which side of the wire this copy of the machine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Authority,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WeaponState {
    Inactive,
    Equipping { ready_at: TimeMs },
    Active,
    Firing { mode: FireModeId },
    Zooming { mode: FireModeId },
    Unequipping { done_at: TimeMs },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomState {
    Off,
    ZoomingIn,
    ZoomedIn,
    ZoomingOut,
}

/// Zoom status, decided by the controlling context
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomStatus {
    pub state: ZoomState,
    /// 0 = fully out, 1 = fully in
    pub level: f32,
}

impl Default for ZoomStatus {
    fn default() -> Self {
        Self {
            state: ZoomState::Off,
            level: 0.0,
        }
    }
}

/// Result of a successful begin/end request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Entered Firing or Zooming
    Started,
    /// Pending until equip completes
    Deferred,
    AlreadyFiring,
    /// Another mode is already firing
    MultiPress { held: FireModeId },
    Stopped,
}

/// A shot the machine wants executed this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotRequest {
    pub weapon: WeaponRef,
    pub mode: FireModeId,
    /// Running shot count for this weapon (spread seed input)
    pub shot_number: u32,
}

/// Things that happened during `tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponEvent {
    Shot(ShotRequest),
    OutOfAmmo,
    BecameActive,
    BecameInactive,
    ZoomSettled(ZoomState),
}

/// One combatant's copy of one weapon
#[derive(Debug, Clone)]
pub struct WeaponInstance {
    reference: WeaponRef,
    spec: WeaponSpec,
    role: ContextRole,
    ammo: u32,
    state: WeaponState,
    pending: u8,
    current_fire_mode: Option<FireModeId>,
    zoom: ZoomStatus,
    zoom_mode: Option<FireModeId>,
    next_fire_at: TimeMs,
    shots_fired: u32,
    flash_count: u8,
    /// Authority-owned acceptance window for this weapon's intents
    sequence: SequenceWindow,
}

impl WeaponInstance {
    pub fn new(reference: WeaponRef, spec: WeaponSpec, role: ContextRole) -> Self {
        let ammo = spec.initial_ammo.min(spec.max_ammo);
        Self {
            reference,
            spec,
            role,
            ammo,
            state: WeaponState::Inactive,
            pending: 0,
            current_fire_mode: None,
            zoom: ZoomStatus::default(),
            zoom_mode: None,
            next_fire_at: 0,
            shots_fired: 0,
            flash_count: 0,
            sequence: SequenceWindow::default(),
        }
    }

    pub fn reference(&self) -> WeaponRef {
        self.reference
    }

    pub fn kind(&self) -> WeaponKind {
        self.reference.kind
    }

    pub fn spec(&self) -> &WeaponSpec {
        &self.spec
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn state(&self) -> WeaponState {
        self.state
    }

    pub fn ammo(&self) -> u32 {
        self.ammo
    }

    pub fn max_ammo(&self) -> u32 {
        self.spec.max_ammo
    }

    pub fn zoom(&self) -> ZoomStatus {
        self.zoom
    }

    pub fn zoom_mode(&self) -> Option<FireModeId> {
        self.zoom_mode
    }

    pub fn current_fire_mode(&self) -> Option<FireModeId> {
        self.current_fire_mode
    }

    pub fn shots_fired(&self) -> u32 {
        self.shots_fired
    }

    pub fn flash_count(&self) -> u8 {
        self.flash_count
    }

    pub fn sequence(&self) -> &SequenceWindow {
        &self.sequence
    }

    pub fn sequence_mut(&mut self) -> &mut SequenceWindow {
        &mut self.sequence
    }

    pub fn last_accepted(&self) -> SequenceIndex {
        self.sequence.last_accepted()
    }

    pub fn is_pending(&self, mode: FireModeId) -> bool {
        (mode as usize) < MAX_FIRE_MODES && self.pending & (1 << mode) != 0
    }

    pub fn any_pending(&self) -> bool {
        self.pending != 0
    }

    pub fn has_ammo_for(&self, mode: FireModeId) -> bool {
        self.spec
            .mode(mode)
            .map(|m| self.ammo >= m.ammo_cost)
            .unwrap_or(false)
    }

    /// Whether any firing mode can still be paid for
    pub fn has_any_ammo(&self) -> bool {
        self.spec
            .min_ammo_cost()
            .map(|cost| self.ammo >= cost)
            .unwrap_or(false)
    }

    fn set_pending(&mut self, mode: FireModeId, on: bool) {
        if on {
            self.pending |= 1 << mode;
        } else {
            self.pending &= !(1 << mode);
        }
    }

    fn lowest_pending(&self) -> Option<FireModeId> {
        (0..self.spec.modes.len() as FireModeId).find(|m| self.is_pending(*m))
    }

    fn mode_spec(&self, mode: FireModeId) -> Result<&FireModeSpec, FireRejection> {
        if mode as usize >= MAX_FIRE_MODES {
            return Err(FireRejection::UnknownFireMode {
                weapon: self.kind(),
                mode,
            });
        }
        self.spec.mode(mode).ok_or(FireRejection::UnknownFireMode {
            weapon: self.kind(),
            mode,
        })
    }

    /// Start bringing the weapon up
    pub fn equip(&mut self, now: TimeMs) -> Result<(), FireRejection> {
        match self.state {
            WeaponState::Inactive | WeaponState::Unequipping { .. } => {
                self.state = WeaponState::Equipping {
                    ready_at: now + self.spec.equip_ms,
                };
                Ok(())
            }
            _ => Err(FireRejection::IllegalTransition("weapon already up")),
        }
    }

    /// Start putting the weapon away; pending fire is dropped
    pub fn put_down(&mut self, now: TimeMs) -> Result<(), FireRejection> {
        match self.state {
            WeaponState::Inactive | WeaponState::Unequipping { .. } => {
                Err(FireRejection::IllegalTransition("weapon already down"))
            }
            _ => {
                self.pending = 0;
                self.current_fire_mode = None;
                self.clear_zoom();
                self.state = WeaponState::Unequipping {
                    done_at: now + self.spec.put_down_ms,
                };
                Ok(())
            }
        }
    }

    /// Drop straight to Inactive (owner invalid, weapon switched away)
    pub fn force_inactive(&mut self) {
        self.pending = 0;
        self.current_fire_mode = None;
        self.clear_zoom();
        self.state = WeaponState::Inactive;
    }

    fn clear_zoom(&mut self) {
        self.zoom = ZoomStatus::default();
        self.zoom_mode = None;
    }

    /// Press a fire mode
    pub fn begin_firing(
        &mut self,
        mode: FireModeId,
        gate: &FireGate,
        hooks: &FireHooks,
        now: TimeMs,
    ) -> Result<FireOutcome, FireRejection> {
        let kind = self.mode_spec(mode)?.kind;

        if !gate.owner_alive {
            return Err(FireRejection::IllegalTransition("owner cannot fire"));
        }
        if gate.fire_suppressed {
            return Err(FireRejection::IllegalTransition("fire suppressed"));
        }
        if !(hooks.movement_allows_fire)(gate.movement) {
            return Err(FireRejection::IllegalTransition("movement forbids firing"));
        }

        match self.state {
            WeaponState::Inactive => Err(FireRejection::IllegalTransition("weapon not equipped")),
            WeaponState::Unequipping { .. } => {
                Err(FireRejection::IllegalTransition("weapon is being put down"))
            }
            WeaponState::Equipping { .. } => {
                self.set_pending(mode, true);
                Ok(FireOutcome::Deferred)
            }
            WeaponState::Active => {
                self.set_pending(mode, true);
                self.enter_mode(mode, kind, now);
                Ok(FireOutcome::Started)
            }
            WeaponState::Firing { mode: held } | WeaponState::Zooming { mode: held }
                if held == mode =>
            {
                self.set_pending(mode, true);
                Ok(FireOutcome::AlreadyFiring)
            }
            WeaponState::Zooming { .. } if kind != FireKind::Zoom => {
                // Fire while zoomed; the zoom stays up underneath
                self.set_pending(mode, true);
                self.enter_mode(mode, kind, now);
                Ok(FireOutcome::Started)
            }
            WeaponState::Firing { mode: held } | WeaponState::Zooming { mode: held } => {
                self.set_pending(mode, true);
                (hooks.on_multi_press)(self.reference, held, mode);
                Ok(FireOutcome::MultiPress { held })
            }
        }
    }

    fn enter_mode(&mut self, mode: FireModeId, kind: FireKind, now: TimeMs) {
        self.current_fire_mode = Some(mode);
        if kind == FireKind::Zoom {
            self.zoom_mode = Some(mode);
            if self.role == ContextRole::Controller
                && matches!(self.zoom.state, ZoomState::Off | ZoomState::ZoomingOut)
            {
                self.zoom.state = ZoomState::ZoomingIn;
            }
            self.state = WeaponState::Zooming { mode };
        } else {
            self.next_fire_at = self.next_fire_at.max(now);
            self.state = WeaponState::Firing { mode };
        }
    }

    /// Release a fire mode
    pub fn end_firing(&mut self, mode: FireModeId, now: TimeMs) -> Result<FireOutcome, FireRejection> {
        let kind = self.mode_spec(mode)?.kind;
        if !self.is_pending(mode) {
            return Err(FireRejection::IllegalTransition("mode not pressed"));
        }
        self.set_pending(mode, false);

        if kind == FireKind::Zoom {
            if self.role == ContextRole::Controller && self.zoom.state != ZoomState::Off {
                self.zoom.state = ZoomState::ZoomingOut;
            }
            if self.state == (WeaponState::Zooming { mode }) {
                self.zoom_mode = None;
                self.resume_after_mode(now);
            } else {
                self.zoom_mode = None;
            }
        }
        // Firing modes leave Firing on the next refire check so the shot in
        // flight completes.
        Ok(FireOutcome::Stopped)
    }

    fn resume_after_mode(&mut self, now: TimeMs) {
        match self.lowest_pending() {
            Some(next) => {
                let kind = self.spec.modes[next as usize].kind;
                self.enter_mode(next, kind, now);
            }
            None => {
                self.current_fire_mode = None;
                self.state = match self.zoom_mode {
                    Some(zoom) if self.is_pending(zoom) => WeaponState::Zooming { mode: zoom },
                    _ => WeaponState::Active,
                };
            }
        }
    }

    /// Advance timers and refire; `dt_ms` drives the controller-side zoom
    pub fn tick(&mut self, now: TimeMs, dt_ms: TimeMs) -> Vec<WeaponEvent> {
        let mut events = Vec::new();

        if self.role == ContextRole::Controller {
            if let Some(settled) = self.advance_zoom(dt_ms) {
                events.push(WeaponEvent::ZoomSettled(settled));
            }
        }

        match self.state {
            WeaponState::Equipping { ready_at } if now >= ready_at => {
                self.state = WeaponState::Active;
                events.push(WeaponEvent::BecameActive);
                if self.lowest_pending().is_some() {
                    self.resume_after_mode(now);
                }
            }
            WeaponState::Unequipping { done_at } if now >= done_at => {
                self.state = WeaponState::Inactive;
                events.push(WeaponEvent::BecameInactive);
            }
            WeaponState::Firing { mode } => {
                if !self.is_pending(mode) {
                    if now >= self.next_fire_at {
                        self.resume_after_mode(now);
                    }
                } else if now >= self.next_fire_at {
                    if self.has_ammo_for(mode) {
                        let refire = self.spec.modes[mode as usize].refire_ms;
                        events.push(WeaponEvent::Shot(ShotRequest {
                            weapon: self.reference,
                            mode,
                            shot_number: self.shots_fired,
                        }));
                        self.shots_fired = self.shots_fired.wrapping_add(1);
                        self.next_fire_at = now + refire;
                    } else {
                        self.set_pending(mode, false);
                        self.resume_after_mode(now);
                        events.push(WeaponEvent::OutOfAmmo);
                    }
                }
            }
            _ => {}
        }

        events
    }

    fn advance_zoom(&mut self, dt_ms: TimeMs) -> Option<ZoomState> {
        let zoom_time = self.spec.zoom.map(|z| z.zoom_time_ms.max(1))?;
        let step = dt_ms as f32 / zoom_time as f32;
        match self.zoom.state {
            ZoomState::ZoomingIn => {
                self.zoom.level = (self.zoom.level + step).min(1.0);
                if self.zoom.level >= 1.0 {
                    self.zoom.state = ZoomState::ZoomedIn;
                    return Some(ZoomState::ZoomedIn);
                }
            }
            ZoomState::ZoomingOut => {
                self.zoom.level = (self.zoom.level - step).max(0.0);
                if self.zoom.level <= 0.0 {
                    self.zoom.state = ZoomState::Off;
                    return Some(ZoomState::Off);
                }
            }
            ZoomState::Off | ZoomState::ZoomedIn => {}
        }
        None
    }

    /// Authority-only: take ammo for a resolved shot, never below zero
    pub fn consume_ammo(&mut self, cost: u32) -> u32 {
        self.ammo = self.ammo.saturating_sub(cost);
        self.ammo
    }

    /// Authority-only: add ammo up to the cap
    pub fn add_ammo(&mut self, amount: u32) -> u32 {
        self.ammo = self.ammo.saturating_add(amount).min(self.spec.max_ammo);
        self.ammo
    }

    /// Controller side: adopt the authority's ammo value
    pub fn sync_ammo(&mut self, ammo: u32) {
        self.ammo = ammo.min(self.spec.max_ammo);
    }

    /// Authority side: adopt the zoom the controller decided on
    pub fn mirror_zoom(&mut self, zoom: ZoomStatus) {
        self.zoom = ZoomStatus {
            state: zoom.state,
            level: zoom.level.clamp(0.0, 1.0),
        };
    }

    /// Next muzzle flash counter; 0 is reserved for "not firing"
    pub fn next_flash_count(&mut self) -> u8 {
        self.flash_count = self.flash_count.wrapping_add(1);
        if self.flash_count == 0 {
            self.flash_count = 1;
        }
        self.flash_count
    }
}

/// Best weapon to switch to: highest priority that can still fire
pub fn pick_best_weapon<'a, I>(weapons: I, exclude: WeaponKind) -> Option<WeaponKind>
where
    I: IntoIterator<Item = &'a WeaponInstance>,
{
    weapons
        .into_iter()
        .filter(|w| w.kind() != exclude && w.has_any_ammo())
        .max_by_key(|w| w.spec().priority)
        .map(WeaponInstance::kind)
}

/// Seed for a shot's random spread, identical on every context
pub fn shot_seed(session_seed: u64, weapon: WeaponRef, sequence: SequenceIndex, shot_number: u32) -> u64 {
    let owner = weapon.owner.as_u128();
    let folded = (owner as u64) ^ ((owner >> 64) as u64);
    session_seed
        ^ folded.rotate_left(17)
        ^ ((weapon.kind as u64) << 56)
        ^ ((sequence.0 as u64) << 32)
        ^ shot_number as u64
}

/// Deviate `direction` by up to `spread` radians using the shot seed
pub fn spread_direction(direction: Vec3, spread: f32, seed: u64) -> Vec3 {
    let forward = direction.normalize_or(Vec3::X);
    if spread <= 0.0 {
        return forward;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let yaw = rng.gen_range(-spread..=spread);
    let pitch = rng.gen_range(-spread..=spread);
    let right = forward.cross(Vec3::Z).normalize_or(Vec3::Y);
    let up = right.cross(forward).normalize_or(Vec3::Z);
    (forward + right * yaw.tan() + up * pitch.tan()).normalize_or(forward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn weapon(kind: WeaponKind, role: ContextRole) -> WeaponInstance {
        WeaponInstance::new(WeaponRef::new(Uuid::new_v4(), kind), WeaponSpec::for_kind(kind), role)
    }

    fn active(kind: WeaponKind, role: ContextRole) -> WeaponInstance {
        let mut w = weapon(kind, role);
        w.equip(0).unwrap();
        let ready = w.spec().equip_ms;
        assert_eq!(w.tick(ready, ready), vec![WeaponEvent::BecameActive]);
        w
    }

    fn shots(events: &[WeaponEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, WeaponEvent::Shot(_)))
            .count()
    }

    #[test]
    fn starts_inactive_and_equips() {
        let mut w = weapon(WeaponKind::Pistol, ContextRole::Authority);
        assert_eq!(w.state(), WeaponState::Inactive);
        w.equip(100).unwrap();
        assert_eq!(w.state(), WeaponState::Equipping { ready_at: 400 });
        assert!(w.tick(399, 16).is_empty());
        assert_eq!(w.tick(400, 16), vec![WeaponEvent::BecameActive]);
        assert_eq!(w.state(), WeaponState::Active);
    }

    #[test]
    fn firing_shoots_at_refire_interval() {
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        let hooks = FireHooks::default();
        assert_eq!(w.begin_firing(0, &FireGate::open(), &hooks, 1_000), Ok(FireOutcome::Started));
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });

        assert_eq!(shots(&w.tick(1_000, 16)), 1);
        assert_eq!(shots(&w.tick(1_200, 16)), 0);
        assert_eq!(shots(&w.tick(1_400, 16)), 1);
        assert_eq!(w.shots_fired(), 2);
    }

    #[test]
    fn release_leaves_firing_after_refire() {
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        let hooks = FireHooks::default();
        w.begin_firing(0, &FireGate::open(), &hooks, 1_000).unwrap();
        w.tick(1_000, 16);
        assert_eq!(w.end_firing(0, 1_050), Ok(FireOutcome::Stopped));
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });
        w.tick(1_100, 16);
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });
        assert_eq!(shots(&w.tick(1_400, 16)), 0);
        assert_eq!(w.state(), WeaponState::Active);
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let hooks = FireHooks::default();
        let mut w = weapon(WeaponKind::Pistol, ContextRole::Authority);
        assert!(matches!(
            w.begin_firing(0, &FireGate::open(), &hooks, 0),
            Err(FireRejection::IllegalTransition(_))
        ));

        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        w.put_down(500).unwrap();
        assert!(matches!(
            w.begin_firing(0, &FireGate::open(), &hooks, 510),
            Err(FireRejection::IllegalTransition(_))
        ));
        assert!(!w.any_pending());
        assert!(w.end_firing(0, 510).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut w = active(WeaponKind::RocketLauncher, ContextRole::Authority);
        assert_eq!(
            w.begin_firing(3, &FireGate::open(), &FireHooks::default(), 0),
            Err(FireRejection::UnknownFireMode {
                weapon: WeaponKind::RocketLauncher,
                mode: 3
            })
        );
        assert!(w.begin_firing(200, &FireGate::open(), &FireHooks::default(), 0).is_err());
    }

    #[test]
    fn gate_blocks_firing() {
        let hooks = FireHooks::default();
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);

        let suppressed = FireGate {
            fire_suppressed: true,
            ..FireGate::open()
        };
        assert!(w.begin_firing(0, &suppressed, &hooks, 0).is_err());

        let incapacitated = FireGate {
            movement: MovementState::Incapacitated,
            ..FireGate::open()
        };
        assert!(w.begin_firing(0, &incapacitated, &hooks, 0).is_err());

        let swimming_forbidden = FireHooks {
            movement_allows_fire: Arc::new(|m| m != MovementState::Swimming),
            ..FireHooks::default()
        };
        let swimming = FireGate {
            movement: MovementState::Swimming,
            ..FireGate::open()
        };
        assert!(w.begin_firing(0, &swimming, &swimming_forbidden, 0).is_err());
        assert!(w.begin_firing(0, &swimming, &hooks, 0).is_ok());
    }

    #[test]
    fn press_during_equip_fires_once_ready() {
        let hooks = FireHooks::default();
        let mut w = weapon(WeaponKind::Pistol, ContextRole::Authority);
        w.equip(0).unwrap();
        assert_eq!(w.begin_firing(0, &FireGate::open(), &hooks, 100), Ok(FireOutcome::Deferred));
        let events = w.tick(300, 16);
        assert_eq!(events[0], WeaponEvent::BecameActive);
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });
        assert_eq!(shots(&w.tick(316, 16)), 1);
    }

    #[test]
    fn second_mode_raises_multi_press() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hooks = FireHooks {
            on_multi_press: Arc::new(move |_, held, pressed| {
                assert_eq!((held, pressed), (0, 1));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ..FireHooks::default()
        };
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        w.begin_firing(0, &FireGate::open(), &hooks, 0).unwrap();
        assert_eq!(
            w.begin_firing(1, &FireGate::open(), &hooks, 10),
            Ok(FireOutcome::MultiPress { held: 0 })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });

        // Releasing the held mode hands over to the other pressed one
        w.end_firing(0, 20).unwrap();
        w.tick(400, 16);
        assert_eq!(w.state(), WeaponState::Firing { mode: 1 });
    }

    #[test]
    fn running_dry_stops_and_reports() {
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        w.consume_ammo(29);
        w.begin_firing(0, &FireGate::open(), &FireHooks::default(), 0).unwrap();
        assert_eq!(shots(&w.tick(0, 16)), 1);
        w.consume_ammo(1);
        let events = w.tick(400, 16);
        assert!(events.contains(&WeaponEvent::OutOfAmmo));
        assert_eq!(w.state(), WeaponState::Active);
    }

    #[test]
    fn ammo_never_goes_negative() {
        let mut w = weapon(WeaponKind::Pistol, ContextRole::Authority);
        let start = w.ammo();
        for _ in 0..(start + 10) {
            w.consume_ammo(1);
        }
        assert_eq!(w.ammo(), 0);
        assert_eq!(w.add_ammo(500), w.max_ammo());
    }

    #[test]
    fn controller_drives_zoom() {
        let hooks = FireHooks::default();
        let mut w = active(WeaponKind::SniperRifle, ContextRole::Controller);
        assert_eq!(w.begin_firing(1, &FireGate::open(), &hooks, 0), Ok(FireOutcome::Started));
        assert_eq!(w.state(), WeaponState::Zooming { mode: 1 });
        assert_eq!(w.zoom().state, ZoomState::ZoomingIn);

        w.tick(200, 200);
        assert!((w.zoom().level - 0.5).abs() < 1.0e-4);
        assert_eq!(w.tick(400, 200), vec![WeaponEvent::ZoomSettled(ZoomState::ZoomedIn)]);

        // Primary fire while zoomed, then back to zooming
        w.begin_firing(0, &FireGate::open(), &hooks, 500).unwrap();
        assert_eq!(w.state(), WeaponState::Firing { mode: 0 });
        assert_eq!(shots(&w.tick(500, 16)), 1);
        w.end_firing(0, 520).unwrap();
        w.tick(1_800, 16);
        assert_eq!(w.state(), WeaponState::Zooming { mode: 1 });

        w.end_firing(1, 1_900).unwrap();
        assert_eq!(w.state(), WeaponState::Active);
        assert_eq!(w.zoom().state, ZoomState::ZoomingOut);
    }

    #[test]
    fn authority_never_originates_zoom() {
        let mut w = active(WeaponKind::SniperRifle, ContextRole::Authority);
        w.begin_firing(1, &FireGate::open(), &FireHooks::default(), 0).unwrap();
        w.tick(1_000, 1_000);
        assert_eq!(w.zoom(), ZoomStatus::default());

        w.mirror_zoom(ZoomStatus {
            state: ZoomState::ZoomedIn,
            level: 1.5,
        });
        assert_eq!(w.zoom().level, 1.0);
    }

    #[test]
    fn force_inactive_clears_everything() {
        let mut w = active(WeaponKind::Pistol, ContextRole::Authority);
        w.begin_firing(0, &FireGate::open(), &FireHooks::default(), 0).unwrap();
        w.force_inactive();
        assert_eq!(w.state(), WeaponState::Inactive);
        assert!(!w.any_pending());
        assert!(w.tick(10_000, 16).is_empty());
    }

    #[test]
    fn best_weapon_prefers_priority_with_ammo() {
        let owner = Uuid::new_v4();
        let mut rocket = WeaponInstance::new(
            WeaponRef::new(owner, WeaponKind::RocketLauncher),
            WeaponSpec::for_kind(WeaponKind::RocketLauncher),
            ContextRole::Authority,
        );
        let sniper = WeaponInstance::new(
            WeaponRef::new(owner, WeaponKind::SniperRifle),
            WeaponSpec::for_kind(WeaponKind::SniperRifle),
            ContextRole::Authority,
        );
        let pistol = WeaponInstance::new(
            WeaponRef::new(owner, WeaponKind::Pistol),
            WeaponSpec::for_kind(WeaponKind::Pistol),
            ContextRole::Authority,
        );
        assert_eq!(
            pick_best_weapon([&rocket, &sniper, &pistol], WeaponKind::Pistol),
            Some(WeaponKind::RocketLauncher)
        );
        rocket.consume_ammo(100);
        assert_eq!(
            pick_best_weapon([&rocket, &sniper, &pistol], WeaponKind::Pistol),
            Some(WeaponKind::SniperRifle)
        );
    }

    #[test]
    fn flash_count_skips_zero() {
        let mut w = weapon(WeaponKind::Pistol, ContextRole::Authority);
        for _ in 0..255 {
            w.next_flash_count();
        }
        assert_eq!(w.flash_count(), 255);
        assert_eq!(w.next_flash_count(), 1);
    }

    #[test]
    fn spread_is_deterministic_per_seed() {
        let weapon = WeaponRef::new(Uuid::from_u128(7), WeaponKind::Pistol);
        let seed = shot_seed(42, weapon, SequenceIndex(3), 1);
        let a = spread_direction(Vec3::X, 0.05, seed);
        let b = spread_direction(Vec3::X, 0.05, seed);
        assert_eq!(a, b);
        assert!(a.angle_between(Vec3::X) <= 0.08);
        assert_eq!(spread_direction(Vec3::X * 3.0, 0.0, seed), Vec3::X);
    }
}
