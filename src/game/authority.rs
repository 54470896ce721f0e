//! Authoritative weapon context
//!
//! Owns every combatant's weapons, their sequence windows and ammo. Intents
//! from controllers are re-validated here before any shot is resolved; shot
//! resolution runs the hit scanner or the projectile spawner, then pays ammo.
//! Everything the context wants to say goes into an outbox the session
//! drains after each call.

use std::collections::{BTreeMap, HashMap};

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::util::time::TimeMs;
use crate::ws::protocol::{AuthorityMsg, WeaponSnapshot};

use super::capabilities::{Damageable, EffectSink, Fireable, WorldGeometry};
use super::combat::{Combatant, MovementState, Roster};
use super::error::FireRejection;
use super::history::PositionRecorder;
use super::hitscan::{HitScanner, ReportedHit, ScanConfig, ScanRequest, ShotTrace};
use super::prediction::PredictionRegistry;
use super::projectile::{ProjectileImpact, ProjectileLaunch, ProjectileSet, ShotKey, SpawnPlan};
use super::scheduler::Scheduler;
use super::sequence::SequenceIndex;
use super::snapshot::snapshot_weapon;
use super::weapon::{
    pick_best_weapon, shot_seed, spread_direction, CombatantId, ContextRole, FireGate, FireHooks,
    FireKind, FireModeId, FireModeSpec, FireOutcome, ShotRequest, TapWindow, WeaponEvent,
    WeaponInstance, WeaponKind, WeaponRef, WeaponSpec, WeaponState, ZoomStatus,
};
use super::world::StaticWorld;

/// Weapon brought up on join
pub const DEFAULT_WEAPON: WeaponKind = WeaponKind::Pistol;

/// Delay between death and respawn
pub const RESPAWN_DELAY_MS: TimeMs = 3_000;

const SPAWN_RING: (f32, f32) = (200.0, 1_500.0);

/// Who an outbound message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Participant(CombatantId),
    /// Everyone except the named participant
    Observers(CombatantId),
    All,
}

impl Recipient {
    pub fn includes(&self, participant: CombatantId) -> bool {
        match self {
            Recipient::Participant(id) => *id == participant,
            Recipient::Observers(id) => *id != participant,
            Recipient::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Recipient,
    pub msg: AuthorityMsg,
}

/// Messages produced while handling input or ticking
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<Outbound>,
}

impl Outbox {
    pub fn push(&mut self, to: Recipient, msg: AuthorityMsg) {
        self.messages.push(Outbound { to, msg });
    }

    pub fn take(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl EffectSink for Outbox {
    fn firing_state(&mut self, weapon: WeaponRef, mode: FireModeId, flash_count: u8, flash_location: Option<Vec3>) {
        // The owner already played its own effects
        self.push(
            Recipient::Observers(weapon.owner),
            AuthorityMsg::BroadcastFiringState {
                owner: weapon.owner,
                weapon: weapon.kind,
                fire_mode: mode,
                flash_count,
                flash_location,
            },
        );
    }
}

/// What a scheduled task is cancelled with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskScope {
    Weapon(WeaponRef),
    Owner(CombatantId),
}

/// Delayed work run on the authority's own tick
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorityTask {
    SpawnProjectile {
        launch: ProjectileLaunch,
        fast_forward_ms: TimeMs,
    },
    /// Tap grace ran out before the shot fired
    DeferredStop { mode: FireModeId },
    Respawn,
}

#[derive(Debug, Clone, Copy, Default)]
struct StartIntent {
    aux_offset: Option<f32>,
    locally_hit: bool,
}

#[derive(Debug)]
struct Loadout {
    weapons: BTreeMap<WeaponKind, WeaponInstance>,
    current: Option<WeaponKind>,
    pending_switch: Option<WeaponKind>,
    intents: HashMap<WeaponKind, StartIntent>,
    /// Index of the start intent behind the current firing sequence
    start_sequences: HashMap<WeaponKind, SequenceIndex>,
    reported: HashMap<WeaponKind, ReportedHit>,
    taps: HashMap<(WeaponKind, FireModeId), TapWindow>,
}

impl Loadout {
    fn new(owner: CombatantId) -> Self {
        let weapons = WeaponKind::ALL
            .iter()
            .map(|&kind| {
                let weapon = WeaponInstance::new(
                    WeaponRef::new(owner, kind),
                    WeaponSpec::for_kind(kind),
                    ContextRole::Authority,
                );
                (kind, weapon)
            })
            .collect();
        Self {
            weapons,
            current: None,
            pending_switch: None,
            intents: HashMap::new(),
            start_sequences: HashMap::new(),
            reported: HashMap::new(),
            taps: HashMap::new(),
        }
    }
}

/// The single context whose decisions about ammo, damage and projectiles bind
pub struct AuthorityContext<W = StaticWorld> {
    config: EngineConfig,
    hooks: FireHooks,
    session_seed: u64,
    world: W,
    roster: Roster,
    history: PositionRecorder,
    prediction: PredictionRegistry,
    loadouts: HashMap<CombatantId, Loadout>,
    /// Send time of the latest pong per participant, awaiting its echo
    latency_probes: HashMap<CombatantId, TimeMs>,
    projectiles: ProjectileSet,
    scheduler: Scheduler<TaskScope, AuthorityTask>,
    outbox: Outbox,
    spawn_rng: ChaCha8Rng,
    fire_suppressed: bool,
    tick: u64,
    hit_mismatches: u64,
}

impl<W: WorldGeometry> AuthorityContext<W> {
    pub fn new(config: EngineConfig, hooks: FireHooks, world: W, session_seed: u64) -> Self {
        Self {
            prediction: PredictionRegistry::new(&config),
            config,
            hooks,
            session_seed,
            world,
            roster: Roster::new(),
            history: PositionRecorder::default(),
            loadouts: HashMap::new(),
            latency_probes: HashMap::new(),
            projectiles: ProjectileSet::new(),
            scheduler: Scheduler::new(),
            outbox: Outbox::default(),
            spawn_rng: ChaCha8Rng::seed_from_u64(session_seed),
            fire_suppressed: false,
            tick: 0,
            hit_mismatches: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session_seed(&self) -> u64 {
        self.session_seed
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn projectiles(&self) -> &ProjectileSet {
        &self.projectiles
    }

    pub fn participant_count(&self) -> usize {
        self.loadouts.len()
    }

    pub fn is_participant(&self, participant: &CombatantId) -> bool {
        self.loadouts.contains_key(participant)
    }

    pub fn weapon(&self, participant: &CombatantId, kind: WeaponKind) -> Option<&WeaponInstance> {
        self.loadouts.get(participant)?.weapons.get(&kind)
    }

    pub fn current_weapon(&self, participant: &CombatantId) -> Option<WeaponKind> {
        self.loadouts.get(participant)?.current
    }

    /// Index the weapon's shots are seeded and matched with
    pub fn start_sequence(&self, participant: &CombatantId, kind: WeaponKind) -> Option<SequenceIndex> {
        self.loadouts.get(participant)?.start_sequences.get(&kind).copied()
    }

    /// Client/authority hit disagreements seen with diagnostics enabled
    pub fn hit_mismatches(&self) -> u64 {
        self.hit_mismatches
    }

    /// Global fire suppression (round over, warmup)
    pub fn set_fire_suppressed(&mut self, suppressed: bool) {
        self.fire_suppressed = suppressed;
    }

    pub fn send(&mut self, to: Recipient, msg: AuthorityMsg) {
        self.outbox.push(to, msg);
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.take()
    }

    /// Snapshots of every weapon, or only `owner`'s
    pub fn weapon_snapshots(&self, owner: Option<CombatantId>) -> Vec<WeaponSnapshot> {
        let mut owners: Vec<&CombatantId> = self
            .loadouts
            .keys()
            .filter(|id| owner.map_or(true, |o| o == **id))
            .collect();
        owners.sort();
        owners
            .into_iter()
            .filter_map(|id| self.loadouts.get(id))
            .flat_map(|loadout| {
                loadout
                    .weapons
                    .values()
                    .map(move |w| snapshot_weapon(w, loadout.current == Some(w.kind())))
            })
            .collect()
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            friendly_fire: self.config.friendly_fire,
            hit_padding: self.config.hit_padding,
        }
    }

    fn spawn_point(&mut self) -> Vec3 {
        let angle = self.spawn_rng.gen_range(0.0..std::f32::consts::TAU);
        let distance = self.spawn_rng.gen_range(SPAWN_RING.0..SPAWN_RING.1);
        Vec3::new(angle.cos() * distance, angle.sin() * distance, 0.0)
    }

    fn fire_gate(&self, participant: &CombatantId) -> FireGate {
        match self.roster.get(participant) {
            Some(c) => FireGate {
                owner_alive: c.alive,
                movement: c.movement,
                fire_suppressed: self.fire_suppressed,
            },
            None => FireGate {
                owner_alive: false,
                movement: MovementState::default(),
                fire_suppressed: self.fire_suppressed,
            },
        }
    }

    /// Add a participant with a fresh loadout and the default weapon coming up
    pub fn join(&mut self, participant: CombatantId, team: Option<u8>, now: TimeMs) -> Result<Vec3, FireRejection> {
        if self.loadouts.contains_key(&participant) {
            return Err(FireRejection::IllegalTransition("already joined"));
        }
        let position = self.spawn_point();
        self.roster.insert(Combatant::new(participant, team, position));
        self.history.record(participant, now, position);
        self.prediction.context_mut(participant);

        let mut loadout = Loadout::new(participant);
        if let Some(weapon) = loadout.weapons.get_mut(&DEFAULT_WEAPON) {
            weapon.equip(now)?;
            loadout.current = Some(DEFAULT_WEAPON);
        }
        for weapon in loadout.weapons.values() {
            self.outbox.push(
                Recipient::Participant(participant),
                AuthorityMsg::NotifyAmmoChanged {
                    weapon: weapon.kind(),
                    ammo: weapon.ammo(),
                },
            );
        }
        self.loadouts.insert(participant, loadout);
        info!(participant_id = %participant, "participant joined");
        Ok(position)
    }

    /// Remove a participant; every task scheduled for them is cancelled
    pub fn leave(&mut self, participant: CombatantId) -> bool {
        let Some(loadout) = self.loadouts.remove(&participant) else {
            return false;
        };
        for kind in loadout.weapons.keys() {
            self.scheduler
                .cancel_scope(TaskScope::Weapon(WeaponRef::new(participant, *kind)));
        }
        self.scheduler.cancel_scope(TaskScope::Owner(participant));
        self.roster.remove(&participant);
        self.history.forget(&participant);
        self.prediction.remove(&participant);
        self.latency_probes.remove(&participant);
        self.projectiles.remove_owner(participant);
        info!(participant_id = %participant, "participant left");
        true
    }

    /// Fold a round trip measured here into the participant's prediction context
    pub fn record_round_trip(&mut self, participant: CombatantId, rtt_ms: TimeMs) {
        if self.loadouts.contains_key(&participant) {
            self.prediction.context_mut(participant).record_round_trip(rtt_ms);
        }
    }

    /// A pong went out at `sent_at`; only its echo counts as a sample
    pub fn await_echo(&mut self, participant: CombatantId, sent_at: TimeMs) {
        if self.loadouts.contains_key(&participant) {
            self.latency_probes.insert(participant, sent_at);
        }
    }

    /// The controller bounced a pong back. Echoes of anything but the latest
    /// pong are ignored, so a controller cannot invent its own latency.
    pub fn record_echo(&mut self, participant: CombatantId, server_time: TimeMs, now: TimeMs) -> bool {
        if self.latency_probes.get(&participant) != Some(&server_time) {
            debug!(participant_id = %participant, server_time, "unsolicited echo");
            return false;
        }
        self.latency_probes.remove(&participant);
        self.record_round_trip(participant, now.saturating_sub(server_time));
        true
    }

    pub fn prediction_time_ms(&self, participant: &CombatantId) -> TimeMs {
        self.prediction.prediction_time_ms(participant)
    }

    /// Run the sequence window for a fire intent and acknowledge the result
    fn accept_sequence(
        &mut self,
        participant: CombatantId,
        kind: WeaponKind,
        seq: SequenceIndex,
    ) -> Result<(), FireRejection> {
        let weapon = self
            .loadouts
            .get_mut(&participant)
            .ok_or(FireRejection::InvalidOwner {
                owner: participant,
                weapon: kind,
            })?
            .weapons
            .get_mut(&kind)
            .ok_or(FireRejection::UnknownWeapon {
                owner: participant,
                weapon: kind,
            })?;

        // The sentinel is for resync only
        let result = if seq.is_resync() {
            Err(FireRejection::StaleEvent {
                index: seq.0,
                last_accepted: weapon.last_accepted().0,
            })
        } else {
            weapon.sequence_mut().accept(seq)
        };

        let last_accepted = weapon.last_accepted();
        self.outbox.push(
            Recipient::Participant(participant),
            AuthorityMsg::AckFireEvent {
                weapon: kind,
                last_accepted,
            },
        );
        result
    }

    /// Owner must be alive; otherwise the weapon drops to Inactive
    fn check_owner(&mut self, participant: CombatantId, kind: WeaponKind) -> Result<(), FireRejection> {
        if self.roster.is_alive(&participant) {
            return Ok(());
        }
        self.invalidate_weapon(participant, kind);
        Err(FireRejection::InvalidOwner {
            owner: participant,
            weapon: kind,
        })
    }

    /// Force a weapon Inactive and cancel everything scheduled for it
    fn invalidate_weapon(&mut self, participant: CombatantId, kind: WeaponKind) {
        let reference = WeaponRef::new(participant, kind);
        self.scheduler.cancel_scope(TaskScope::Weapon(reference));
        if let Some(loadout) = self.loadouts.get_mut(&participant) {
            loadout.taps.retain(|(k, _), _| *k != kind);
            loadout.intents.remove(&kind);
            loadout.start_sequences.remove(&kind);
            if let Some(weapon) = loadout.weapons.get_mut(&kind) {
                weapon.force_inactive();
            }
        }
    }

    /// RequestStartFire
    #[allow(clippy::too_many_arguments)]
    pub fn start_fire(
        &mut self,
        participant: CombatantId,
        kind: WeaponKind,
        mode: FireModeId,
        seq: SequenceIndex,
        aux_offset: Option<f32>,
        locally_hit: bool,
        now: TimeMs,
    ) -> Result<FireOutcome, FireRejection> {
        self.accept_sequence(participant, kind, seq)?;
        self.check_owner(participant, kind)?;

        let gate = self.fire_gate(&participant);
        let loadout = self
            .loadouts
            .get_mut(&participant)
            .ok_or(FireRejection::InvalidOwner {
                owner: participant,
                weapon: kind,
            })?;
        let weapon = loadout.weapons.get_mut(&kind).ok_or(FireRejection::UnknownWeapon {
            owner: participant,
            weapon: kind,
        })?;

        let tap = TapWindow::open(weapon, now);
        let outcome = weapon.begin_firing(mode, &gate, &self.hooks, now)?;
        loadout.intents.insert(
            kind,
            StartIntent {
                aux_offset,
                locally_hit,
            },
        );
        // A repeat press keeps the sequence its run was started with
        if outcome != FireOutcome::AlreadyFiring {
            loadout.start_sequences.insert(kind, seq);
        }
        if !matches!(outcome, FireOutcome::MultiPress { .. }) {
            if let Some(previous) = loadout.taps.insert((kind, mode), tap) {
                if let Some(task) = previous.deferred_stop {
                    self.scheduler.cancel(task);
                }
            }
        }
        debug!(participant_id = %participant, weapon = ?kind, mode, seq = seq.0, ?outcome, "start fire accepted");

        // Resolve the first shot on receipt rather than next frame
        self.advance_weapon(participant, kind, now, 0);
        Ok(outcome)
    }

    /// RequestStopFire
    pub fn stop_fire(
        &mut self,
        participant: CombatantId,
        kind: WeaponKind,
        mode: FireModeId,
        seq: SequenceIndex,
        now: TimeMs,
    ) -> Result<FireOutcome, FireRejection> {
        self.accept_sequence(participant, kind, seq)?;
        self.check_owner(participant, kind)?;

        let tap_grace_ms = self.config.tap_grace_ms;
        let loadout = self
            .loadouts
            .get_mut(&participant)
            .ok_or(FireRejection::InvalidOwner {
                owner: participant,
                weapon: kind,
            })?;
        let weapon = loadout.weapons.get_mut(&kind).ok_or(FireRejection::UnknownWeapon {
            owner: participant,
            weapon: kind,
        })?;

        if let Some(tap) = loadout.taps.get_mut(&(kind, mode)) {
            if tap.holds_release(weapon, mode, now, tap_grace_ms) {
                if tap.deferred_stop.is_none() {
                    tap.deferred_stop = Some(self.scheduler.schedule(
                        now,
                        TapWindow::fallback_ms(weapon, mode, tap_grace_ms),
                        TaskScope::Weapon(weapon.reference()),
                        AuthorityTask::DeferredStop { mode },
                    ));
                }
                debug!(participant_id = %participant, weapon = ?kind, mode, "stop deferred until tap fires");
                return Ok(FireOutcome::Deferred);
            }
        }

        loadout.taps.remove(&(kind, mode));
        let outcome = weapon.end_firing(mode, now)?;
        debug!(participant_id = %participant, weapon = ?kind, mode, seq = seq.0, "stop fire accepted");
        Ok(outcome)
    }

    /// Apply a stop that was held back by the tap grace rule
    fn apply_deferred_stop(&mut self, participant: CombatantId, kind: WeaponKind, mode: FireModeId, now: TimeMs) {
        let Some(loadout) = self.loadouts.get_mut(&participant) else {
            return;
        };
        let Some(task) = loadout.taps.get(&(kind, mode)).and_then(|t| t.deferred_stop) else {
            return;
        };
        self.scheduler.cancel(task);
        loadout.taps.remove(&(kind, mode));
        if let Some(weapon) = loadout.weapons.get_mut(&kind) {
            let _ = weapon.end_firing(mode, now);
        }
    }

    /// ReportHitScanTarget: advisory only
    pub fn report_hit(
        &mut self,
        participant: CombatantId,
        kind: WeaponKind,
        target: CombatantId,
        seq: SequenceIndex,
    ) -> Result<(), FireRejection> {
        let loadout = self
            .loadouts
            .get_mut(&participant)
            .ok_or(FireRejection::InvalidOwner {
                owner: participant,
                weapon: kind,
            })?;
        if !loadout.weapons.contains_key(&kind) {
            return Err(FireRejection::UnknownWeapon {
                owner: participant,
                weapon: kind,
            });
        }
        loadout.reported.insert(kind, ReportedHit { target, sequence: seq });
        Ok(())
    }

    /// SetZoom: mirror the controller's zoom and relay it to observers
    pub fn set_zoom(&mut self, participant: CombatantId, kind: WeaponKind, zoom: ZoomStatus) -> Result<(), FireRejection> {
        self.check_owner(participant, kind)?;
        let weapon = self
            .loadouts
            .get_mut(&participant)
            .and_then(|l| l.weapons.get_mut(&kind))
            .ok_or(FireRejection::UnknownWeapon {
                owner: participant,
                weapon: kind,
            })?;
        weapon.mirror_zoom(zoom);
        let mirrored = weapon.zoom();
        self.outbox.push(
            Recipient::Observers(participant),
            AuthorityMsg::ZoomChanged {
                owner: participant,
                weapon: kind,
                zoom: mirrored,
            },
        );
        Ok(())
    }

    /// SwitchWeapon: the old weapon drops straight to Inactive
    pub fn switch_weapon(&mut self, participant: CombatantId, kind: WeaponKind, now: TimeMs) -> Result<(), FireRejection> {
        let current = {
            let loadout = self
                .loadouts
                .get(&participant)
                .ok_or(FireRejection::InvalidOwner {
                    owner: participant,
                    weapon: kind,
                })?;
            if !loadout.weapons.contains_key(&kind) {
                return Err(FireRejection::UnknownWeapon {
                    owner: participant,
                    weapon: kind,
                });
            }
            loadout.current
        };
        self.check_owner(participant, kind)?;

        if let Some(old) = current {
            let old_state = self.weapon(&participant, old).map(WeaponInstance::state);
            if old == kind && old_state != Some(WeaponState::Inactive) {
                return Ok(());
            }
            self.invalidate_weapon(participant, old);
        }

        let loadout = self
            .loadouts
            .get_mut(&participant)
            .ok_or(FireRejection::InvalidOwner {
                owner: participant,
                weapon: kind,
            })?;
        loadout.current = Some(kind);
        loadout.pending_switch = None;
        if let Some(weapon) = loadout.weapons.get_mut(&kind) {
            weapon.equip(now)?;
        }
        debug!(participant_id = %participant, weapon = ?kind, "weapon switched");
        Ok(())
    }

    /// UpdateMovement from the external movement system
    pub fn update_movement(
        &mut self,
        participant: CombatantId,
        position: Vec3,
        aim: Vec3,
        movement: MovementState,
        now: TimeMs,
    ) -> Result<(), FireRejection> {
        let combatant = self
            .roster
            .get_mut(&participant)
            .ok_or(FireRejection::IllegalTransition("unknown combatant"))?;
        if !combatant.alive {
            return Err(FireRejection::IllegalTransition("dead combatants do not move"));
        }
        combatant.position = position;
        combatant.aim = aim.normalize_or(combatant.aim);
        combatant.movement = movement;
        self.history.record(participant, now, position);
        Ok(())
    }

    /// RequestResync: re-send everything the controller needs for one weapon
    pub fn resync(&mut self, participant: CombatantId, kind: WeaponKind, seq: SequenceIndex) -> Result<(), FireRejection> {
        let weapon = self
            .weapon(&participant, kind)
            .ok_or(FireRejection::UnknownWeapon {
                owner: participant,
                weapon: kind,
            })?;
        if !seq.is_resync() {
            return Err(FireRejection::StaleEvent {
                index: seq.0,
                last_accepted: weapon.last_accepted().0,
            });
        }
        let last_accepted = weapon.last_accepted();
        let ammo = weapon.ammo();
        let to = Recipient::Participant(participant);
        self.outbox.push(
            to,
            AuthorityMsg::AckFireEvent {
                weapon: kind,
                last_accepted,
            },
        );
        self.outbox
            .push(to, AuthorityMsg::NotifyAmmoChanged { weapon: kind, ammo });
        let weapons = self.weapon_snapshots(Some(participant));
        self.outbox.push(
            to,
            AuthorityMsg::WeaponSnapshots {
                tick: self.tick,
                weapons,
            },
        );
        Ok(())
    }

    /// One simulation step: timers, weapons, projectiles, history
    pub fn tick(&mut self, now: TimeMs, dt_ms: TimeMs) {
        self.tick += 1;

        for (scope, task) in self.scheduler.drain_due(now) {
            self.run_task(scope, task, now);
        }

        let mut participants: Vec<CombatantId> = self.loadouts.keys().copied().collect();
        participants.sort();
        for participant in participants {
            for kind in WeaponKind::ALL {
                self.advance_weapon(participant, kind, now, dt_ms);
            }
        }

        let impacts = self.projectiles.tick(dt_ms, &self.world, &self.roster);
        for impact in impacts {
            self.apply_impact(impact, now);
        }

        for combatant in self.roster.iter().filter(|c| c.alive) {
            self.history.record(combatant.id, now, combatant.position);
        }
    }

    fn run_task(&mut self, scope: TaskScope, task: AuthorityTask, now: TimeMs) {
        match (scope, task) {
            (
                TaskScope::Weapon(_),
                AuthorityTask::SpawnProjectile {
                    launch,
                    fast_forward_ms,
                },
            ) => {
                if self.roster.is_alive(&launch.key.weapon.owner) {
                    self.spawn_projectile(launch, fast_forward_ms, now);
                }
            }
            (TaskScope::Weapon(reference), AuthorityTask::DeferredStop { mode }) => {
                self.apply_deferred_stop(reference.owner, reference.kind, mode, now);
            }
            (TaskScope::Owner(participant), AuthorityTask::Respawn) => self.respawn(participant, now),
            (scope, task) => debug!(?scope, ?task, "task dropped: scope mismatch"),
        }
    }

    fn advance_weapon(&mut self, participant: CombatantId, kind: WeaponKind, now: TimeMs, dt_ms: TimeMs) {
        let Some(weapon) = self
            .loadouts
            .get_mut(&participant)
            .and_then(|l| l.weapons.get_mut(&kind))
        else {
            return;
        };
        let was_firing = match weapon.state() {
            WeaponState::Firing { mode } => Some(mode),
            _ => None,
        };
        let reference = weapon.reference();
        let events = weapon.tick(now, dt_ms);

        for event in events {
            match event {
                WeaponEvent::Shot(shot) => self.resolve_shot(shot, now),
                WeaponEvent::OutOfAmmo => self.handle_exhausted(participant, kind),
                WeaponEvent::BecameActive => {
                    debug!(participant_id = %participant, weapon = ?kind, "weapon active")
                }
                WeaponEvent::BecameInactive => {
                    debug!(participant_id = %participant, weapon = ?kind, "weapon inactive")
                }
                // Zoom progress belongs to the controller
                WeaponEvent::ZoomSettled(_) => {}
            }
        }

        let still_firing = matches!(
            self.weapon(&participant, kind).map(WeaponInstance::state),
            Some(WeaponState::Firing { .. })
        );
        if let (Some(mode), false) = (was_firing, still_firing) {
            self.outbox.firing_state(reference, mode, 0, None);
        }
    }

    fn resolve_shot(&mut self, shot: ShotRequest, now: TimeMs) {
        let owner = shot.weapon.owner;
        let kind = shot.weapon.kind;
        let Some(loadout) = self.loadouts.get(&owner) else {
            return;
        };
        let Some(weapon) = loadout.weapons.get(&kind) else {
            return;
        };
        let Some(spec) = weapon.spec().mode(shot.mode).cloned() else {
            return;
        };
        let intent = loadout.intents.get(&kind).copied().unwrap_or_default();
        let reported = loadout.reported.get(&kind).copied();
        let sequence = loadout
            .start_sequences
            .get(&kind)
            .copied()
            .unwrap_or(SequenceIndex::RESYNC);

        let Some(muzzle) = self.roster.muzzle(owner, intent.aux_offset) else {
            self.invalidate_weapon(owner, kind);
            return;
        };
        let seed = shot_seed(self.session_seed, shot.weapon, sequence, shot.shot_number);
        let direction = spread_direction(muzzle.direction, spec.spread, seed);
        let request = ScanRequest {
            shooter: owner,
            trace: ShotTrace::new(muzzle.origin, direction, spec.range, spec.trace_radius),
            now,
            rewind_ms: self.prediction.prediction_time_ms(&owner),
            sequence,
            ignore: Vec::new(),
            reported,
        };

        let flash_location = match spec.kind {
            FireKind::InstantHit => {
                let result = HitScanner::new(&self.world, &self.history, &self.roster, self.scan_config())
                    .point_trace(&request);
                self.check_mismatch(owner, kind, intent, reported, sequence, result.target);
                if let Some(target) = result.target {
                    let distance = result.travel_fraction * spec.range;
                    self.deal_scaled_damage(owner, target, &spec, direction, distance, now);
                }
                Some(result.point)
            }
            FireKind::ConeHit { half_angle } => {
                let results = HitScanner::new(&self.world, &self.history, &self.roster, self.scan_config())
                    .cone_trace(&request, half_angle);
                for result in &results {
                    if let Some(target) = result.target {
                        let distance = result.travel_fraction * spec.range;
                        self.deal_scaled_damage(owner, target, &spec, direction, distance, now);
                    }
                }
                Some(results.first().map(|r| r.point).unwrap_or_else(|| request.trace.end()))
            }
            FireKind::Projectile => {
                self.launch_projectile(shot, &spec, muzzle.origin, direction, sequence, now);
                None
            }
            FireKind::Zoom => return,
        };

        // Paid only once the shot has been resolved
        let Some(weapon) = self
            .loadouts
            .get_mut(&owner)
            .and_then(|l| l.weapons.get_mut(&kind))
        else {
            return;
        };
        let ammo = weapon.consume_ammo(spec.ammo_cost);
        let flash_count = weapon.next_flash_count();
        let exhausted = !weapon.has_any_ammo();

        self.outbox.push(
            Recipient::Participant(owner),
            AuthorityMsg::NotifyAmmoChanged { weapon: kind, ammo },
        );
        self.outbox
            .firing_state(shot.weapon, shot.mode, flash_count, flash_location);
        if exhausted {
            self.handle_exhausted(owner, kind);
        }
        self.apply_deferred_stop(owner, kind, shot.mode, now);
    }

    fn check_mismatch(
        &mut self,
        owner: CombatantId,
        kind: WeaponKind,
        intent: StartIntent,
        reported: Option<ReportedHit>,
        sequence: SequenceIndex,
        authoritative: Option<CombatantId>,
    ) {
        if !self.config.debug_hit_mismatch {
            return;
        }
        let claimed = reported.filter(|r| r.sequence == sequence).map(|r| r.target);
        if claimed.is_none() && !intent.locally_hit {
            return;
        }
        if claimed != authoritative {
            self.hit_mismatches += 1;
            debug!(
                participant_id = %owner,
                weapon = ?kind,
                seq = sequence.0,
                ?claimed,
                ?authoritative,
                "hit replication mismatch"
            );
        }
    }

    fn launch_projectile(
        &mut self,
        shot: ShotRequest,
        spec: &FireModeSpec,
        origin: Vec3,
        direction: Vec3,
        sequence: SequenceIndex,
        now: TimeMs,
    ) {
        let Some(projectile) = spec.projectile else {
            return;
        };
        let launch = ProjectileLaunch {
            key: ShotKey {
                weapon: shot.weapon,
                sequence,
                shot_number: shot.shot_number,
            },
            origin,
            direction,
            spec: projectile,
            damage: spec.damage,
            momentum: spec.momentum,
            cause: spec.cause,
        };
        let plan = self
            .prediction
            .get(&shot.weapon.owner)
            .map(SpawnPlan::for_shooter)
            .unwrap_or(SpawnPlan::Immediate { fast_forward_ms: 0 });

        match plan {
            SpawnPlan::Immediate { fast_forward_ms } => self.spawn_projectile(launch, fast_forward_ms, now),
            SpawnPlan::Deferred {
                delay_ms,
                fast_forward_ms,
            } => {
                debug!(
                    participant_id = %shot.weapon.owner,
                    weapon = ?shot.weapon.kind,
                    delay_ms,
                    "projectile spawn deferred"
                );
                self.scheduler.schedule(
                    now,
                    delay_ms,
                    TaskScope::Weapon(shot.weapon),
                    AuthorityTask::SpawnProjectile {
                        launch,
                        fast_forward_ms,
                    },
                );
            }
        }
    }

    fn spawn_projectile(&mut self, launch: ProjectileLaunch, fast_forward_ms: TimeMs, now: TimeMs) {
        let (id, impacts) =
            self.projectiles
                .spawn_authoritative(&launch, fast_forward_ms, now, &self.world, &self.roster);
        let velocity = launch.direction.normalize_or(Vec3::X) * launch.spec.speed;
        let position = self
            .projectiles
            .get(id)
            .map(|p| p.position)
            .or_else(|| impacts.first().map(|i| i.point))
            .unwrap_or(launch.origin);

        self.outbox.push(
            Recipient::All,
            AuthorityMsg::ProjectileSpawned {
                owner: launch.key.weapon.owner,
                weapon: launch.key.weapon.kind,
                shot_number: launch.key.shot_number,
                projectile_id: id,
                position,
                velocity,
                fast_forward_ms,
            },
        );
        for impact in impacts {
            self.apply_impact(impact, now);
        }
    }

    fn apply_impact(&mut self, impact: ProjectileImpact, now: TimeMs) {
        let Some(target) = impact.target else {
            return;
        };
        let owner = impact.key.weapon.owner;
        if !self.config.friendly_fire {
            let teammates = match (self.roster.get(&owner), self.roster.get(&target)) {
                (Some(a), Some(b)) => a.is_teammate_of(b),
                _ => false,
            };
            if teammates {
                return;
            }
        }
        self.deal_damage(owner, target, impact.damage, impact.cause, impact.momentum, now);
    }

    fn deal_scaled_damage(
        &mut self,
        instigator: CombatantId,
        target: CombatantId,
        spec: &FireModeSpec,
        direction: Vec3,
        distance: f32,
        now: TimeMs,
    ) {
        let amount = spec.damage * (self.hooks.damage_scale)(spec, distance);
        let momentum = direction * spec.momentum;
        self.deal_damage(instigator, target, amount, spec.cause, momentum, now);
    }

    fn deal_damage(
        &mut self,
        instigator: CombatantId,
        target: CombatantId,
        amount: f32,
        cause: &'static str,
        momentum: Vec3,
        now: TimeMs,
    ) {
        let Some(report) = self
            .roster
            .apply_damage(target, amount, cause, momentum, Some(instigator))
        else {
            return;
        };
        self.outbox.push(
            Recipient::All,
            AuthorityMsg::CombatantDamaged {
                instigator: Some(instigator),
                cause: cause.to_string(),
                report,
            },
        );
        if report.killed {
            self.on_killed(target, instigator, now);
        }
    }

    fn on_killed(&mut self, victim: CombatantId, killer: CombatantId, now: TimeMs) {
        info!(participant_id = %victim, killer = %killer, "combatant killed");
        for kind in WeaponKind::ALL {
            self.invalidate_weapon(victim, kind);
        }
        self.scheduler
            .schedule(now, RESPAWN_DELAY_MS, TaskScope::Owner(victim), AuthorityTask::Respawn);
    }

    fn respawn(&mut self, participant: CombatantId, now: TimeMs) {
        let position = self.spawn_point();
        if !self.roster.respawn(&participant, position) {
            return;
        }
        self.history.record(participant, now, position);

        let Some(loadout) = self.loadouts.get_mut(&participant) else {
            return;
        };
        // Sequence windows carry over: the controller's counter keeps running
        for weapon in loadout.weapons.values_mut() {
            let refill = weapon.spec().initial_ammo.saturating_sub(weapon.ammo());
            let ammo = weapon.add_ammo(refill);
            self.outbox.push(
                Recipient::Participant(participant),
                AuthorityMsg::NotifyAmmoChanged {
                    weapon: weapon.kind(),
                    ammo,
                },
            );
        }
        let kind = loadout.current.unwrap_or(DEFAULT_WEAPON);
        loadout.current = Some(kind);
        loadout.pending_switch = None;
        if let Some(weapon) = loadout.weapons.get_mut(&kind) {
            let _ = weapon.equip(now);
        }
        info!(participant_id = %participant, "combatant respawned");
    }

    /// Ammo ran dry: ask the owner to switch unless a switch is already pending
    fn handle_exhausted(&mut self, participant: CombatantId, kind: WeaponKind) {
        let Some(loadout) = self.loadouts.get_mut(&participant) else {
            return;
        };
        debug!(
            participant_id = %participant,
            reason = %FireRejection::AmmoExhausted { weapon: kind },
            "requesting weapon switch"
        );
        if loadout.pending_switch.is_some() {
            return;
        }
        let Some(best) = pick_best_weapon(loadout.weapons.values(), kind) else {
            return;
        };
        loadout.pending_switch = Some(best);
        self.outbox.push(
            Recipient::Participant(participant),
            AuthorityMsg::SwitchToBestWeapon { weapon: best },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::weapon::ZoomState;
    use uuid::Uuid;

    const SHOOTER: u128 = 1;
    const TARGET: u128 = 2;

    fn context(config: EngineConfig) -> AuthorityContext {
        AuthorityContext::new(config, FireHooks::default(), StaticWorld::new(), 7)
    }

    /// Shooter at the origin aiming +X, target 1000 units down range
    fn duel(config: EngineConfig) -> (AuthorityContext, CombatantId, CombatantId) {
        let mut ctx = context(config);
        let shooter = Uuid::from_u128(SHOOTER);
        let target = Uuid::from_u128(TARGET);
        ctx.join(shooter, None, 0).unwrap();
        ctx.join(target, None, 0).unwrap();
        ctx.update_movement(shooter, Vec3::ZERO, Vec3::X, MovementState::Grounded, 0)
            .unwrap();
        ctx.update_movement(target, Vec3::new(1_000.0, 0.0, 0.0), Vec3::NEG_X, MovementState::Grounded, 0)
            .unwrap();
        ctx.tick(300, 300);
        ctx.take_outbound();
        (ctx, shooter, target)
    }

    fn for_participant(out: &[Outbound], id: CombatantId) -> Vec<AuthorityMsg> {
        out.iter()
            .filter(|o| o.to.includes(id))
            .map(|o| o.msg.clone())
            .collect()
    }

    fn ammo_updates(out: &[Outbound], id: CombatantId, kind: WeaponKind) -> Vec<u32> {
        out.iter()
            .filter(|o| o.to == Recipient::Participant(id))
            .filter_map(|o| match o.msg {
                AuthorityMsg::NotifyAmmoChanged { weapon, ammo } if weapon == kind => Some(ammo),
                _ => None,
            })
            .collect()
    }

    fn pistol_ammo(ctx: &AuthorityContext, id: CombatantId) -> u32 {
        ctx.weapon(&id, WeaponKind::Pistol).unwrap().ammo()
    }

    #[test]
    fn join_brings_up_default_weapon() {
        let mut ctx = context(EngineConfig::default());
        let id = Uuid::new_v4();
        ctx.join(id, None, 0).unwrap();
        assert_eq!(ctx.current_weapon(&id), Some(DEFAULT_WEAPON));
        assert!(matches!(
            ctx.weapon(&id, DEFAULT_WEAPON).unwrap().state(),
            WeaponState::Equipping { .. }
        ));
        assert!(ctx.join(id, None, 0).is_err());

        ctx.tick(300, 300);
        assert_eq!(ctx.weapon(&id, DEFAULT_WEAPON).unwrap().state(), WeaponState::Active);
    }

    #[test]
    fn start_fire_shoots_acks_and_pays_ammo() {
        let (mut ctx, shooter, target) = duel(EngineConfig::default());
        let before = pistol_ammo(&ctx, shooter);

        let outcome = ctx
            .start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, true, 300)
            .unwrap();
        assert_eq!(outcome, FireOutcome::Started);
        assert_eq!(pistol_ammo(&ctx, shooter), before - 1);

        let out = ctx.take_outbound();
        let mine = for_participant(&out, shooter);
        assert!(mine.contains(&AuthorityMsg::AckFireEvent {
            weapon: WeaponKind::Pistol,
            last_accepted: SequenceIndex(0)
        }));
        assert_eq!(ammo_updates(&out, shooter, WeaponKind::Pistol), vec![before - 1]);

        let damaged = out.iter().any(|o| {
            matches!(&o.msg, AuthorityMsg::CombatantDamaged { report, .. } if report.target == target)
        });
        assert!(damaged);

        // Observers see the flash, the shooter does not
        let flash = |msgs: &[AuthorityMsg]| {
            msgs.iter()
                .any(|m| matches!(m, AuthorityMsg::BroadcastFiringState { flash_count, .. } if *flash_count > 0))
        };
        assert!(flash(&for_participant(&out, target)));
        assert!(!flash(&mine));
    }

    #[test]
    fn suppressed_fire_is_acked_but_not_shot() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        let before = pistol_ammo(&ctx, shooter);
        ctx.set_fire_suppressed(true);

        let result = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 300);
        assert!(matches!(result, Err(FireRejection::IllegalTransition(_))));
        assert_eq!(pistol_ammo(&ctx, shooter), before);
        let out = ctx.take_outbound();
        assert!(for_participant(&out, shooter).contains(&AuthorityMsg::AckFireEvent {
            weapon: WeaponKind::Pistol,
            last_accepted: SequenceIndex(0)
        }));

        ctx.set_fire_suppressed(false);
        let outcome = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(1), None, false, 310);
        assert_eq!(outcome.unwrap(), FireOutcome::Started);
        assert_eq!(pistol_ammo(&ctx, shooter), before - 1);
    }

    #[test]
    fn duplicate_start_is_a_no_op() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 300)
            .unwrap();
        let after_first = pistol_ammo(&ctx, shooter);

        let again = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 310);
        assert!(matches!(again, Err(FireRejection::StaleEvent { .. })));
        assert_eq!(pistol_ammo(&ctx, shooter), after_first);

        ctx.stop_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(1), 320)
            .unwrap_or(FireOutcome::Stopped);
        assert_eq!(
            ctx.weapon(&shooter, WeaponKind::Pistol).unwrap().last_accepted(),
            SequenceIndex(1)
        );
    }

    #[test]
    fn stale_intent_still_acks_current_index() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(5), None, false, 300)
            .unwrap();
        ctx.take_outbound();

        let stale = ctx.stop_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(3), 310);
        assert!(matches!(stale, Err(FireRejection::StaleEvent { .. })));
        let out = ctx.take_outbound();
        assert_eq!(
            for_participant(&out, shooter),
            vec![AuthorityMsg::AckFireEvent {
                weapon: WeaponKind::Pistol,
                last_accepted: SequenceIndex(5)
            }]
        );
        assert!(ctx.weapon(&shooter, WeaponKind::Pistol).unwrap().is_pending(0));
    }

    #[test]
    fn sentinel_is_not_a_fire_index() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        let result = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex::RESYNC, None, false, 300);
        assert!(matches!(result, Err(FireRejection::StaleEvent { .. })));
    }

    #[test]
    fn ammo_never_goes_negative_and_switch_is_requested_once() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        let start = pistol_ammo(&ctx, shooter);
        ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 300)
            .unwrap();

        let mut out = ctx.take_outbound();
        let mut now = 300;
        for _ in 0..2_000 {
            now += 16;
            ctx.tick(now, 16);
            out.extend(ctx.take_outbound());
        }
        let updates = ammo_updates(&out, shooter, WeaponKind::Pistol);
        assert_eq!(updates.len() as u32, start);
        for (n, ammo) in updates.iter().enumerate() {
            assert_eq!(*ammo, start.saturating_sub(n as u32 + 1));
        }
        assert_eq!(pistol_ammo(&ctx, shooter), 0);

        let switches: Vec<_> = out
            .iter()
            .filter(|o| matches!(o.msg, AuthorityMsg::SwitchToBestWeapon { .. }))
            .collect();
        assert_eq!(switches.len(), 1);
        assert_eq!(
            switches[0].msg,
            AuthorityMsg::SwitchToBestWeapon {
                weapon: WeaponKind::RocketLauncher
            }
        );
    }

    #[test]
    fn dead_owner_forces_weapon_inactive() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        ctx.roster_mut()
            .apply_damage(shooter, 500.0, "test", Vec3::ZERO, None);

        let result = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 300);
        assert!(matches!(result, Err(FireRejection::InvalidOwner { .. })));
        assert_eq!(
            ctx.weapon(&shooter, WeaponKind::Pistol).unwrap().state(),
            WeaponState::Inactive
        );
    }

    fn tap_scenario(tap_grace_ms: TimeMs) -> u32 {
        let config = EngineConfig {
            tap_grace_ms,
            ..EngineConfig::default()
        };
        let (mut ctx, shooter, _) = duel(config);
        let pistol = WeaponKind::Pistol;

        // First shot at 300, next allowed at 700
        ctx.start_fire(shooter, pistol, 0, SequenceIndex(0), None, false, 300)
            .unwrap();
        ctx.stop_fire(shooter, pistol, 0, SequenceIndex(1), 320).unwrap();

        // Quick tap during the cooldown
        ctx.start_fire(shooter, pistol, 0, SequenceIndex(2), None, false, 400)
            .unwrap();
        let _ = ctx.stop_fire(shooter, pistol, 0, SequenceIndex(3), 450);

        let mut now = 450;
        while now < 2_000 {
            now += 10;
            ctx.tick(now, 10);
        }
        assert_eq!(ctx.weapon(&shooter, pistol).unwrap().state(), WeaponState::Active);
        ctx.weapon(&shooter, pistol).unwrap().shots_fired()
    }

    #[test]
    fn short_tap_fires_within_grace() {
        assert_eq!(tap_scenario(120), 2);
    }

    #[test]
    fn short_tap_is_lost_without_grace() {
        assert_eq!(tap_scenario(0), 1);
    }

    #[test]
    fn shots_are_seeded_by_the_starting_press() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        let pistol = WeaponKind::Pistol;
        ctx.start_fire(shooter, pistol, 0, SequenceIndex(0), None, false, 300)
            .unwrap();
        ctx.start_fire(shooter, pistol, 1, SequenceIndex(1), None, false, 310)
            .unwrap();
        ctx.stop_fire(shooter, pistol, 1, SequenceIndex(2), 320).unwrap();
        assert_eq!(ctx.start_sequence(&shooter, pistol), Some(SequenceIndex(1)));

        // A repeat press and its stop leave the index alone
        ctx.start_fire(shooter, pistol, 0, SequenceIndex(3), None, false, 330)
            .unwrap();
        assert_eq!(ctx.start_sequence(&shooter, pistol), Some(SequenceIndex(1)));
        assert_eq!(ctx.weapon(&shooter, pistol).unwrap().last_accepted(), SequenceIndex(3));

        ctx.switch_weapon(shooter, WeaponKind::Scattergun, 340).unwrap();
        assert_eq!(ctx.start_sequence(&shooter, pistol), None);
    }

    #[test]
    fn zoom_is_mirrored_and_relayed() {
        let (mut ctx, shooter, target) = duel(EngineConfig::default());
        ctx.switch_weapon(shooter, WeaponKind::SniperRifle, 300).unwrap();
        ctx.set_zoom(
            shooter,
            WeaponKind::SniperRifle,
            ZoomStatus {
                state: ZoomState::ZoomingIn,
                level: 1.7,
            },
        )
        .unwrap();

        let zoom = ctx.weapon(&shooter, WeaponKind::SniperRifle).unwrap().zoom();
        assert_eq!(zoom.level, 1.0);

        let out = ctx.take_outbound();
        let relayed = |msgs: Vec<AuthorityMsg>| msgs.iter().any(|m| matches!(m, AuthorityMsg::ZoomChanged { .. }));
        assert!(relayed(for_participant(&out, target)));
        assert!(!relayed(for_participant(&out, shooter)));
    }

    #[test]
    fn switching_weapons_cancels_deferred_projectiles() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        // 400ms round trip: sleep time 400 - 20 - 120 = 260
        ctx.record_round_trip(shooter, 400);
        ctx.switch_weapon(shooter, WeaponKind::RocketLauncher, 300).unwrap();
        ctx.tick(800, 500);
        ctx.start_fire(shooter, WeaponKind::RocketLauncher, 0, SequenceIndex(0), None, false, 800)
            .unwrap();
        ctx.stop_fire(shooter, WeaponKind::RocketLauncher, 0, SequenceIndex(1), 950)
            .unwrap_or(FireOutcome::Stopped);
        ctx.switch_weapon(shooter, WeaponKind::Pistol, 1_000).unwrap();

        let mut out = ctx.take_outbound();
        for now in (1_000..3_000).step_by(50) {
            ctx.tick(now, 50);
            out.extend(ctx.take_outbound());
        }
        assert!(!out
            .iter()
            .any(|o| matches!(o.msg, AuthorityMsg::ProjectileSpawned { .. })));
        assert!(ctx.projectiles().is_empty());
    }

    #[test]
    fn deferred_projectile_spawns_after_sleep_time() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        ctx.record_round_trip(shooter, 400);
        ctx.switch_weapon(shooter, WeaponKind::RocketLauncher, 300).unwrap();
        ctx.tick(800, 500);
        ctx.start_fire(shooter, WeaponKind::RocketLauncher, 0, SequenceIndex(0), None, false, 800)
            .unwrap();
        assert!(ctx.projectiles().is_empty());

        ctx.tick(1_050, 250);
        assert!(ctx.projectiles().is_empty());
        ctx.tick(1_060, 10);
        assert_eq!(ctx.projectiles().len(), 1);

        let out = ctx.take_outbound();
        let spawned = out.iter().find_map(|o| match o.msg {
            AuthorityMsg::ProjectileSpawned { fast_forward_ms, .. } => Some(fast_forward_ms),
            _ => None,
        });
        assert_eq!(spawned, Some(120));
    }

    #[test]
    fn projectile_is_fast_forwarded_by_prediction_time() {
        let config = EngineConfig {
            prediction_fudge_ms: 0,
            max_prediction_ping_ms: 150,
            ..EngineConfig::default()
        };
        let (mut ctx, shooter, _) = duel(config);
        ctx.record_round_trip(shooter, 150);
        assert_eq!(ctx.prediction_time_ms(&shooter), 150);

        ctx.switch_weapon(shooter, WeaponKind::RocketLauncher, 300).unwrap();
        ctx.tick(800, 500);
        ctx.start_fire(shooter, WeaponKind::RocketLauncher, 0, SequenceIndex(0), None, false, 800)
            .unwrap();

        let rocket = ctx.projectiles().iter().next().unwrap();
        assert!(rocket.forward_ticked);
        let spec = WeaponSpec::for_kind(WeaponKind::RocketLauncher);
        let lifespan = spec.mode(0).unwrap().projectile.unwrap().lifespan_ms;
        assert_eq!(rocket.lifespan_remaining_ms, lifespan - 150);
    }

    #[test]
    fn resync_resends_state() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        assert!(ctx.resync(shooter, WeaponKind::Pistol, SequenceIndex(4)).is_err());
        ctx.resync(shooter, WeaponKind::Pistol, SequenceIndex::RESYNC).unwrap();

        let msgs = for_participant(&ctx.take_outbound(), shooter);
        assert!(matches!(msgs[0], AuthorityMsg::AckFireEvent { .. }));
        assert!(matches!(msgs[1], AuthorityMsg::NotifyAmmoChanged { .. }));
        match &msgs[2] {
            AuthorityMsg::WeaponSnapshots { weapons, .. } => {
                assert_eq!(weapons.len(), WeaponKind::ALL.len());
                assert!(weapons.iter().all(|w| w.owner == shooter));
                assert_eq!(weapons.iter().filter(|w| w.equipped).count(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatch_is_counted_only_with_diagnostics() {
        for enabled in [false, true] {
            let config = EngineConfig {
                debug_hit_mismatch: enabled,
                ..EngineConfig::default()
            };
            let (mut ctx, shooter, target) = duel(config);
            // Aim well away from the target but claim a hit
            ctx.update_movement(shooter, Vec3::ZERO, Vec3::Y, MovementState::Grounded, 300)
                .unwrap();
            ctx.report_hit(shooter, WeaponKind::Pistol, target, SequenceIndex(0))
                .unwrap();
            ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, true, 300)
                .unwrap();
            assert_eq!(ctx.hit_mismatches(), u64::from(enabled));
            assert_eq!(ctx.roster().get(&target).unwrap().health, 100.0);
        }
    }

    #[test]
    fn kill_schedules_respawn() {
        let (mut ctx, shooter, target) = duel(EngineConfig::default());
        ctx.roster_mut()
            .apply_damage(target, 90.0, "test", Vec3::ZERO, None);
        ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 300)
            .unwrap();
        assert!(!ctx.roster().is_alive(&target));

        ctx.tick(300 + RESPAWN_DELAY_MS, 16);
        assert!(ctx.roster().is_alive(&target));
        assert!(matches!(
            ctx.weapon(&target, DEFAULT_WEAPON).unwrap().state(),
            WeaponState::Equipping { .. }
        ));
    }

    #[test]
    fn leave_forgets_everything() {
        let (mut ctx, shooter, _) = duel(EngineConfig::default());
        assert!(ctx.leave(shooter));
        assert!(!ctx.leave(shooter));
        assert!(!ctx.is_participant(&shooter));
        assert!(ctx.roster().get(&shooter).is_none());
        let result = ctx.start_fire(shooter, WeaponKind::Pistol, 0, SequenceIndex(0), None, false, 400);
        assert!(matches!(result, Err(FireRejection::InvalidOwner { .. })));
    }
}
