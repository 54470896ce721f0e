//! Controller-side weapon context
//!
//! Runs the same weapon state machines as the authority, but only to gate
//! input and drive local effects. Every accepted press or release becomes a
//! sequenced intent in that weapon's fire queue. Ammo is adopted from the
//! authority and never decided here.

use std::collections::{BTreeMap, HashMap};

use glam::Vec3;
use tracing::debug;

use crate::config::EngineConfig;
use crate::util::time::TimeMs;
use crate::ws::protocol::{AuthorityMsg, ControllerMsg};

use super::authority::DEFAULT_WEAPON;
use super::capabilities::{Fireable, WorldGeometry};
use super::combat::{Combatant, MovementState, Roster};
use super::error::FireRejection;
use super::fire_queue::{FireEventKind, FireEventQueue, FireEventRecord};
use super::prediction::PredictionContext;
use super::projectile::{ProjectileLaunch, ProjectileSet, ShotKey};
use super::scheduler::Scheduler;
use super::sequence::SequenceIndex;
use super::weapon::{
    shot_seed, spread_direction, CombatantId, ContextRole, FireGate, FireHooks, FireKind, FireModeId,
    FireOutcome, ShotRequest, TapWindow, WeaponEvent, WeaponInstance, WeaponKind, WeaponRef, WeaponSpec,
    ZoomState,
};
use super::world::StaticWorld;

/// Timers owned by the controller, scoped per weapon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTask {
    DrainQueue,
    DeferredStop { mode: FireModeId },
}

pub struct LocalContext<W = StaticWorld> {
    participant: CombatantId,
    hooks: FireHooks,
    world: W,
    session_seed: u64,
    prediction: PredictionContext,
    /// Just the local combatant; supplies the muzzle
    roster: Roster,
    weapons: BTreeMap<WeaponKind, WeaponInstance>,
    queues: BTreeMap<WeaponKind, FireEventQueue>,
    timers: Scheduler<WeaponKind, LocalTask>,
    fakes: ProjectileSet,
    current: Option<WeaponKind>,
    /// Index of the start intent behind the current firing sequence
    start_sequences: HashMap<WeaponKind, SequenceIndex>,
    /// Releases held back until the press fires, same rule as the authority
    taps: HashMap<(WeaponKind, FireModeId), TapWindow>,
    sent_zoom: HashMap<WeaponKind, ZoomState>,
    tap_grace_ms: TimeMs,
    drain_interval_ms: TimeMs,
    outgoing: Vec<ControllerMsg>,
}

impl<W: WorldGeometry> LocalContext<W> {
    pub fn new(participant: CombatantId, config: &EngineConfig, hooks: FireHooks, world: W) -> Self {
        let weapons = WeaponKind::ALL
            .iter()
            .map(|&kind| {
                let weapon = WeaponInstance::new(
                    WeaponRef::new(participant, kind),
                    WeaponSpec::for_kind(kind),
                    ContextRole::Controller,
                );
                (kind, weapon)
            })
            .collect();
        let queues = WeaponKind::ALL
            .iter()
            .map(|&kind| (kind, FireEventQueue::new(kind, config.fire_queue_drain_ms)))
            .collect();
        let mut roster = Roster::new();
        roster.insert(Combatant::new(participant, None, Vec3::ZERO));

        Self {
            participant,
            hooks,
            world,
            session_seed: 0,
            prediction: PredictionContext::from_config(config),
            roster,
            weapons,
            queues,
            timers: Scheduler::new(),
            fakes: ProjectileSet::new(),
            current: None,
            start_sequences: HashMap::new(),
            taps: HashMap::new(),
            sent_zoom: HashMap::new(),
            tap_grace_ms: config.tap_grace_ms,
            drain_interval_ms: config.fire_queue_drain_ms,
            outgoing: Vec::new(),
        }
    }

    pub fn participant(&self) -> CombatantId {
        self.participant
    }

    pub fn current_weapon(&self) -> Option<WeaponKind> {
        self.current
    }

    pub fn weapon(&self, kind: WeaponKind) -> Option<&WeaponInstance> {
        self.weapons.get(&kind)
    }

    pub fn queue(&self, kind: WeaponKind) -> Option<&FireEventQueue> {
        self.queues.get(&kind)
    }

    /// Index this weapon's shots are seeded with
    pub fn start_sequence(&self, kind: WeaponKind) -> Option<SequenceIndex> {
        self.start_sequences.get(&kind).copied()
    }

    pub fn fakes(&self) -> &ProjectileSet {
        &self.fakes
    }

    pub fn prediction(&self) -> &PredictionContext {
        &self.prediction
    }

    /// Messages for the authority, in send order
    pub fn take_outgoing(&mut self) -> Vec<ControllerMsg> {
        std::mem::take(&mut self.outgoing)
    }

    fn gate(&self) -> FireGate {
        let (owner_alive, movement) = self
            .roster
            .get(&self.participant)
            .map(|c| (c.alive, c.movement))
            .unwrap_or((false, MovementState::default()));
        FireGate {
            owner_alive,
            movement,
            fire_suppressed: false,
        }
    }

    /// Press a fire mode on the current weapon
    pub fn press(
        &mut self,
        mode: FireModeId,
        aux_offset: Option<f32>,
        locally_hit: bool,
        now: TimeMs,
    ) -> Result<FireOutcome, FireRejection> {
        let kind = self.current.ok_or(FireRejection::IllegalTransition("no weapon equipped"))?;
        let gate = self.gate();
        let weapon = self.weapons.get_mut(&kind).ok_or(FireRejection::UnknownWeapon {
            owner: self.participant,
            weapon: kind,
        })?;
        let tap = TapWindow::open(weapon, now);
        let outcome = weapon.begin_firing(mode, &gate, &self.hooks, now)?;

        let record = self.emit(kind, mode, FireEventKind::Start, aux_offset, locally_hit, now);
        if outcome != FireOutcome::AlreadyFiring {
            self.start_sequences.insert(kind, record.sequence);
        }
        if !matches!(outcome, FireOutcome::MultiPress { .. }) {
            if let Some(task) = self.taps.insert((kind, mode), tap).and_then(|t| t.deferred_stop) {
                self.timers.cancel(task);
            }
        }
        self.advance(kind, now, 0);
        Ok(outcome)
    }

    /// Release a fire mode on the current weapon
    pub fn release(&mut self, mode: FireModeId, now: TimeMs) -> Result<FireOutcome, FireRejection> {
        let kind = self.current.ok_or(FireRejection::IllegalTransition("no weapon equipped"))?;
        let weapon = self.weapons.get_mut(&kind).ok_or(FireRejection::UnknownWeapon {
            owner: self.participant,
            weapon: kind,
        })?;

        if let Some(tap) = self.taps.get_mut(&(kind, mode)) {
            if tap.holds_release(weapon, mode, now, self.tap_grace_ms) {
                if tap.deferred_stop.is_none() {
                    tap.deferred_stop = Some(self.timers.schedule(
                        now,
                        TapWindow::fallback_ms(weapon, mode, self.tap_grace_ms),
                        kind,
                        LocalTask::DeferredStop { mode },
                    ));
                }
                self.emit(kind, mode, FireEventKind::Stop, None, false, now);
                return Ok(FireOutcome::Deferred);
            }
        }

        self.taps.remove(&(kind, mode));
        let outcome = weapon.end_firing(mode, now)?;
        self.emit(kind, mode, FireEventKind::Stop, None, false, now);
        self.sync_zoom(kind);
        Ok(outcome)
    }

    /// The held-back release lands once the tap has fired or timed out
    fn apply_deferred_stop(&mut self, kind: WeaponKind, mode: FireModeId, now: TimeMs) {
        let Some(task) = self.taps.get(&(kind, mode)).and_then(|t| t.deferred_stop) else {
            return;
        };
        self.timers.cancel(task);
        self.taps.remove(&(kind, mode));
        if let Some(weapon) = self.weapons.get_mut(&kind) {
            let _ = weapon.end_firing(mode, now);
        }
        self.sync_zoom(kind);
    }

    fn emit(
        &mut self,
        kind: WeaponKind,
        mode: FireModeId,
        event: FireEventKind,
        aux_offset: Option<f32>,
        locally_hit: bool,
        now: TimeMs,
    ) -> FireEventRecord {
        let drain_interval_ms = self.drain_interval_ms;
        let queue = self
            .queues
            .entry(kind)
            .or_insert_with(|| FireEventQueue::new(kind, drain_interval_ms));
        let record = queue.record(mode, event, aux_offset, locally_hit);
        let record = queue.emit(record, now, &mut self.timers, LocalTask::DrainQueue);
        self.outgoing.push(intent_message(&record));
        record
    }

    /// Tell the authority which combatant the local trace hit
    pub fn report_hit(&mut self, target: CombatantId) {
        let Some(kind) = self.current else {
            return;
        };
        let seq = self
            .start_sequences
            .get(&kind)
            .copied()
            .unwrap_or(SequenceIndex::RESYNC);
        self.outgoing.push(ControllerMsg::ReportHitScanTarget {
            weapon: kind,
            target_id: target,
            seq,
        });
    }

    /// Put the current weapon away at once and bring `kind` up
    pub fn switch_weapon(&mut self, kind: WeaponKind, now: TimeMs) -> Result<(), FireRejection> {
        if !self.weapons.contains_key(&kind) {
            return Err(FireRejection::UnknownWeapon {
                owner: self.participant,
                weapon: kind,
            });
        }
        if let Some(old) = self.current {
            self.drop_weapon(old);
        }
        if let Some(weapon) = self.weapons.get_mut(&kind) {
            weapon.equip(now)?;
        }
        self.current = Some(kind);
        self.outgoing.push(ControllerMsg::SwitchWeapon { weapon: kind });
        Ok(())
    }

    /// Force Inactive and discard every unsent intent for the weapon
    fn drop_weapon(&mut self, kind: WeaponKind) {
        if let Some(queue) = self.queues.get_mut(&kind) {
            let dropped = queue.flush(&mut self.timers);
            if dropped > 0 {
                debug!(participant_id = %self.participant, weapon = ?kind, dropped, "fire queue flushed");
            }
        }
        self.timers.cancel_scope(kind);
        if let Some(weapon) = self.weapons.get_mut(&kind) {
            weapon.force_inactive();
        }
        self.start_sequences.remove(&kind);
        self.taps.retain(|(k, _), _| *k != kind);
        self.sent_zoom.remove(&kind);
    }

    /// Local pose from the movement system, forwarded to the authority
    pub fn set_movement(&mut self, position: Vec3, aim: Vec3, movement: MovementState) {
        if let Some(me) = self.roster.get_mut(&self.participant) {
            me.position = position;
            me.aim = aim.normalize_or(me.aim);
            me.movement = movement;
        }
        self.outgoing.push(ControllerMsg::UpdateMovement {
            position,
            aim,
            movement,
        });
    }

    /// Queue a latency probe; the pong is echoed so both ends get a sample
    pub fn ping(&mut self, now: TimeMs) {
        self.outgoing.push(ControllerMsg::Ping { t: now });
    }

    /// Ask for a full resend of one weapon's authoritative state
    pub fn request_resync(&mut self, kind: WeaponKind) {
        self.outgoing.push(ControllerMsg::RequestResync {
            weapon: kind,
            seq: SequenceIndex::RESYNC,
        });
    }

    /// Apply one message from the authority
    pub fn handle(&mut self, msg: &AuthorityMsg, now: TimeMs) {
        match msg {
            AuthorityMsg::Welcome { session_seed, .. } => {
                self.session_seed = *session_seed;
                if self.current.is_none() {
                    if let Some(weapon) = self.weapons.get_mut(&DEFAULT_WEAPON) {
                        if weapon.equip(now).is_ok() {
                            self.current = Some(DEFAULT_WEAPON);
                        }
                    }
                }
            }
            AuthorityMsg::AckFireEvent {
                weapon,
                last_accepted,
            } => {
                if let Some(queue) = self.queues.get_mut(weapon) {
                    queue.acknowledge(*last_accepted, &mut self.timers);
                }
            }
            AuthorityMsg::NotifyAmmoChanged { weapon, ammo } => {
                if let Some(w) = self.weapons.get_mut(weapon) {
                    w.sync_ammo(*ammo);
                }
            }
            AuthorityMsg::ProjectileSpawned {
                owner,
                weapon,
                shot_number,
                ..
            } if *owner == self.participant => {
                self.fakes
                    .reconcile(WeaponRef::new(*owner, *weapon), *shot_number);
            }
            AuthorityMsg::SwitchToBestWeapon { weapon } => {
                if self.current != Some(*weapon) {
                    let _ = self.switch_weapon(*weapon, now);
                }
            }
            AuthorityMsg::WeaponSnapshots { weapons, .. } => {
                for snapshot in weapons.iter().filter(|s| s.owner == self.participant) {
                    if let Some(w) = self.weapons.get_mut(&snapshot.weapon) {
                        w.sync_ammo(snapshot.ammo);
                    }
                    if let Some(queue) = self.queues.get_mut(&snapshot.weapon) {
                        if queue.is_empty() {
                            queue.reset_acknowledged(snapshot.last_accepted);
                        }
                    }
                }
            }
            AuthorityMsg::CombatantDamaged { report, .. } if report.target == self.participant => {
                if let Some(me) = self.roster.get_mut(&self.participant) {
                    me.health = report.remaining_health;
                    me.alive = !report.killed;
                }
                if report.killed {
                    for kind in WeaponKind::ALL {
                        self.drop_weapon(kind);
                    }
                }
            }
            AuthorityMsg::Pong { t, server_time } => {
                self.prediction.record_round_trip(now.saturating_sub(*t));
                self.outgoing.push(ControllerMsg::Echo {
                    server_time: *server_time,
                });
            }
            _ => {}
        }
    }

    /// Respawned by the authority: full health, default weapon coming up
    pub fn respawned(&mut self, position: Vec3, now: TimeMs) {
        self.roster.respawn(&self.participant, position);
        self.current = None;
        let _ = self.switch_weapon(DEFAULT_WEAPON, now);
    }

    /// One frame: resend timers, the current weapon, fakes
    pub fn tick(&mut self, now: TimeMs, dt_ms: TimeMs) {
        for (kind, task) in self.timers.drain_due(now) {
            match task {
                LocalTask::DrainQueue => {
                    let Some(queue) = self.queues.get_mut(&kind) else {
                        continue;
                    };
                    if let Some(record) = queue.drain(now, &mut self.timers, LocalTask::DrainQueue) {
                        self.outgoing.push(intent_message(&record));
                    }
                }
                LocalTask::DeferredStop { mode } => self.apply_deferred_stop(kind, mode, now),
            }
        }

        if let Some(kind) = self.current {
            self.advance(kind, now, dt_ms);
        }
        self.fakes.tick(dt_ms, &self.world, &self.roster);
    }

    fn advance(&mut self, kind: WeaponKind, now: TimeMs, dt_ms: TimeMs) {
        let Some(weapon) = self.weapons.get_mut(&kind) else {
            return;
        };
        for event in weapon.tick(now, dt_ms) {
            match event {
                WeaponEvent::Shot(shot) => {
                    self.predict_shot(shot, now);
                    self.apply_deferred_stop(kind, shot.mode, now);
                }
                WeaponEvent::OutOfAmmo => {
                    debug!(participant_id = %self.participant, weapon = ?kind, "local weapon dry")
                }
                WeaponEvent::BecameActive | WeaponEvent::BecameInactive | WeaponEvent::ZoomSettled(_) => {}
            }
        }
        self.sync_zoom(kind);
    }

    /// Projectile weapons get a fake right away; instant hits are effects only
    fn predict_shot(&mut self, shot: ShotRequest, now: TimeMs) {
        let kind = shot.weapon.kind;
        let Some(spec) = self
            .weapons
            .get(&kind)
            .and_then(|w| w.spec().mode(shot.mode))
            .cloned()
        else {
            return;
        };
        if spec.kind != FireKind::Projectile {
            return;
        }
        let Some(projectile) = spec.projectile else {
            return;
        };
        let Some(muzzle) = self.roster.muzzle(self.participant, None) else {
            return;
        };
        let sequence = self
            .start_sequences
            .get(&kind)
            .copied()
            .unwrap_or(SequenceIndex::RESYNC);
        let seed = shot_seed(self.session_seed, shot.weapon, sequence, shot.shot_number);
        let launch = ProjectileLaunch {
            key: ShotKey {
                weapon: shot.weapon,
                sequence,
                shot_number: shot.shot_number,
            },
            origin: muzzle.origin,
            direction: spread_direction(muzzle.direction, spec.spread, seed),
            spec: projectile,
            damage: spec.damage,
            momentum: spec.momentum,
            cause: spec.cause,
        };
        self.fakes.spawn_fake(&launch, &self.prediction, now);
    }

    /// Zoom is decided here; tell the authority whenever its phase changes
    fn sync_zoom(&mut self, kind: WeaponKind) {
        let Some(weapon) = self.weapons.get(&kind) else {
            return;
        };
        if weapon.spec().zoom.is_none() {
            return;
        }
        let zoom = weapon.zoom();
        let previous = self.sent_zoom.get(&kind).copied().unwrap_or(ZoomState::Off);
        if previous != zoom.state {
            self.sent_zoom.insert(kind, zoom.state);
            self.outgoing.push(ControllerMsg::SetZoom { weapon: kind, zoom });
        }
    }
}

fn intent_message(record: &FireEventRecord) -> ControllerMsg {
    match record.kind {
        FireEventKind::Start => ControllerMsg::RequestStartFire {
            weapon: record.weapon,
            fire_mode: record.fire_mode,
            seq: record.sequence,
            aux_offset: record.aux_offset,
            locally_hit: record.locally_hit,
        },
        FireEventKind::Stop => ControllerMsg::RequestStopFire {
            weapon: record.weapon,
            fire_mode: record.fire_mode,
            seq: record.sequence,
        },
    }
}
